//! Pass manifest types and canonical serialization.
//!
//! The manifest maps every asset's relative name to the hex digest of its
//! content. Its serialized bytes are what gets signed, so there is exactly
//! one serializer:
//! - entries ordered lexicographically by relative name (byte order)
//! - a JSON object with one-space indentation
//! - no trailing newline

use crate::hasher::{DigestAlgorithm, HashedAsset};
use crate::{BundleError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Manifest file name within the bundle.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Detached signature file name within the bundle.
pub const SIGNATURE_FILE_NAME: &str = "signature";

/// Names an asset may not use because the bundle reserves them.
pub const RESERVED_NAMES: &[&str] = &[MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME];

/// Ordered mapping from relative file name to content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassManifest {
    algorithm: DigestAlgorithm,
    entries: BTreeMap<String, String>,
}

impl PassManifest {
    /// Create an empty manifest.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            entries: BTreeMap::new(),
        }
    }

    /// Build a manifest from hasher output.
    pub fn from_hashed(assets: &[HashedAsset], algorithm: DigestAlgorithm) -> Result<Self> {
        let mut manifest = Self::new(algorithm);
        for asset in assets {
            manifest.insert(&asset.file.relative_name, &asset.digest)?;
        }
        Ok(manifest)
    }

    /// Add an entry after validating the name and digest.
    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) -> Result<()> {
        let name = name.into();
        let digest = digest.into();
        validate_name(&name)?;
        validate_digest(&name, &digest, self.algorithm)?;
        self.entries.insert(name, digest);
        Ok(())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in serialization order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Relative names in serialization order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn digest_for(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Canonical byte form. These exact bytes are signed.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        if self.entries.is_empty() {
            return Err(BundleError::Serialization(
                "manifest has no entries".to_string(),
            ));
        }

        let mut out = Vec::with_capacity(self.entries.len() * 64);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.entries
            .serialize(&mut ser)
            .map_err(|e| BundleError::Serialization(e.to_string()))?;
        Ok(out)
    }

    /// Serialize fully, then move into place with a single rename.
    ///
    /// Returns the bytes that were written.
    pub fn write_atomic(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = self.to_canonical_bytes()?;
        write_file_atomic(path, &bytes)?;
        debug!(path = %path.display(), entries = self.len(), "Manifest written");
        Ok(bytes)
    }

    /// Parse a manifest read from a bundle. The digest algorithm is inferred
    /// from the digest length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let entries: BTreeMap<String, String> = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::CorruptedManifest(e.to_string()))?;

        let algorithm = match entries.values().next().map(String::len) {
            None => {
                return Err(BundleError::CorruptedManifest(
                    "manifest has no entries".to_string(),
                ))
            }
            Some(40) => DigestAlgorithm::Sha1,
            Some(64) => DigestAlgorithm::Sha256,
            Some(n) => {
                return Err(BundleError::CorruptedManifest(format!(
                    "unrecognised digest length {}",
                    n
                )))
            }
        };

        let mut manifest = Self::new(algorithm);
        for (name, digest) in entries {
            manifest
                .insert(name, digest)
                .map_err(|e| BundleError::CorruptedManifest(e.to_string()))?;
        }
        Ok(manifest)
    }

    /// Check that `data` matches the digest recorded for `name`.
    pub fn verify_member(&self, name: &str, data: &[u8]) -> Result<()> {
        let expected = self
            .digest_for(name)
            .ok_or_else(|| BundleError::UnexpectedMember(name.to_string()))?;
        let actual = self.algorithm.digest_hex(data);
        // Hex case is not significant; other tools write uppercase digests.
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(BundleError::ChecksumMismatch {
                path: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let reject = |why: &str| Err(BundleError::Serialization(format!("invalid name {:?}: {}", name, why)));

    if name.is_empty() {
        return reject("empty");
    }
    if name.starts_with('/') {
        return reject("absolute path");
    }
    if name.contains('\\') {
        return reject("contains a backslash");
    }
    if name.chars().any(char::is_control) {
        return reject("contains a control character");
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return reject("contains an empty, '.' or '..' component");
    }
    if RESERVED_NAMES.contains(&name) {
        return reject("reserved for bundle metadata");
    }
    Ok(())
}

fn validate_digest(name: &str, digest: &str, algorithm: DigestAlgorithm) -> Result<()> {
    if digest.len() != algorithm.hex_len() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BundleError::Serialization(format!(
            "file '{}' has an invalid {} digest",
            name, algorithm
        )));
    }
    Ok(())
}

/// Write `data` next to `path` and rename it into place.
pub(crate) fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BundleError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| BundleError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BundleError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| BundleError::io(path, e.error))?;
    Ok(())
}
