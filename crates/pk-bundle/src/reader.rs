//! Bundle reader for opening and verifying `.pkpass` files.
//!
//! Checks that the member set is exactly {manifest, signature, manifest
//! entries}, that every member matches its manifest digest, and that the
//! detached signature covers the manifest bytes found in the archive.

use crate::manifest::{PassManifest, MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME};
use crate::signing::{verify_detached, Trust};
use crate::writer::member_list;
use crate::{BundleError, DigestAlgorithm, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Outcome of a full verification.
#[derive(Debug, Clone, Serialize)]
pub struct BundleVerification {
    pub members: usize,
    pub algorithm: DigestAlgorithm,
    /// False when the signature was checked without a trusted authority.
    pub chain_verified: bool,
}

/// Reader for `.pkpass` bundles with verification.
pub struct BundleReader<R: Read + Seek> {
    manifest: PassManifest,
    manifest_bytes: Vec<u8>,
    signature: Vec<u8>,
    archive: ZipArchive<R>,
    verified: HashMap<String, bool>,
}

impl BundleReader<File> {
    /// Open a bundle from a file path.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BundleError::io(path, e))?;
        Self::from_reader(file)
    }
}

impl BundleReader<Cursor<Vec<u8>>> {
    /// Open a bundle from bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_reader(Cursor::new(bytes))
    }
}

impl<R: Read + Seek> BundleReader<R> {
    /// Create a reader from any Read + Seek source.
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;

        let manifest_bytes = Self::read_member(&mut archive, MANIFEST_FILE_NAME)?;
        let signature = Self::read_member(&mut archive, SIGNATURE_FILE_NAME)?;
        let manifest = PassManifest::parse(&manifest_bytes)?;

        info!(
            entries = manifest.len(),
            algorithm = %manifest.algorithm(),
            "Bundle opened"
        );

        Ok(Self {
            manifest,
            manifest_bytes,
            signature,
            archive,
            verified: HashMap::new(),
        })
    }

    fn read_member(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
        let mut file = archive
            .by_name(name)
            .map_err(|_| BundleError::MissingFile(name.to_string()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| BundleError::io(name, e))?;
        Ok(data)
    }

    /// Get the manifest.
    pub fn manifest(&self) -> &PassManifest {
        &self.manifest
    }

    /// Manifest bytes exactly as stored in the archive.
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// Detached DER signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Member names in archive order, directory entries excluded.
    pub fn member_names(&self) -> Vec<String> {
        self.archive
            .file_names()
            .filter(|n| !n.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    /// Read a member without verification.
    pub fn read_raw(&mut self, name: &str) -> Result<Vec<u8>> {
        let data = Self::read_member(&mut self.archive, name)?;
        debug!(name, bytes = data.len(), "Read member (unverified)");
        Ok(data)
    }

    /// Read a member and check it against the manifest digest.
    pub fn read_verified(&mut self, name: &str) -> Result<Vec<u8>> {
        let data = self.read_raw(name)?;
        self.manifest.verify_member(name, &data)?;
        self.verified.insert(name.to_string(), true);
        Ok(data)
    }

    /// Check if a member has been verified.
    pub fn is_verified(&self, name: &str) -> bool {
        self.verified.get(name).copied().unwrap_or(false)
    }

    /// Check the member set and every member digest.
    pub fn verify_members(&mut self) -> Result<usize> {
        let expected: BTreeSet<String> = member_list(&self.manifest).into_iter().collect();
        let actual: BTreeSet<String> = self.member_names().into_iter().collect();

        if let Some(extra) = actual.difference(&expected).next() {
            warn!(member = %extra, "Archive has a member the manifest does not list");
            return Err(BundleError::UnexpectedMember(extra.clone()));
        }
        if let Some(missing) = expected.difference(&actual).next() {
            return Err(BundleError::MissingFile(missing.clone()));
        }

        let names: Vec<String> = self.manifest.names().map(str::to_string).collect();
        for name in &names {
            self.read_verified(name)?;
        }

        debug!(members = actual.len(), "All members verified");
        Ok(actual.len())
    }

    /// Check the detached signature over the stored manifest bytes.
    pub fn verify_signature(&self, trust: &Trust) -> Result<()> {
        verify_detached(&self.manifest_bytes, &self.signature, trust)
    }

    /// Members, digests and signature in one pass.
    pub fn verify(&mut self, trust: &Trust) -> Result<BundleVerification> {
        let members = self.verify_members()?;
        self.verify_signature(trust)?;

        let chain_verified = matches!(trust, Trust::Authorities(_));
        info!(members, chain_verified, "Bundle verified");

        Ok(BundleVerification {
            members,
            algorithm: self.manifest.algorithm(),
            chain_verified,
        })
    }
}
