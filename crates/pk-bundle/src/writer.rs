//! Archive packager for `.pkpass` bundles.
//!
//! Writes manifest, signature and staged assets into one ZIP archive with a
//! fixed member list. The archive is assembled in a temporary file next to
//! the output and renamed into place only once it is complete.

use crate::hasher::{hash_file, DigestAlgorithm};
use crate::manifest::{PassManifest, MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME};
use crate::{BundleError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, DateTime};

/// Bundle file extension.
pub const BUNDLE_EXTENSION: &str = "pkpass";

/// The members a bundle for `manifest` must contain, in archive order:
/// manifest, signature, then every asset in manifest order.
pub fn member_list(manifest: &PassManifest) -> Vec<String> {
    let mut members = Vec::with_capacity(manifest.len() + 2);
    members.push(MANIFEST_FILE_NAME.to_string());
    members.push(SIGNATURE_FILE_NAME.to_string());
    members.extend(manifest.names().map(str::to_string));
    members
}

/// A finished archive on disk.
#[derive(Debug, Clone, Serialize)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub members: Vec<String>,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    /// SHA-256 of the archive file.
    pub sha256: String,
}

/// Packs files found under a root directory into a bundle archive.
pub struct ArchiveWriter {
    root: PathBuf,
}

impl ArchiveWriter {
    /// Members are resolved relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write exactly `members` into `output`.
    ///
    /// Fails with `MemberNotFound` as soon as a member cannot be opened; in
    /// that case nothing exists at `output`.
    pub fn write(&self, output: &Path, members: &[String]) -> Result<PackagedArchive> {
        let mut seen = HashSet::new();
        if let Some(dup) = members.iter().find(|m| !seen.insert(m.as_str())) {
            return Err(BundleError::ArchiveWrite(format!("duplicate member '{}'", dup)));
        }

        let out_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let write_err = |what: &str, e: &dyn std::fmt::Display| {
            BundleError::ArchiveWrite(format!("{} {}: {}", what, output.display(), e))
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".pkpass-")
            .suffix(".partial")
            .tempfile_in(out_dir)
            .map_err(|e| write_err("cannot create", &e))?;

        let options: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);

        let mut uncompressed_bytes = 0u64;
        {
            let mut zip = ZipWriter::new(tmp.as_file_mut());

            for member in members {
                let path = self.root.join(member);
                let mut file = File::open(&path).map_err(|e| {
                    debug!(path = %path.display(), error = %e, "Member cannot be opened");
                    BundleError::MemberNotFound(member.clone())
                })?;

                zip.start_file(member.as_str(), options)
                    .map_err(|e| write_err("cannot add member to", &e))?;
                uncompressed_bytes += io::copy(&mut file, &mut zip)
                    .map_err(|e| write_err("cannot write member into", &e))?;
            }

            zip.finish().map_err(|e| write_err("cannot finish", &e))?;
        }

        tmp.as_file()
            .sync_all()
            .map_err(|e| write_err("cannot sync", &e))?;
        let compressed_bytes = tmp
            .as_file()
            .metadata()
            .map_err(|e| write_err("cannot stat", &e))?
            .len();
        let sha256 = hash_file(tmp.path(), DigestAlgorithm::Sha256)?;

        tmp.persist(output)
            .map_err(|e| write_err("cannot move archive to", &e.error))?;

        info!(
            path = %output.display(),
            members = members.len(),
            uncompressed_bytes,
            compressed_bytes,
            "Bundle written"
        );

        Ok(PackagedArchive {
            path: output.to_path_buf(),
            members: members.to_vec(),
            uncompressed_bytes,
            compressed_bytes,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn root_with(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, data) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        dir
    }

    fn names(members: &[&str]) -> Vec<String> {
        members.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn test_member_list_order() {
        let mut manifest = PassManifest::new(DigestAlgorithm::Sha1);
        manifest.insert("pass.json", "a".repeat(40)).unwrap();
        manifest.insert("icon.png", "b".repeat(40)).unwrap();

        assert_eq!(
            member_list(&manifest),
            names(&["manifest.json", "signature", "icon.png", "pass.json"])
        );
    }

    #[test]
    fn test_write_preserves_names_order_and_method() {
        let root = root_with(&[
            ("manifest.json", b"{}"),
            ("signature", b"\x30\x80"),
            ("icon.png", b"ICNX"),
            ("en.lproj/pass.strings", b"\"a\" = \"b\";"),
        ]);
        let out = TempDir::new().unwrap();
        let output = out.path().join("Generic.pkpass");
        let members = names(&["manifest.json", "signature", "en.lproj/pass.strings", "icon.png"]);

        let archive = ArchiveWriter::new(root.path()).write(&output, &members).unwrap();
        assert_eq!(archive.members, members);
        assert_eq!(archive.sha256.len(), 64);

        let mut zip = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        assert_eq!(zip.len(), 4);
        for (i, expected) in members.iter().enumerate() {
            let entry = zip.by_index(i).unwrap();
            assert_eq!(entry.name(), expected);
            assert_eq!(entry.compression(), CompressionMethod::Deflated);
        }

        let mut icon = String::new();
        zip.by_name("icon.png").unwrap().read_to_string(&mut icon).unwrap();
        assert_eq!(icon, "ICNX");
    }

    #[test]
    fn test_missing_member_leaves_no_archive() {
        let root = root_with(&[("manifest.json", b"{}"), ("signature", b"sig")]);
        let out = TempDir::new().unwrap();
        let output = out.path().join("Generic.pkpass");

        let err = ArchiveWriter::new(root.path())
            .write(&output, &names(&["manifest.json", "signature", "logo.png"]))
            .unwrap_err();

        assert!(matches!(err, BundleError::MemberNotFound(ref m) if m == "logo.png"));
        assert!(!output.exists());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let root = root_with(&[("icon.png", b"ICNX")]);
        let output = root.path().join("out.pkpass");
        let err = ArchiveWriter::new(root.path())
            .write(&output, &names(&["icon.png", "icon.png"]))
            .unwrap_err();
        assert!(matches!(err, BundleError::ArchiveWrite(_)));
    }

    #[test]
    fn test_same_inputs_same_archive() {
        let root = root_with(&[("manifest.json", b"{}"), ("signature", b"sig"), ("icon.png", b"ICNX")]);
        let members = names(&["manifest.json", "signature", "icon.png"]);
        let writer = ArchiveWriter::new(root.path());

        let a = writer.write(&root.path().join("a.pkpass"), &members).unwrap();
        let b = writer.write(&root.path().join("b.pkpass"), &members).unwrap();
        assert_eq!(a.sha256, b.sha256);
    }

    #[test]
    fn test_unwritable_output_is_archive_write_error() {
        let root = root_with(&[("icon.png", b"ICNX")]);
        let output = root.path().join("no/such/dir/out.pkpass");
        let err = ArchiveWriter::new(root.path())
            .write(&output, &names(&["icon.png"]))
            .unwrap_err();
        assert!(matches!(err, BundleError::ArchiveWrite(_)));
    }
}
