//! Signed pass bundle builder.
//!
//! Turns a directory of pass assets into a signed `.pkpass` bundle and
//! verifies existing bundles.
//!
//! # Bundle Format
//!
//! Bundles are ZIP archives containing exactly:
//! - `manifest.json`: every asset's relative name mapped to its hex digest
//! - `signature`: detached DER PKCS#7 signature over the manifest bytes
//! - the assets themselves, under their relative names
//!
//! # Build
//!
//! A build hashes the asset root, writes the manifest into the build root,
//! extracts the signing certificate and key from a PKCS#12 container, signs
//! the manifest, moves the assets into the build root, packs the archive and
//! then moves every asset back. The asset root ends up as it started
//! whether the build succeeds or not. If the process is killed mid-build,
//! the journal it left in the asset root lets [`recover`] finish the job.
//!
//! # Example
//!
//! ```no_run
//! use pk_bundle::{BackendKind, BuildRequest, BundleReader, HashOptions, PassBuilder, Secret, SigningConfig, Trust};
//! use std::path::{Path, PathBuf};
//!
//! let request = BuildRequest {
//!     asset_root: PathBuf::from("Generic.pass"),
//!     build_root: PathBuf::from("build"),
//!     name: "Generic".to_string(),
//!     signing: SigningConfig {
//!         container: PathBuf::from("Certificates.p12"),
//!         unlock: Secret::new("container password"),
//!         protection: Secret::new("key password"),
//!         authority: PathBuf::from("authority.pem"),
//!     },
//!     hashing: HashOptions::default(),
//!     retain_signing_material: false,
//!     backend: BackendKind::Openssl,
//! };
//! let report = PassBuilder::new(request).build().unwrap();
//!
//! let trust = Trust::from_authority_file(Path::new("authority.pem")).unwrap();
//! let mut reader = BundleReader::open(&report.output).unwrap();
//! reader.verify(&trust).unwrap();
//! ```

pub mod error;
pub mod hasher;
pub mod manifest;
pub mod pipeline;
pub mod reader;
pub mod signing;
pub mod staging;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{
    BuildError, BuildStage, BundleError, CleanupAction, CleanupReport, RestoreWarning, Result,
};
pub use hasher::{hash_asset_root, DigestAlgorithm, HashOptions, HashedAsset, SymlinkPolicy};
pub use manifest::{PassManifest, MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME};
pub use pipeline::{BuildReport, BuildRequest, PassBuilder, ProgressHook};
pub use reader::{BundleReader, BundleVerification};
pub use signing::{verify_detached, BackendKind, Secret, SigningBackend, SigningConfig, Trust};
pub use staging::{recover, StagingArea, StagingJournal, JOURNAL_FILE_NAME, LOCK_FILE_NAME};
pub use writer::{ArchiveWriter, PackagedArchive, BUNDLE_EXTENSION};
