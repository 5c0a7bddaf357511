//! Error types for bundle operations.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while hashing, signing, staging or packaging a bundle.
#[derive(Error, Debug)]
pub enum BundleError {
    /// I/O error with the path that caused it
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The asset root contains no files
    #[error("asset root {} contains no files", .0.display())]
    EmptyRoot(PathBuf),

    /// A name or document cannot be rendered in the manifest encoding
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Asset tree entry rejected by the symlink policy
    #[error("unsupported entry in asset root: {}", .0.display())]
    UnsupportedEntry(PathBuf),

    /// Certificate container does not exist
    #[error("certificate container not found: {}", .0.display())]
    ContainerNotFound(PathBuf),

    /// Wrong container unlock secret
    #[error("certificate container could not be unlocked: wrong password")]
    BadUnlockSecret,

    /// Container is unreadable or lacks a certificate/key
    #[error("malformed certificate container: {0}")]
    MalformedContainer(String),

    /// Private key could not be protected or unprotected with the key secret
    #[error("private key protection failed: {0}")]
    KeyProtection(String),

    /// Authority certificate does not exist or is unreadable
    #[error("authority certificate not found: {}", .0.display())]
    AuthorityCertificateNotFound(PathBuf),

    /// Certificate and private key do not belong together
    #[error("signing certificate does not match the private key")]
    SigningKeyMismatch,

    /// Any other cryptographic failure while signing
    #[error("signature error: {0}")]
    Signature(String),

    /// Staging would overwrite an existing file
    #[error("refusing to overwrite existing file: {}", .0.display())]
    MoveConflict(PathBuf),

    /// Another build holds the build root or has staged the asset root
    #[error("in use by another build: {}", .0.display())]
    BuildLocked(PathBuf),

    /// The build was asked to stop before it completed
    #[error("build interrupted")]
    Interrupted,

    /// Asset root and build root cannot be used together
    #[error("invalid roots: {0}")]
    InvalidRoots(String),

    /// Archive member could not be opened
    #[error("archive member not found: {0}")]
    MemberNotFound(String),

    /// Failure creating or writing the archive container
    #[error("archive write failed: {0}")]
    ArchiveWrite(String),

    /// ZIP archive error while reading
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing required file in bundle
    #[error("missing required file: {0}")]
    MissingFile(String),

    /// Archive contains a member the manifest does not list
    #[error("unexpected archive member: {0}")]
    UnexpectedMember(String),

    /// Checksum verification failed
    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Corrupted manifest
    #[error("corrupted manifest: {0}")]
    CorruptedManifest(String),

    /// Detached signature did not verify
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),
}

impl BundleError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BundleError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;

/// Pipeline stage in which a build failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Prepare,
    Hash,
    Manifest,
    ExtractCertificate,
    ExtractPrivateKey,
    Sign,
    Stage,
    Package,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Prepare => "prepare",
            BuildStage::Hash => "hash",
            BuildStage::Manifest => "manifest",
            BuildStage::ExtractCertificate => "extract_certificate",
            BuildStage::ExtractPrivateKey => "extract_private_key",
            BuildStage::Sign => "sign",
            BuildStage::Stage => "stage",
            BuildStage::Package => "package",
        };
        f.write_str(name)
    }
}

/// Which cleanup step produced a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    Restore,
    Purge,
    Unlock,
}

/// A best-effort cleanup step that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreWarning {
    pub action: CleanupAction,
    pub item: String,
    pub reason: String,
}

impl fmt::Display for RestoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            CleanupAction::Restore => "restore",
            CleanupAction::Purge => "purge",
            CleanupAction::Unlock => "unlock",
        };
        write!(f, "{} {}: {}", action, self.item, self.reason)
    }
}

/// Aggregated outcome of restore + purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub restored: Vec<String>,
    pub purged: Vec<String>,
    pub warnings: Vec<RestoreWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub(crate) fn warn(&mut self, action: CleanupAction, item: impl Into<String>, reason: impl fmt::Display) {
        self.warnings.push(RestoreWarning {
            action,
            item: item.into(),
            reason: reason.to_string(),
        });
    }
}

/// A failed build: the first fatal error, where it happened, and what cleanup reported.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}{}", cleanup_suffix(.cleanup))]
pub struct BuildError {
    pub stage: BuildStage,
    #[source]
    pub source: BundleError,
    pub cleanup: CleanupReport,
}

fn cleanup_suffix(cleanup: &CleanupReport) -> String {
    match cleanup.warnings.len() {
        0 => String::new(),
        1 => " (1 cleanup warning)".to_string(),
        n => format!(" ({} cleanup warnings)", n),
    }
}

impl BuildError {
    pub fn new(stage: BuildStage, source: BundleError) -> Self {
        Self {
            stage,
            source,
            cleanup: CleanupReport::default(),
        }
    }
}
