//! Exit codes for the pkpass CLI.
//!
//! Exit codes communicate operation outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0: Success
//! - 1-9: Operation stopped before completion
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

use crate::config::ConfigError;
use pk_bundle::{BuildError, BundleError};

/// Exit codes for pkpass operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Bundle built, manifest printed, or bundle verified
    Clean = 0,

    /// Build interrupted by a signal; assets were put back
    Interrupted = 6,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments, configuration or certificate inputs
    ArgsError = 10,

    /// Container unlock secret or key protection secret rejected
    SecretError = 11,

    /// Container, authority certificate, asset root or member missing
    NotFoundError = 12,

    /// Bundle failed member, digest or signature verification
    VerifyError = 13,

    /// Lock contention (another build owns the build root)
    LockError = 14,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    /// Check if this exit code is an internal error (codes 20-29).
    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::Interrupted => "ERR_INTERRUPTED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::SecretError => "ERR_SECRET",
            ExitCode::NotFoundError => "ERR_NOT_FOUND",
            ExitCode::VerifyError => "ERR_VERIFY",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Exit code for a library error.
    pub fn for_bundle_error(err: &BundleError) -> Self {
        match err {
            BundleError::BadUnlockSecret | BundleError::KeyProtection(_) => ExitCode::SecretError,

            BundleError::ContainerNotFound(_)
            | BundleError::AuthorityCertificateNotFound(_)
            | BundleError::EmptyRoot(_)
            | BundleError::MemberNotFound(_) => ExitCode::NotFoundError,
            BundleError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ExitCode::NotFoundError
            }

            BundleError::Zip(_)
            | BundleError::Json(_)
            | BundleError::MissingFile(_)
            | BundleError::UnexpectedMember(_)
            | BundleError::ChecksumMismatch { .. }
            | BundleError::CorruptedManifest(_)
            | BundleError::SignatureInvalid(_) => ExitCode::VerifyError,

            BundleError::BuildLocked(_) => ExitCode::LockError,
            BundleError::Interrupted => ExitCode::Interrupted,

            // Unusable certificate inputs are the caller's to fix.
            BundleError::InvalidRoots(_)
            | BundleError::UnsupportedEntry(_)
            | BundleError::MalformedContainer(_)
            | BundleError::SigningKeyMismatch => ExitCode::ArgsError,

            BundleError::Signature(_) => ExitCode::InternalError,

            BundleError::Io { .. }
            | BundleError::Serialization(_)
            | BundleError::MoveConflict(_)
            | BundleError::ArchiveWrite(_) => ExitCode::IoError,
        }
    }

    /// Exit code for a failed build; the stage's first error decides.
    pub fn for_build_error(err: &BuildError) -> Self {
        Self::for_bundle_error(&err.source)
    }

    pub fn for_config_error(err: &ConfigError) -> Self {
        match err {
            ConfigError::MissingSecret { .. } => ExitCode::SecretError,
            ConfigError::IoError { .. } => ExitCode::IoError,
            ConfigError::NotFound { .. }
            | ConfigError::ParseError { .. }
            | ConfigError::Invalid(_) => ExitCode::ArgsError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_bundle::BuildStage;
    use std::path::PathBuf;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::Interrupted.as_i32(), 6);
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::SecretError.as_i32(), 11);
        assert_eq!(ExitCode::NotFoundError.as_i32(), 12);
        assert_eq!(ExitCode::VerifyError.as_i32(), 13);
        assert_eq!(ExitCode::LockError.as_i32(), 14);
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
        assert_eq!(ExitCode::IoError.as_i32(), 21);
    }

    #[test]
    fn test_ranges() {
        assert!(ExitCode::Clean.is_success());
        assert!(ExitCode::LockError.is_user_error());
        assert!(!ExitCode::IoError.is_user_error());
        assert!(ExitCode::IoError.is_internal_error());
        assert!(!ExitCode::Interrupted.is_success());
        assert!(!ExitCode::Interrupted.is_user_error());
        assert!(!ExitCode::Interrupted.is_internal_error());
    }

    #[test]
    fn test_bundle_error_mapping() {
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::BadUnlockSecret),
            ExitCode::SecretError
        );
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::ContainerNotFound(PathBuf::from("x.p12"))),
            ExitCode::NotFoundError
        );
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::io(
                "Generic.pass",
                std::io::Error::from(std::io::ErrorKind::NotFound)
            )),
            ExitCode::NotFoundError
        );
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::io(
                "build",
                std::io::Error::from(std::io::ErrorKind::PermissionDenied)
            )),
            ExitCode::IoError
        );
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::BuildLocked(PathBuf::from("build"))),
            ExitCode::LockError
        );
        assert_eq!(
            ExitCode::for_bundle_error(&BundleError::SignatureInvalid("bad".into())),
            ExitCode::VerifyError
        );
    }

    #[test]
    fn test_certificate_input_errors_are_user_errors() {
        for err in [
            BundleError::MalformedContainer("no private key".into()),
            BundleError::SigningKeyMismatch,
        ] {
            let code = ExitCode::for_bundle_error(&err);
            assert_eq!(code, ExitCode::ArgsError, "{}", err);
            assert!(code.is_user_error());
        }
    }

    #[test]
    fn test_interrupted_build() {
        let err = BuildError::new(BuildStage::Package, BundleError::Interrupted);
        assert_eq!(ExitCode::for_build_error(&err), ExitCode::Interrupted);
        assert_eq!(ExitCode::Interrupted.code_name(), "ERR_INTERRUPTED");
    }

    #[test]
    fn test_build_error_uses_source() {
        let err = BuildError::new(BuildStage::Stage, BundleError::MoveConflict(PathBuf::from("a")));
        assert_eq!(ExitCode::for_build_error(&err), ExitCode::IoError);
    }

    #[test]
    fn test_config_error_mapping() {
        let missing = ConfigError::MissingSecret {
            var: "PKPASS_KEY_PASSWORD".into(),
        };
        assert_eq!(ExitCode::for_config_error(&missing), ExitCode::SecretError);
        assert_eq!(
            ExitCode::for_config_error(&ConfigError::Invalid("empty".into())),
            ExitCode::ArgsError
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::LockError.to_string(), "ERR_LOCK (14)");
    }
}
