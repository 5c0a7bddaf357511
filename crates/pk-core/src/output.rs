//! Command output rendering.
//!
//! JSON responses share one envelope so scripts can branch on `status`
//! without knowing the command:
//!
//! ```json
//! {"schema_version": "1.0.0", "command": "build", "run_id": "run-…",
//!  "generated_at": "…", "status": "ok", "result": {…}}
//! ```

use crate::exit_codes::ExitCode;
use pk_bundle::{BuildError, BuildReport, BundleVerification, CleanupReport, PassManifest};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::path::Path;

/// Version of the JSON envelope.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Output format for command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Structured JSON (default for machine consumption)
    #[default]
    Json,
    /// Plain text for people
    Human,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Human => write!(f, "human"),
        }
    }
}

/// Wrap a successful result.
pub fn success_envelope<T: Serialize>(command: &str, run_id: &str, result: &T) -> Value {
    json!({
        "schema_version": SCHEMA_VERSION,
        "command": command,
        "run_id": run_id,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "status": "ok",
        "result": result,
    })
}

/// Wrap a failure. `details` is merged into the `error` object.
pub fn error_envelope(
    command: &str,
    run_id: &str,
    code: ExitCode,
    message: &str,
    details: Option<Value>,
) -> Value {
    let mut error = json!({
        "code": code.as_i32(),
        "code_name": code.code_name(),
        "message": message,
    });
    if let (Some(Value::Object(extra)), Some(obj)) = (details, error.as_object_mut()) {
        obj.extend(extra);
    }
    json!({
        "schema_version": SCHEMA_VERSION,
        "command": command,
        "run_id": run_id,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "status": "error",
        "error": error,
    })
}

/// Stage and cleanup details of a failed build, for the error envelope.
pub fn build_error_details(err: &BuildError) -> Value {
    json!({
        "stage": err.stage,
        "cleanup": err.cleanup,
    })
}

pub fn render_build_human(report: &BuildReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Built {}", report.output.display());
    let _ = writeln!(
        out,
        "  {} files, {} bytes, {} manifest, signed with {}",
        report.file_count, report.total_bytes, report.algorithm, report.backend
    );
    let _ = writeln!(
        out,
        "  archive: {} bytes, sha256 {}",
        report.archive_bytes, report.archive_sha256
    );
    let elapsed = report.finished_at - report.started_at;
    let _ = writeln!(out, "  took {} ms", elapsed.num_milliseconds());
    for warning in &report.cleanup_warnings {
        let _ = writeln!(out, "  warning: {}", warning);
    }
    out
}

/// Digest and name per line, like `sha1sum` output.
pub fn render_manifest_human(manifest: &PassManifest) -> String {
    let mut out = String::new();
    for (name, digest) in manifest.entries() {
        let _ = writeln!(out, "{}  {}", digest, name);
    }
    let _ = writeln!(out, "{} files ({})", manifest.len(), manifest.algorithm());
    out
}

pub fn render_verification_human(bundle: &Path, result: &BundleVerification) -> String {
    let trust = if result.chain_verified {
        "signature and certificate chain verified"
    } else {
        "signature verified (chain not checked)"
    };
    format!(
        "{}: OK\n  {} members, {} digests, {}\n",
        bundle.display(),
        result.members,
        result.algorithm,
        trust
    )
}

pub fn render_build_error_human(err: &BuildError) -> String {
    let mut out = format!("Error: {}\n", err);
    for warning in &err.cleanup.warnings {
        let _ = writeln!(out, "  cleanup warning: {}", warning);
    }
    out
}

pub fn render_recovery_human(asset_root: &Path, report: Option<&CleanupReport>) -> String {
    let Some(report) = report else {
        return format!("{}: nothing to recover\n", asset_root.display());
    };
    let mut out = format!(
        "{}: restored {} entries, purged {} files\n",
        asset_root.display(),
        report.restored.len(),
        report.purged.len()
    );
    for warning in &report.warnings {
        let _ = writeln!(out, "  warning: {}", warning);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pk_bundle::{
        BuildStage, BundleError, CleanupAction, CleanupReport, DigestAlgorithm, RestoreWarning,
    };
    use std::path::PathBuf;

    fn report() -> BuildReport {
        let now = Utc::now();
        BuildReport {
            output: PathBuf::from("build/Generic.pkpass"),
            members: vec!["manifest.json".into(), "signature".into(), "icon.png".into()],
            algorithm: DigestAlgorithm::Sha1,
            file_count: 1,
            total_bytes: 4,
            archive_bytes: 512,
            archive_sha256: "ab".repeat(32),
            backend: "openssl".into(),
            cleanup_warnings: vec![],
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_success_envelope_shape() {
        let value = success_envelope("build", "run-0123456789ab", &report());
        assert_eq!(value["status"], "ok");
        assert_eq!(value["command"], "build");
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert_eq!(value["result"]["file_count"], 1);
        assert_eq!(value["result"]["algorithm"], "sha1");
    }

    #[test]
    fn test_error_envelope_merges_details() {
        let err = BuildError {
            stage: BuildStage::ExtractCertificate,
            source: BundleError::BadUnlockSecret,
            cleanup: CleanupReport {
                restored: vec![],
                purged: vec!["manifest.json".into()],
                warnings: vec![RestoreWarning {
                    action: CleanupAction::Restore,
                    item: "logo.png".into(),
                    reason: "busy".into(),
                }],
            },
        };
        let value = error_envelope(
            "build",
            "run-0123456789ab",
            ExitCode::SecretError,
            &err.to_string(),
            Some(build_error_details(&err)),
        );

        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], 11);
        assert_eq!(value["error"]["code_name"], "ERR_SECRET");
        assert_eq!(value["error"]["stage"], "extract_certificate");
        assert_eq!(value["error"]["cleanup"]["warnings"][0]["item"], "logo.png");
    }

    #[test]
    fn test_human_renderings() {
        let text = render_build_human(&report());
        assert!(text.starts_with("Built build/Generic.pkpass"));
        assert!(text.contains("1 files, 4 bytes, sha1 manifest"));

        let mut manifest = PassManifest::new(DigestAlgorithm::Sha1);
        manifest.insert("icon.png", "c".repeat(40)).unwrap();
        let text = render_manifest_human(&manifest);
        assert!(text.starts_with(&format!("{}  icon.png\n", "c".repeat(40))));

        let text = render_verification_human(
            Path::new("Generic.pkpass"),
            &BundleVerification {
                members: 3,
                algorithm: DigestAlgorithm::Sha1,
                chain_verified: false,
            },
        );
        assert!(text.contains("chain not checked"));
    }

    #[test]
    fn test_recovery_rendering() {
        let assets = Path::new("Generic.pass");
        assert_eq!(render_recovery_human(assets, None), "Generic.pass: nothing to recover\n");

        let report = CleanupReport {
            restored: vec!["icon.png".into()],
            purged: vec![],
            warnings: vec![RestoreWarning {
                action: CleanupAction::Restore,
                item: "logo.png".into(),
                reason: "missing from build root".into(),
            }],
        };
        let text = render_recovery_human(assets, Some(&report));
        assert!(text.starts_with("Generic.pass: restored 1 entries, purged 0 files\n"));
        assert!(text.contains("logo.png"));
    }
}
