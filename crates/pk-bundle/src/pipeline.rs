//! End-to-end pass build: hash, manifest, sign, stage, package, clean up.

use crate::error::{BuildError, BuildStage, RestoreWarning};
use crate::hasher::{hash_asset_root, DigestAlgorithm, HashOptions};
use crate::manifest::{PassManifest, MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME};
use crate::signing::{
    BackendKind, SigningBackend, SigningConfig, SigningPipeline, CERTIFICATE_FILE_NAME,
    PRIVATE_KEY_FILE_NAME,
};
use crate::staging::{entries_for, StagingArea};
use crate::writer::{member_list, ArchiveWriter, BUNDLE_EXTENSION};
use crate::BundleError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// Called as the build enters each stage after `prepare`.
pub type ProgressHook = Box<dyn Fn(BuildStage) + Send + Sync>;

/// Everything one build needs.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub asset_root: PathBuf,
    pub build_root: PathBuf,
    /// Bundle base name; the archive is `<name>.pkpass` in the build root.
    pub name: String,
    pub signing: SigningConfig,
    pub hashing: HashOptions,
    pub retain_signing_material: bool,
    pub backend: BackendKind,
}

/// Summary of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub output: PathBuf,
    pub members: Vec<String>,
    pub algorithm: DigestAlgorithm,
    pub file_count: usize,
    pub total_bytes: u64,
    pub archive_bytes: u64,
    pub archive_sha256: String,
    pub backend: String,
    pub cleanup_warnings: Vec<RestoreWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Runs a [`BuildRequest`].
pub struct PassBuilder {
    request: BuildRequest,
    backend: Box<dyn SigningBackend>,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressHook>,
}

impl PassBuilder {
    pub fn new(request: BuildRequest) -> Self {
        let backend = request.backend.create();
        Self {
            request,
            backend,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Stop at the next stage boundary once `flag` is set. The build then
    /// fails with [`BundleError::Interrupted`] after the usual cleanup.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    /// Use a specific backend instead of the one named in the request.
    pub fn with_backend(mut self, backend: Box<dyn SigningBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    /// Build the bundle.
    ///
    /// The asset root is restored and generated files are purged on every
    /// path out of this function. On failure the error names the first stage
    /// that failed and carries whatever the cleanup could not undo.
    pub fn build(&self) -> Result<BuildReport, BuildError> {
        let request = &self.request;
        let span = info_span!("build", name = %request.name, backend = self.backend.name());
        let _enter = span.enter();
        let started_at = Utc::now();

        validate_name(&request.name).map_err(|e| BuildError::new(BuildStage::Prepare, e))?;

        let mut area = StagingArea::open(&request.asset_root, &request.build_root)
            .map_err(|e| BuildError::new(BuildStage::Prepare, e))?;
        area.retain_signing_material(request.retain_signing_material);
        for name in [
            MANIFEST_FILE_NAME,
            SIGNATURE_FILE_NAME,
            CERTIFICATE_FILE_NAME,
            PRIVATE_KEY_FILE_NAME,
        ] {
            area.register_generated(name);
        }
        area.sync_journal()
            .map_err(|e| BuildError::new(BuildStage::Prepare, e))?;

        let outcome = self.run_stages(&mut area);
        let cleanup = area.finish();

        match outcome {
            Ok(built) => {
                if !cleanup.is_clean() {
                    warn!(
                        warnings = cleanup.warnings.len(),
                        "Bundle built but cleanup left items behind"
                    );
                }
                let finished_at = Utc::now();
                info!(
                    output = %built.output.display(),
                    files = built.file_count,
                    elapsed_ms = (finished_at - started_at).num_milliseconds(),
                    "Build complete"
                );
                Ok(BuildReport {
                    output: built.output,
                    members: built.members,
                    algorithm: built.algorithm,
                    file_count: built.file_count,
                    total_bytes: built.total_bytes,
                    archive_bytes: built.archive_bytes,
                    archive_sha256: built.archive_sha256,
                    backend: self.backend.name().to_string(),
                    cleanup_warnings: cleanup.warnings,
                    started_at,
                    finished_at,
                })
            }
            Err(mut err) => {
                warn!(stage = %err.stage, error = %err.source, "Build failed");
                err.cleanup = cleanup;
                Err(err)
            }
        }
    }

    fn run_stages(&self, area: &mut StagingArea) -> Result<Built, BuildError> {
        let request = &self.request;
        let build_root = area.build_root().to_path_buf();

        self.enter(BuildStage::Hash)?;
        let hashed = hash_asset_root(area.asset_root(), &request.hashing)
            .map_err(|e| BuildError::new(BuildStage::Hash, e))?;
        let total_bytes = hashed.iter().map(|h| h.file.bytes).sum();

        self.enter(BuildStage::Manifest)?;
        let manifest = PassManifest::from_hashed(&hashed, request.hashing.algorithm)
            .map_err(|e| BuildError::new(BuildStage::Manifest, e))?;
        let manifest_bytes = manifest
            .write_atomic(&build_root.join(MANIFEST_FILE_NAME))
            .map_err(|e| BuildError::new(BuildStage::Manifest, e))?;

        self.enter(BuildStage::ExtractCertificate)?;
        SigningPipeline::new(self.backend.as_ref(), &request.signing, &build_root)
            .run(&manifest_bytes)?;

        self.enter(BuildStage::Stage)?;
        area.stage(&entries_for(&manifest))
            .map_err(|e| BuildError::new(BuildStage::Stage, e))?;

        self.enter(BuildStage::Package)?;
        let output = build_root.join(format!("{}.{}", request.name, BUNDLE_EXTENSION));
        let archive = ArchiveWriter::new(&build_root)
            .write(&output, &member_list(&manifest))
            .map_err(|e| BuildError::new(BuildStage::Package, e))?;

        Ok(Built {
            output: archive.path,
            members: archive.members,
            algorithm: manifest.algorithm(),
            file_count: manifest.len(),
            total_bytes,
            archive_bytes: archive.compressed_bytes,
            archive_sha256: archive.sha256,
        })
    }

    fn enter(&self, stage: BuildStage) -> Result<(), BuildError> {
        if self.cancel.load(Ordering::SeqCst) {
            info!(stage = %stage, "Interrupted, abandoning build");
            return Err(BuildError::new(stage, BundleError::Interrupted));
        }
        if let Some(hook) = &self.progress {
            hook(stage);
        }
        debug!(stage = %stage, "Entering stage");
        Ok(())
    }
}

struct Built {
    output: PathBuf,
    members: Vec<String>,
    algorithm: DigestAlgorithm,
    file_count: usize,
    total_bytes: u64,
    archive_bytes: u64,
    archive_sha256: String,
}

/// A bundle name becomes a single file name in the build root.
fn validate_name(name: &str) -> crate::Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(BundleError::InvalidRoots(format!(
            "bundle name '{}' is not a plain file name",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::BundleReader;
    use crate::signing::{Secret, Trust};
    use crate::error::CleanupAction;
    use crate::staging::{JOURNAL_FILE_NAME, LOCK_FILE_NAME};
    use crate::test_utils::{
        snapshot_dir, write_generic_pass, write_scenario_assets, write_signing_fixture,
        CertificateFixture, PROTECTION_SECRET, UNLOCK_SECRET,
    };
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Setup {
        dir: TempDir,
        fixture: CertificateFixture,
        assets: PathBuf,
        build: PathBuf,
    }

    fn setup(write_assets: fn(&Path)) -> Setup {
        let dir = TempDir::new().unwrap();
        let fixture = write_signing_fixture(&dir.path().join("certs"));
        let assets = dir.path().join("Generic.pass");
        write_assets(&assets);
        let build = dir.path().join("build");
        Setup {
            dir,
            fixture,
            assets,
            build,
        }
    }

    fn request(s: &Setup) -> BuildRequest {
        BuildRequest {
            asset_root: s.assets.clone(),
            build_root: s.build.clone(),
            name: "Generic".to_string(),
            signing: SigningConfig {
                container: s.fixture.container_path.clone(),
                unlock: Secret::new(UNLOCK_SECRET),
                protection: Secret::new(PROTECTION_SECRET),
                authority: s.fixture.authority_path.clone(),
            },
            hashing: HashOptions::default(),
            retain_signing_material: false,
            backend: BackendKind::Openssl,
        }
    }

    #[test]
    fn test_scenario_build_produces_verifiable_bundle() {
        let s = setup(write_scenario_assets);
        let before = snapshot_dir(&s.assets);

        let report = PassBuilder::new(request(&s)).build().unwrap();

        assert_eq!(report.output, s.build.canonicalize().unwrap().join("Generic.pkpass"));
        assert_eq!(report.members, vec!["manifest.json", "signature", "icon.png", "logo.png"]);
        assert_eq!(report.file_count, 2);
        assert_eq!(report.total_bytes, 8);
        assert_eq!(report.algorithm, DigestAlgorithm::Sha1);
        assert!(report.cleanup_warnings.is_empty());
        assert!(report.finished_at >= report.started_at);

        // Asset root restored; only the bundle is left in the build root.
        assert_eq!(snapshot_dir(&s.assets), before);
        let left: Vec<_> = snapshot_dir(&s.build).into_keys().collect();
        assert_eq!(left, vec!["Generic.pkpass"]);

        let trust = Trust::from_authority_file(&s.fixture.authority_path).unwrap();
        let mut reader = BundleReader::open(&report.output).unwrap();
        reader.verify(&trust).unwrap();
        assert_eq!(
            reader.manifest().digest_for("logo.png"),
            Some(DigestAlgorithm::Sha1.digest_hex(b"PNGX").as_str())
        );
    }

    #[test]
    fn test_localised_pass_keeps_directory_members() {
        let s = setup(write_generic_pass);
        let before = snapshot_dir(&s.assets);

        let report = PassBuilder::new(request(&s)).build().unwrap();

        assert!(report.members.contains(&"en.lproj/pass.strings".to_string()));
        assert_eq!(report.file_count, 6);
        assert_eq!(snapshot_dir(&s.assets), before);

        let mut reader = BundleReader::open(&report.output).unwrap();
        reader.verify(&Trust::SignatureOnly).unwrap();
    }

    #[test]
    fn test_wrong_unlock_secret_leaves_assets_and_no_archive() {
        let s = setup(write_scenario_assets);
        let before = snapshot_dir(&s.assets);
        let mut req = request(&s);
        req.signing.unlock = Secret::new("not-the-password");

        let err = PassBuilder::new(req).build().unwrap_err();

        assert_eq!(err.stage, BuildStage::ExtractCertificate);
        assert!(matches!(err.source, BundleError::BadUnlockSecret));
        assert!(err.cleanup.is_clean());
        assert_eq!(snapshot_dir(&s.assets), before);
        assert!(snapshot_dir(&s.build).is_empty());
    }

    #[test]
    fn test_missing_authority_fails_sign_stage() {
        let s = setup(write_scenario_assets);
        let mut req = request(&s);
        req.signing.authority = s.dir.path().join("missing.pem");

        let err = PassBuilder::new(req).build().unwrap_err();

        assert_eq!(err.stage, BuildStage::Sign);
        assert!(matches!(err.source, BundleError::AuthorityCertificateNotFound(_)));
        assert!(snapshot_dir(&s.build).is_empty());
    }

    #[test]
    fn test_retained_signing_material_survives() {
        let s = setup(write_scenario_assets);
        let mut req = request(&s);
        req.retain_signing_material = true;

        PassBuilder::new(req).build().unwrap();

        let left: Vec<_> = snapshot_dir(&s.build).into_keys().collect();
        assert_eq!(left, vec!["Generic.pkpass", "passcertificate.pem", "passkey.pem"]);
    }

    #[test]
    fn test_move_conflict_restores_everything() {
        let s = setup(write_scenario_assets);
        fs::create_dir_all(&s.build).unwrap();
        fs::write(s.build.join("logo.png"), b"OLD").unwrap();
        let before = snapshot_dir(&s.assets);

        let err = PassBuilder::new(request(&s)).build().unwrap_err();

        assert_eq!(err.stage, BuildStage::Stage);
        assert!(matches!(err.source, BundleError::MoveConflict(_)));
        assert_eq!(snapshot_dir(&s.assets), before);
        let left: Vec<_> = snapshot_dir(&s.build).into_keys().collect();
        assert_eq!(left, vec!["logo.png"]);
    }

    #[test]
    fn test_locked_build_root_is_refused() {
        let s = setup(write_scenario_assets);
        fs::create_dir_all(&s.build).unwrap();
        fs::write(s.build.join(LOCK_FILE_NAME), b"1").unwrap();

        let err = PassBuilder::new(request(&s)).build().unwrap_err();

        assert_eq!(err.stage, BuildStage::Prepare);
        assert!(matches!(err.source, BundleError::BuildLocked(_)));
        assert!(s.build.join(LOCK_FILE_NAME).exists());
        assert!(!s.assets.join(JOURNAL_FILE_NAME).exists());
    }

    #[test]
    fn test_half_staged_asset_root_is_refused() {
        let s = setup(write_scenario_assets);
        let crashed = s.dir.path().join("build-a");
        let mut area = StagingArea::open(&s.assets, &crashed).unwrap();
        area.stage(&["icon.png".to_string()]).unwrap();
        std::mem::forget(area);

        let err = PassBuilder::new(request(&s)).build().unwrap_err();

        assert_eq!(err.stage, BuildStage::Prepare);
        assert!(matches!(err.source, BundleError::BuildLocked(_)));
        assert!(!s.build.join("Generic.pkpass").exists());
        assert!(crashed.join("icon.png").exists());

        let recovered = crate::staging::recover(&s.assets).unwrap().unwrap();
        assert_eq!(recovered.restored, vec!["icon.png".to_string()]);

        let report = PassBuilder::new(request(&s)).build().unwrap();
        assert_eq!(report.members, vec!["manifest.json", "signature", "icon.png", "logo.png"]);
    }

    #[test]
    fn test_package_failure_keeps_stage_and_cleanup_warnings() {
        let s = setup(write_scenario_assets);
        let build = s.build.clone();
        let hook: ProgressHook = Box::new(move |stage| {
            if stage == BuildStage::Package {
                fs::remove_file(build.join("logo.png")).unwrap();
            }
        });

        let err = PassBuilder::new(request(&s))
            .with_progress(hook)
            .build()
            .unwrap_err();

        assert_eq!(err.stage, BuildStage::Package);
        assert!(matches!(err.source, BundleError::MemberNotFound(ref m) if m == "logo.png"));
        assert!(!err.cleanup.warnings.is_empty());
        let warning = &err.cleanup.warnings[0];
        assert_eq!(warning.action, CleanupAction::Restore);
        assert_eq!(warning.item, "logo.png");
        assert_eq!(err.cleanup.restored, vec!["icon.png".to_string()]);

        assert!(s.assets.join("icon.png").exists());
        assert!(!s.build.join("Generic.pkpass").exists());
        assert!(!s.build.join(MANIFEST_FILE_NAME).exists());
    }

    #[test]
    fn test_interrupt_restores_assets_without_packaging() {
        let s = setup(write_scenario_assets);
        let before = snapshot_dir(&s.assets);
        let flag = Arc::new(AtomicBool::new(false));
        let raised = Arc::clone(&flag);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let hook: ProgressHook = Box::new(move |stage| {
            record.lock().unwrap().push(stage);
            if stage == BuildStage::Stage {
                raised.store(true, Ordering::SeqCst);
            }
        });

        let err = PassBuilder::new(request(&s))
            .with_cancel_flag(flag)
            .with_progress(hook)
            .build()
            .unwrap_err();

        assert_eq!(err.stage, BuildStage::Package);
        assert!(matches!(err.source, BundleError::Interrupted));
        assert!(err.cleanup.is_clean());
        assert_eq!(err.cleanup.restored.len(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BuildStage::Hash,
                BuildStage::Manifest,
                BuildStage::ExtractCertificate,
                BuildStage::Stage
            ]
        );
        assert_eq!(snapshot_dir(&s.assets), before);
        assert!(snapshot_dir(&s.build).is_empty());
    }

    #[test]
    fn test_interrupt_before_start_touches_nothing() {
        let s = setup(write_scenario_assets);
        let before = snapshot_dir(&s.assets);

        let err = PassBuilder::new(request(&s))
            .with_cancel_flag(Arc::new(AtomicBool::new(true)))
            .build()
            .unwrap_err();

        assert_eq!(err.stage, BuildStage::Hash);
        assert!(matches!(err.source, BundleError::Interrupted));
        assert_eq!(snapshot_dir(&s.assets), before);
    }

    #[test]
    fn test_sha256_manifest() {
        let s = setup(write_scenario_assets);
        let mut req = request(&s);
        req.hashing = HashOptions::default().with_algorithm(DigestAlgorithm::Sha256);

        let report = PassBuilder::new(req).build().unwrap();
        assert_eq!(report.algorithm, DigestAlgorithm::Sha256);

        let reader = BundleReader::open(&report.output).unwrap();
        assert_eq!(reader.manifest().algorithm(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_bad_name_rejected_before_locking() {
        let s = setup(write_scenario_assets);
        let mut req = request(&s);
        req.name = "../escape".to_string();

        let err = PassBuilder::new(req).build().unwrap_err();
        assert_eq!(err.stage, BuildStage::Prepare);
        assert!(!s.build.exists());
    }

    #[test]
    fn test_repeat_builds_sign_identical_manifests() {
        let s = setup(write_scenario_assets);
        let first = PassBuilder::new(request(&s)).build().unwrap();
        let manifest_a = BundleReader::open(&first.output).unwrap().manifest_bytes().to_vec();
        fs::remove_file(&first.output).unwrap();

        let second = PassBuilder::new(request(&s)).build().unwrap();
        let manifest_b = BundleReader::open(&second.output).unwrap().manifest_bytes().to_vec();
        assert_eq!(manifest_a, manifest_b);
    }
}
