//! No-mock integration tests for the unsigned half of a build.
//!
//! Exercises real files on disk through the public API:
//! - Asset enumeration and hashing across worker counts
//! - Canonical manifest bytes and read-back
//! - Staging into a build root and restoring, including conflicts
//! - Packaging and member verification through the reader

use pk_bundle::manifest::PassManifest;
use pk_bundle::staging::entries_for;
use pk_bundle::{
    hash_asset_root, ArchiveWriter, BundleError, BundleReader, DigestAlgorithm, HashOptions,
    StagingArea, SymlinkPolicy, JOURNAL_FILE_NAME, LOCK_FILE_NAME, MANIFEST_FILE_NAME,
    SIGNATURE_FILE_NAME,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

// ============================================================================
// Helpers
// ============================================================================

fn write_pass(dir: &Path) {
    let files: &[(&str, &[u8])] = &[
        ("pass.json", br#"{"formatVersion": 1}"#),
        ("icon.png", b"ICNX"),
        ("logo.png", b"PNGX"),
        ("strip@2x.png", &[0u8; 4096]),
        ("en.lproj/pass.strings", b"\"a\" = \"b\";"),
        ("de.lproj/pass.strings", b"\"a\" = \"c\";"),
    ];
    for (name, data) in files {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

// ============================================================================
// Hashing and manifest
// ============================================================================

#[test]
fn manifest_is_identical_across_worker_counts() {
    let dir = TempDir::new().unwrap();
    write_pass(dir.path());

    let mut outputs = Vec::new();
    for workers in [1, 2, 8] {
        let options = HashOptions::default().with_workers(workers);
        let hashed = hash_asset_root(dir.path(), &options).unwrap();
        let manifest = PassManifest::from_hashed(&hashed, options.algorithm).unwrap();
        outputs.push(manifest.to_canonical_bytes().unwrap());
    }

    assert!(outputs.windows(2).all(|w| w[0] == w[1]));

    let text = String::from_utf8(outputs.remove(0)).unwrap();
    assert!(text.starts_with("{\n \"de.lproj/pass.strings\": \""));
    assert!(text.ends_with("\"\n}"));
}

#[test]
fn one_changed_byte_changes_one_digest() {
    let dir = TempDir::new().unwrap();
    write_pass(dir.path());
    let options = HashOptions::default();

    let before =
        PassManifest::from_hashed(&hash_asset_root(dir.path(), &options).unwrap(), options.algorithm)
            .unwrap();
    fs::write(dir.path().join("logo.png"), b"PNGY").unwrap();
    let after =
        PassManifest::from_hashed(&hash_asset_root(dir.path(), &options).unwrap(), options.algorithm)
            .unwrap();

    let changed: Vec<_> = before
        .entries()
        .filter(|(name, digest)| after.digest_for(name) != Some(*digest))
        .map(|(name, _)| name.to_string())
        .collect();
    assert_eq!(changed, vec!["logo.png"]);
}

#[test]
fn written_manifest_parses_back() {
    let dir = TempDir::new().unwrap();
    write_pass(dir.path());
    let out = TempDir::new().unwrap();
    let options = HashOptions::default().with_algorithm(DigestAlgorithm::Sha256);

    let manifest =
        PassManifest::from_hashed(&hash_asset_root(dir.path(), &options).unwrap(), options.algorithm)
            .unwrap();
    let path = out.path().join(MANIFEST_FILE_NAME);
    let bytes = manifest.write_atomic(&path).unwrap();

    assert_eq!(fs::read(&path).unwrap(), bytes);
    assert_eq!(PassManifest::parse(&bytes).unwrap(), manifest);
}

#[cfg(unix)]
#[test]
fn symlinked_asset_is_rejected_by_default() {
    let dir = TempDir::new().unwrap();
    write_pass(dir.path());
    std::os::unix::fs::symlink(dir.path().join("icon.png"), dir.path().join("alias.png")).unwrap();

    let err = hash_asset_root(dir.path(), &HashOptions::default()).unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedEntry(_)));

    let skipped = hash_asset_root(
        dir.path(),
        &HashOptions::default().with_symlinks(SymlinkPolicy::Skip),
    )
    .unwrap();
    assert_eq!(skipped.len(), 6);
}

// ============================================================================
// Staging and packaging
// ============================================================================

#[test]
fn stage_package_restore_roundtrip() {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("Generic.pass");
    let build = dir.path().join("build");
    write_pass(&assets);
    let before = snapshot(&assets);

    let options = HashOptions::default();
    let manifest =
        PassManifest::from_hashed(&hash_asset_root(&assets, &options).unwrap(), options.algorithm)
            .unwrap();

    let mut area = StagingArea::open(&assets, &build).unwrap();
    area.register_generated(MANIFEST_FILE_NAME);
    area.register_generated(SIGNATURE_FILE_NAME);
    assert!(build.join(LOCK_FILE_NAME).exists());
    assert!(assets.join(JOURNAL_FILE_NAME).exists());

    manifest.write_atomic(&build.join(MANIFEST_FILE_NAME)).unwrap();
    fs::write(build.join(SIGNATURE_FILE_NAME), b"unsigned").unwrap();

    area.stage(&entries_for(&manifest)).unwrap();
    assert_eq!(area.plan().len(), 6);
    assert!(!assets.join("logo.png").exists());

    let output = build.join("Generic.pkpass");
    let members = pk_bundle::writer::member_list(&manifest);
    ArchiveWriter::new(&build).write(&output, &members).unwrap();

    let report = area.finish();
    assert!(report.is_clean());
    assert_eq!(report.restored.len(), 6);
    assert_eq!(snapshot(&assets), before);
    assert_eq!(snapshot(&build).into_keys().collect::<Vec<_>>(), vec!["Generic.pkpass"]);

    let mut reader = BundleReader::open(&output).unwrap();
    assert_eq!(reader.verify_members().unwrap(), 8);
    assert_eq!(reader.read_verified("en.lproj/pass.strings").unwrap(), b"\"a\" = \"b\";");
    assert_eq!(reader.signature(), b"unsigned");
}

#[test]
fn conflict_midway_leaves_nothing_staged() {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    let build = dir.path().join("build");
    write_pass(&assets);
    fs::create_dir_all(&build).unwrap();
    fs::write(build.join("logo.png"), b"stale").unwrap();
    let before = snapshot(&assets);

    let options = HashOptions::default();
    let manifest =
        PassManifest::from_hashed(&hash_asset_root(&assets, &options).unwrap(), options.algorithm)
            .unwrap();

    let mut area = StagingArea::open(&assets, &build).unwrap();
    let err = area.stage(&entries_for(&manifest)).unwrap_err();
    assert!(matches!(err, BundleError::MoveConflict(_)));
    assert!(area.plan().is_empty());
    assert!(assets.join("icon.png").exists());

    assert!(area.finish().is_clean());
    assert_eq!(snapshot(&assets), before);
    assert_eq!(fs::read(build.join("logo.png")).unwrap(), b"stale");
}

#[test]
fn second_build_on_same_root_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    let build = dir.path().join("build");
    write_pass(&assets);

    let first = StagingArea::open(&assets, &build).unwrap();
    let err = StagingArea::open(&assets, &build).unwrap_err();
    assert!(matches!(err, BundleError::BuildLocked(_)));

    drop(first);
    assert!(!build.join(LOCK_FILE_NAME).exists());
    StagingArea::open(&assets, &build).unwrap().finish();
}

#[test]
fn nested_roots_are_refused() {
    let dir = TempDir::new().unwrap();
    write_pass(dir.path());

    let err = StagingArea::open(dir.path(), &dir.path().join("build")).unwrap_err();
    assert!(matches!(err, BundleError::InvalidRoots(_)));
    assert!(!dir.path().join("build").exists());
}
