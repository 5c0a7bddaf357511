//! Staging of asset files into the build root, with guaranteed restoration.
//!
//! There is no filesystem transaction spanning a whole build, so staging is
//! a compensating transaction: every move is recorded in a [`StagingPlan`]
//! as it completes, and [`StagingArea::finish`] (or `Drop`, if the caller
//! never gets that far) moves exactly that set back, purges generated
//! artifacts and releases both locks.
//!
//! The plan is mirrored into a [`StagingJournal`] inside the asset root,
//! written before each move. While the journal exists no other build may
//! open that asset root, and if the process dies without cleaning up,
//! [`recover`] replays the journal to put the assets back.
//!
//! Cleanup never aborts early and is never time-limited. Each item that
//! cannot be restored or purged becomes a [`RestoreWarning`] and the rest
//! are still attempted.

use crate::error::{CleanupAction, CleanupReport, RestoreWarning};
use crate::manifest::PassManifest;
use crate::signing::{CERTIFICATE_FILE_NAME, PRIVATE_KEY_FILE_NAME};
use crate::{BundleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lock file marking a build root as in use.
pub const LOCK_FILE_NAME: &str = ".pkpass-build.lock";

/// Journal marking an asset root as opened by a build. Never hashed or staged.
pub const JOURNAL_FILE_NAME: &str = ".pkpass-staging.json";

/// On-disk record of a build's staging state, kept in the asset root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingJournal {
    pub build_root: PathBuf,
    /// Process that wrote the journal.
    pub pid: u32,
    /// Entries moved, or about to be moved, into the build root.
    pub moved: Vec<String>,
    pub generated: Vec<String>,
    pub retain_signing_material: bool,
}

impl StagingJournal {
    /// Read the journal of `asset_root`, if there is one.
    pub fn load(asset_root: &Path) -> Result<Option<Self>> {
        let path = asset_root.join(JOURNAL_FILE_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BundleError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BundleError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Write atomically. With `exclusive`, fail if a journal already exists.
    fn store(&self, asset_root: &Path, exclusive: bool) -> Result<()> {
        let path = asset_root.join(JOURNAL_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(JOURNAL_FILE_NAME)
            .suffix(".tmp")
            .tempfile_in(asset_root)
            .map_err(|e| BundleError::io(asset_root, e))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| BundleError::io(tmp.path().to_path_buf(), e))?;

        let persisted = if exclusive {
            tmp.persist_noclobber(&path)
        } else {
            tmp.persist(&path)
        };
        persisted.map_err(|e| match e.error.kind() {
            io::ErrorKind::AlreadyExists => BundleError::BuildLocked(path.clone()),
            _ => BundleError::io(&path, e.error),
        })?;
        Ok(())
    }
}

/// Names moved from the asset root into the build root, in move order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingPlan {
    moved: Vec<String>,
}

impl StagingPlan {
    pub fn names(&self) -> &[String] {
        &self.moved
    }

    pub fn len(&self) -> usize {
        self.moved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.moved.iter().any(|n| n == name)
    }
}

/// Top-level asset entries that must be staged so every manifest entry is
/// reachable from the build root. `en.lproj/pass.strings` stages `en.lproj`.
pub fn entries_for(manifest: &PassManifest) -> Vec<String> {
    manifest
        .names()
        .filter_map(|name| name.split('/').next())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn move_back(asset_root: &Path, build_root: &Path, name: &str) -> std::result::Result<(), String> {
    let from = build_root.join(name);
    let to = asset_root.join(name);

    if !exists_no_follow(&from) {
        return Err("missing from build root".to_string());
    }
    if exists_no_follow(&to) {
        return Err(format!("{} already exists in asset root", to.display()));
    }
    fs::rename(&from, &to).map_err(|e| e.to_string())
}

fn purge_generated(build_root: &Path, generated: &[String], retain_signing_material: bool) -> CleanupReport {
    let mut report = CleanupReport::default();

    for name in generated {
        let is_signing_material = name == CERTIFICATE_FILE_NAME || name == PRIVATE_KEY_FILE_NAME;
        if retain_signing_material && is_signing_material {
            debug!(name = %name, "Retaining signing material");
            continue;
        }

        let path = build_root.join(name);
        match fs::remove_file(&path) {
            Ok(()) => report.purged.push(name.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Purge failed");
                report.warn(CleanupAction::Purge, name.clone(), e);
            }
        }
    }
    report
}

/// Names whose restore failed, in the order they were staged.
fn unrestored(report: &CleanupReport) -> Vec<String> {
    let mut names: Vec<String> = report
        .warnings
        .iter()
        .filter(|w| w.action == CleanupAction::Restore)
        .map(|w| w.item.clone())
        .collect();
    names.reverse();
    names
}

/// Drop the journal once nothing is left outside the asset root, otherwise
/// shrink it to what still needs restoring.
fn settle_journal(asset_root: &Path, leftover: Option<StagingJournal>, report: &mut CleanupReport) {
    let path = asset_root.join(JOURNAL_FILE_NAME);
    let outcome = match leftover {
        None => match fs::remove_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(|e| BundleError::io(&path, e)),
        },
        Some(journal) => journal.store(asset_root, false),
    };
    if let Err(e) = outcome {
        report.warn(CleanupAction::Unlock, path.display().to_string(), e);
    }
}

/// Put back the assets of a build that died without cleaning up.
///
/// Replays the journal in `asset_root`: staged entries return, generated
/// files are purged, and the build root lock is released if it still
/// belongs to the dead build. Returns `None` when there is no journal.
/// Only call this once the build that wrote the journal has stopped.
pub fn recover(asset_root: &Path) -> Result<Option<CleanupReport>> {
    let Some(journal) = StagingJournal::load(asset_root)? else {
        return Ok(None);
    };
    let asset_root = asset_root
        .canonicalize()
        .map_err(|e| BundleError::io(asset_root, e))?;
    info!(
        build_root = %journal.build_root.display(),
        pid = journal.pid,
        entries = journal.moved.len(),
        "Recovering staged assets"
    );

    let mut report = CleanupReport::default();
    for name in journal.moved.iter().rev() {
        let in_build = exists_no_follow(&journal.build_root.join(name));
        let at_home = exists_no_follow(&asset_root.join(name));
        if at_home && !in_build {
            // Journaled ahead of a move that never happened.
            continue;
        }
        match move_back(&asset_root, &journal.build_root, name) {
            Ok(()) => report.restored.push(name.clone()),
            Err(reason) => {
                warn!(name = %name, reason = %reason, "Recovery could not restore entry");
                report.warn(CleanupAction::Restore, name.clone(), reason);
            }
        }
    }

    let purge = purge_generated(&journal.build_root, &journal.generated, journal.retain_signing_material);
    report.purged = purge.purged;
    report.warnings.extend(purge.warnings);

    let lock_path = journal.build_root.join(LOCK_FILE_NAME);
    let holder = fs::read_to_string(&lock_path)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok());
    if holder == Some(journal.pid) {
        if let Err(e) = fs::remove_file(&lock_path) {
            report.warn(CleanupAction::Unlock, lock_path.display().to_string(), e);
        }
    }

    let leftover = unrestored(&report);
    let leftover = (!leftover.is_empty()).then(|| StagingJournal {
        moved: leftover,
        ..journal
    });
    settle_journal(&asset_root, leftover, &mut report);
    Ok(Some(report))
}

/// Canonical form of a path that may not exist yet: the deepest existing
/// ancestor is canonicalized and the missing tail appended.
fn resolve_absolute(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| BundleError::io(path, e))?
            .join(path)
    };

    let mut tail = Vec::new();
    let mut cursor = absolute.as_path();
    loop {
        match cursor.canonicalize() {
            Ok(mut base) => {
                for part in tail.iter().rev() {
                    base.push(part);
                }
                return Ok(base);
            }
            Err(e) => match (cursor.file_name(), cursor.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    cursor = parent;
                }
                _ => return Err(BundleError::io(path, e)),
            },
        }
    }
}

/// Exclusive, self-cleaning use of a build root for one build.
#[derive(Debug)]
pub struct StagingArea {
    asset_root: PathBuf,
    build_root: PathBuf,
    lock_path: PathBuf,
    plan: StagingPlan,
    generated: Vec<String>,
    retain_signing_material: bool,
    finished: bool,
}

impl StagingArea {
    /// Validate the roots and take the build lock.
    pub fn open(asset_root: &Path, build_root: &Path) -> Result<Self> {
        let asset_meta = fs::metadata(asset_root).map_err(|e| BundleError::io(asset_root, e))?;
        if !asset_meta.is_dir() {
            return Err(BundleError::InvalidRoots(format!(
                "asset root {} is not a directory",
                asset_root.display()
            )));
        }
        let assets = asset_root
            .canonicalize()
            .map_err(|e| BundleError::io(asset_root, e))?;
        let build = resolve_absolute(build_root)?;
        if assets.starts_with(&build) || build.starts_with(&assets) {
            return Err(BundleError::InvalidRoots(format!(
                "asset root {} and build root {} must not contain each other",
                assets.display(),
                build.display()
            )));
        }
        fs::create_dir_all(&build).map_err(|e| BundleError::io(&build, e))?;

        let mut area = Self {
            lock_path: build.join(LOCK_FILE_NAME),
            asset_root: assets,
            build_root: build,
            plan: StagingPlan::default(),
            generated: Vec::new(),
            retain_signing_material: false,
            // Nothing to clean up until both locks are held.
            finished: true,
        };

        // Asset root first: a half-staged root must never be hashed.
        area.journal(None).store(&area.asset_root, true)?;
        if let Err(e) = area.lock_build_root() {
            let _ = fs::remove_file(area.asset_root.join(JOURNAL_FILE_NAME));
            return Err(e);
        }

        debug!(
            assets = %area.asset_root.display(),
            build = %area.build_root.display(),
            "Asset root and build root locked"
        );
        area.finished = false;
        Ok(area)
    }

    fn lock_build_root(&self) -> Result<()> {
        let mut lock = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => BundleError::BuildLocked(self.lock_path.clone()),
                _ => BundleError::io(&self.lock_path, e),
            })?;
        // Holder's pid, for humans clearing a stale lock and for recovery.
        let _ = writeln!(lock, "{}", std::process::id());
        Ok(())
    }

    fn journal(&self, pending: Option<&str>) -> StagingJournal {
        let mut moved = self.plan.moved.clone();
        moved.extend(pending.map(str::to_string));
        StagingJournal {
            build_root: self.build_root.clone(),
            pid: std::process::id(),
            moved,
            generated: self.generated.clone(),
            retain_signing_material: self.retain_signing_material,
        }
    }

    /// Write the current plan, generated files and retention to the journal.
    pub fn sync_journal(&self) -> Result<()> {
        self.journal(None).store(&self.asset_root, false)
    }

    /// Keep the extracted certificate and key after the build.
    pub fn retain_signing_material(&mut self, retain: bool) {
        self.retain_signing_material = retain;
    }

    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn plan(&self) -> &StagingPlan {
        &self.plan
    }

    /// Record a file this build writes into the build root, for purging.
    pub fn register_generated(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.generated.contains(&name) {
            self.generated.push(name);
        }
    }

    /// Move top-level asset entries into the build root.
    ///
    /// Never overwrites. If any move fails, the moves made by this call are
    /// undone before the error is returned.
    pub fn stage(&mut self, names: &[String]) -> Result<()> {
        let start = self.plan.len();

        for name in names {
            if let Err(err) = self.stage_one(name) {
                warn!(name = %name, error = %err, "Staging failed, rolling back");
                self.unstage_since(start);
                return Err(err);
            }
        }

        info!(entries = names.len(), build_root = %self.build_root.display(), "Assets staged");
        Ok(())
    }

    fn stage_one(&mut self, name: &str) -> Result<()> {
        let from = self.asset_root.join(name);
        let to = self.build_root.join(name);

        if name == JOURNAL_FILE_NAME {
            return Err(BundleError::InvalidRoots(format!("{} cannot be staged", name)));
        }
        if exists_no_follow(&to) {
            return Err(BundleError::MoveConflict(to));
        }
        self.journal(Some(name)).store(&self.asset_root, false)?;
        fs::rename(&from, &to).map_err(|e| BundleError::io(&from, e))?;
        self.plan.moved.push(name.to_string());
        debug!(name, "Staged");
        Ok(())
    }

    fn unstage_since(&mut self, start: usize) {
        let rolled: Vec<String> = self.plan.moved.drain(start..).collect();
        for name in rolled.into_iter().rev() {
            if let Err(reason) = move_back(&self.asset_root, &self.build_root, &name) {
                warn!(name = %name, reason = %reason, "Could not undo staging move");
                // Left in the plan so restore tries again and reports it.
                self.plan.moved.push(name);
            }
        }
        if let Err(e) = self.sync_journal() {
            warn!(error = %e, "Could not rewrite staging journal");
        }
    }

    /// Move every staged entry back to the asset root.
    ///
    /// Every recorded item is attempted; failures become warnings. Calling
    /// this again after it has run is a no-op.
    pub fn restore(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let moved = std::mem::take(&mut self.plan.moved);

        for name in moved.into_iter().rev() {
            match move_back(&self.asset_root, &self.build_root, &name) {
                Ok(()) => report.restored.push(name),
                Err(reason) => {
                    warn!(name = %name, reason = %reason, "Restore failed");
                    report.warn(CleanupAction::Restore, name, reason);
                }
            }
        }

        if !report.restored.is_empty() {
            debug!(entries = report.restored.len(), "Assets restored");
        }
        report
    }

    /// Delete generated artifacts from the build root. The extracted
    /// certificate and key survive when `retain_signing_material` is set.
    /// Failures are warnings; an already missing file is not.
    pub fn purge(&self, generated: &[String], retain_signing_material: bool) -> CleanupReport {
        purge_generated(&self.build_root, generated, retain_signing_material)
    }

    fn cleanup(&mut self) -> CleanupReport {
        if self.finished {
            return CleanupReport::default();
        }
        self.finished = true;

        let mut report = self.restore();
        let purge = self.purge(&self.generated, self.retain_signing_material);
        report.purged = purge.purged;
        report.warnings.extend(purge.warnings);

        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                report.warn(CleanupAction::Unlock, self.lock_path.display().to_string(), e);
            }
        }

        // Entries that could not be restored keep the asset root journaled
        // so `recover` can retry them.
        let leftover = unrestored(&report);
        let leftover = (!leftover.is_empty()).then(|| StagingJournal {
            moved: leftover,
            ..self.journal(None)
        });
        settle_journal(&self.asset_root, leftover, &mut report);
        report
    }

    /// Restore, purge and release both locks. Runs exactly once.
    pub fn finish(mut self) -> CleanupReport {
        let report = self.cleanup();
        if report.is_clean() {
            debug!(
                restored = report.restored.len(),
                purged = report.purged.len(),
                "Build root cleaned up"
            );
        } else {
            warn!(warnings = report.warnings.len(), "Cleanup finished with warnings");
        }
        report
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let report = self.cleanup();
        for RestoreWarning { action, item, reason } in &report.warnings {
            warn!(?action, item = %item, reason = %reason, "Cleanup on drop left an item behind");
        }
    }
}
