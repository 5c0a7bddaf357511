//! Content hashing for the asset tree.
//!
//! Walks an asset root, enumerates every regular file and computes a digest
//! over its full content. Hashing may be spread across worker threads; the
//! result is always returned sorted by relative name so the worker count
//! never shows up in the manifest.

use crate::staging::JOURNAL_FILE_NAME;
use crate::{BundleError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Read buffer used while hashing.
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Finder litter that never belongs in a bundle.
const IGNORED_FILE_NAMES: &[&str] = &[".DS_Store"];

/// Digest algorithm used for manifest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-1, the digest Wallet manifests have always used.
    #[default]
    Sha1,
    /// SHA-256.
    Sha256,
}

impl DigestAlgorithm {
    /// Length of a hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
        }
    }

    /// Digest an in-memory buffer.
    pub fn digest_hex(self, data: &[u8]) -> String {
        let mut hasher = ContentHasher::new(self);
        hasher.update(data);
        hasher.finish_hex()
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(DigestAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(format!("unknown digest algorithm: {}", s)),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "sha1"),
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

enum ContentHasher {
    Sha1(openssl::sha::Sha1),
    Sha256(Sha256),
}

impl ContentHasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => ContentHasher::Sha1(openssl::sha::Sha1::new()),
            DigestAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha1(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
        }
    }

    fn finish_hex(self) -> String {
        match self {
            ContentHasher::Sha1(h) => hex::encode(h.finish()),
            ContentHasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// How symlinks inside the asset root are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkPolicy {
    /// Any symlink fails the build.
    #[default]
    Reject,
    /// Symlinks are left out of the manifest.
    Skip,
    /// Links to regular files are hashed as the target's content.
    Follow,
}

impl std::str::FromStr for SymlinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(SymlinkPolicy::Reject),
            "skip" => Ok(SymlinkPolicy::Skip),
            "follow" => Ok(SymlinkPolicy::Follow),
            _ => Err(format!("unknown symlink policy: {}", s)),
        }
    }
}

impl std::fmt::Display for SymlinkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymlinkPolicy::Reject => write!(f, "reject"),
            SymlinkPolicy::Skip => write!(f, "skip"),
            SymlinkPolicy::Follow => write!(f, "follow"),
        }
    }
}

/// Options for hashing an asset root.
#[derive(Debug, Clone, Default)]
pub struct HashOptions {
    pub algorithm: DigestAlgorithm,
    pub symlinks: SymlinkPolicy,
    /// Worker threads; 0 picks the available parallelism.
    pub workers: usize,
}

impl HashOptions {
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_symlinks(mut self, symlinks: SymlinkPolicy) -> Self {
        self.symlinks = symlinks;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    fn effective_workers(&self, files: usize) -> usize {
        let wanted = if self.workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.workers
        };
        wanted.min(files).max(1)
    }
}

/// A regular file found under the asset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFile {
    /// Path relative to the asset root, `/`-separated.
    pub relative_name: String,
    pub absolute_path: PathBuf,
    pub bytes: u64,
}

/// An asset together with its content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedAsset {
    pub file: AssetFile,
    pub digest: String,
}

/// Enumerate every regular file under `root`, sorted by relative name.
pub fn enumerate_assets(root: &Path, symlinks: SymlinkPolicy) -> Result<Vec<AssetFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            let source = err
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"));
            BundleError::io(path, source)
        })?;

        if entry.depth() == 0 {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            continue;
        }

        if IGNORED_FILE_NAMES
            .iter()
            .any(|name| entry.file_name() == std::ffi::OsStr::new(name))
        {
            debug!(path = %path.display(), "Skipping ignored file");
            continue;
        }

        // A build's own journal, including its in-flight temporary copies.
        if entry.depth() == 1
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(JOURNAL_FILE_NAME))
        {
            continue;
        }

        let bytes = if file_type.is_symlink() {
            match symlinks {
                SymlinkPolicy::Reject => {
                    return Err(BundleError::UnsupportedEntry(path.to_path_buf()));
                }
                SymlinkPolicy::Skip => {
                    warn!(path = %path.display(), "Skipping symlink in asset root");
                    continue;
                }
                SymlinkPolicy::Follow => {
                    let meta = fs::metadata(path).map_err(|e| BundleError::io(path, e))?;
                    if !meta.is_file() {
                        return Err(BundleError::UnsupportedEntry(path.to_path_buf()));
                    }
                    meta.len()
                }
            }
        } else if file_type.is_file() {
            entry
                .metadata()
                .map_err(|e| BundleError::io(path, io::Error::other(e.to_string())))?
                .len()
        } else {
            warn!(path = %path.display(), "Skipping non-regular file");
            continue;
        };

        files.push(AssetFile {
            relative_name: relative_name(root, path)?,
            absolute_path: path.to_path_buf(),
            bytes,
        });
    }

    if files.is_empty() {
        return Err(BundleError::EmptyRoot(root.to_path_buf()));
    }

    files.sort_by(|a, b| a.relative_name.cmp(&b.relative_name));
    Ok(files)
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| BundleError::InvalidRoots(format!("{} is outside the asset root", path.display())))?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    BundleError::Serialization(format!(
                        "file name is not valid UTF-8: {}",
                        path.display()
                    ))
                })?;
                parts.push(part);
            }
            _ => {
                return Err(BundleError::Serialization(format!(
                    "unexpected path component in {}",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Digest a file's entire content.
pub fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> Result<String> {
    let mut file = File::open(path).map_err(|e| BundleError::io(path, e))?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BundleError::io(path, e)),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finish_hex())
}

/// Hash a set of files, possibly in parallel. Output is sorted by relative name.
pub fn hash_assets(files: Vec<AssetFile>, options: &HashOptions) -> Result<Vec<HashedAsset>> {
    let workers = options.effective_workers(files.len());
    let algorithm = options.algorithm;

    let mut hashed = if workers <= 1 {
        files
            .into_iter()
            .map(|file| {
                let digest = hash_file(&file.absolute_path, algorithm)?;
                Ok(HashedAsset { file, digest })
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let chunk_size = files.len().div_ceil(workers);
        let results: Vec<Result<HashedAsset>> = thread::scope(|scope| {
            let handles: Vec<_> = files
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|file| {
                                let digest = hash_file(&file.absolute_path, algorithm)?;
                                Ok(HashedAsset {
                                    file: file.clone(),
                                    digest,
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(results) => results,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });
        results.into_iter().collect::<Result<Vec<_>>>()?
    };

    hashed.sort_by(|a, b| a.file.relative_name.cmp(&b.file.relative_name));
    debug!(files = hashed.len(), workers, %algorithm, "Hashed assets");
    Ok(hashed)
}

/// Enumerate and hash every file under `root`.
pub fn hash_asset_root(root: &Path, options: &HashOptions) -> Result<Vec<HashedAsset>> {
    let files = enumerate_assets(root, options.symlinks)?;
    let hashed = hash_assets(files, options)?;

    info!(
        root = %root.display(),
        files = hashed.len(),
        bytes = hashed.iter().map(|h| h.file.bytes).sum::<u64>(),
        algorithm = %options.algorithm,
        "Asset root hashed"
    );
    Ok(hashed)
}
