//! Configuration loading and validation for pkpass.
//!
//! This module handles:
//! - Loading an optional `pkpass.toml`
//! - Config resolution order (CLI > env > working dir > XDG > defaults)
//! - Applying command-line overrides
//! - Reading signing secrets from the environment and validating the result

use pk_bundle::{
    BackendKind, BuildRequest, DigestAlgorithm, HashOptions, Secret, SigningConfig, SymlinkPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "pkpass.toml";

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "pkpass";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PKPASS_CONFIG";

/// Default variable holding the container unlock secret.
pub const CONTAINER_PASSWORD_ENV: &str = "PKPASS_CONTAINER_PASSWORD";

/// Default variable holding the key protection secret.
pub const KEY_PASSWORD_ENV: &str = "PKPASS_KEY_PASSWORD";

pub const DEFAULT_PASS_NAME: &str = "Generic";
pub const DEFAULT_BUILD_ROOT: &str = "build";
pub const DEFAULT_CONTAINER: &str = "Certificates.p12";
pub const DEFAULT_AUTHORITY: &str = "Apple Worldwide Developer Relations Certification Authority.pem";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable {var} is not set")]
    MissingSecret { var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the effective config file came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ConfigSource {
    Explicit(PathBuf),
    Environment(PathBuf),
    WorkingDir(PathBuf),
    Xdg(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Explicit(p)
            | ConfigSource::Environment(p)
            | ConfigSource::WorkingDir(p)
            | ConfigSource::Xdg(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

/// `[signing]` table. Secrets are never read from the file, only the names
/// of the variables that hold them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SigningSection {
    pub container: PathBuf,
    pub authority: PathBuf,
    pub backend: BackendKind,
    pub container_password_env: String,
    pub key_password_env: String,
}

impl Default for SigningSection {
    fn default() -> Self {
        Self {
            container: PathBuf::from(DEFAULT_CONTAINER),
            authority: PathBuf::from(DEFAULT_AUTHORITY),
            backend: BackendKind::default(),
            container_password_env: CONTAINER_PASSWORD_ENV.to_string(),
            key_password_env: KEY_PASSWORD_ENV.to_string(),
        }
    }
}

/// `[hashing]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashingSection {
    pub algorithm: DigestAlgorithm,
    pub symlinks: SymlinkPolicy,
    /// 0 picks one worker per available core.
    pub workers: usize,
}

/// Build configuration as stored in `pkpass.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub name: String,
    /// Defaults to `<name>.pass`.
    pub asset_root: Option<PathBuf>,
    pub build_root: PathBuf,
    pub retain_signing_material: bool,
    pub signing: SigningSection,
    pub hashing: HashingSection,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PASS_NAME.to_string(),
            asset_root: None,
            build_root: PathBuf::from(DEFAULT_BUILD_ROOT),
            retain_signing_material: false,
            signing: SigningSection::default(),
            hashing: HashingSection::default(),
        }
    }
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct BuildOverrides {
    pub name: Option<String>,
    pub asset_root: Option<PathBuf>,
    pub build_root: Option<PathBuf>,
    pub container: Option<PathBuf>,
    pub authority: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub container_password_env: Option<String>,
    pub key_password_env: Option<String>,
    pub algorithm: Option<DigestAlgorithm>,
    pub symlinks: Option<SymlinkPolicy>,
    pub workers: Option<usize>,
    /// Only ever turns retention on.
    pub retain_signing_material: bool,
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: BuildConfig,
    pub source: ConfigSource,
}

impl BuildConfig {
    /// Parse a config file.
    ///
    /// Relative paths written in the file are taken relative to the file's
    /// directory, so the same file works from any working directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound {
                path: path.to_path_buf(),
            },
            _ => ConfigError::IoError {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let parse_error = |source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        };
        let table: toml::Table = text.parse().map_err(parse_error)?;
        let mut config: BuildConfig = toml::Value::Table(table.clone())
            .try_into()
            .map_err(parse_error)?;

        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.anchor_file_paths(&table, base);
        }
        Ok(config)
    }

    /// Rebase the relative paths that `table` actually sets onto `base`.
    /// Built-in defaults stay relative to the working directory.
    fn anchor_file_paths(&mut self, table: &toml::Table, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        let signing = table.get("signing").and_then(toml::Value::as_table);
        let in_signing = |key: &str| signing.is_some_and(|t| t.contains_key(key));

        if let Some(root) = self.asset_root.as_mut() {
            anchor(root);
        }
        if table.contains_key("build_root") {
            anchor(&mut self.build_root);
        }
        if in_signing("container") {
            anchor(&mut self.signing.container);
        }
        if in_signing("authority") {
            anchor(&mut self.signing.authority);
        }
    }

    /// Effective asset root.
    pub fn asset_root(&self) -> PathBuf {
        self.asset_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.pass", self.name)))
    }

    pub fn apply(&mut self, overrides: BuildOverrides) {
        if let Some(name) = overrides.name {
            self.name = name;
        }
        if let Some(root) = overrides.asset_root {
            self.asset_root = Some(root);
        }
        if let Some(root) = overrides.build_root {
            self.build_root = root;
        }
        if let Some(container) = overrides.container {
            self.signing.container = container;
        }
        if let Some(authority) = overrides.authority {
            self.signing.authority = authority;
        }
        if let Some(backend) = overrides.backend {
            self.signing.backend = backend;
        }
        if let Some(var) = overrides.container_password_env {
            self.signing.container_password_env = var;
        }
        if let Some(var) = overrides.key_password_env {
            self.signing.key_password_env = var;
        }
        if let Some(algorithm) = overrides.algorithm {
            self.hashing.algorithm = algorithm;
        }
        if let Some(symlinks) = overrides.symlinks {
            self.hashing.symlinks = symlinks;
        }
        if let Some(workers) = overrides.workers {
            self.hashing.workers = workers;
        }
        self.retain_signing_material |= overrides.retain_signing_material;
    }

    /// Check values that do not depend on the environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("bundle name must not be empty".to_string()));
        }
        if self.signing.container_password_env.is_empty() || self.signing.key_password_env.is_empty() {
            return Err(ConfigError::Invalid(
                "secret variable names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hash_options(&self) -> HashOptions {
        HashOptions::default()
            .with_algorithm(self.hashing.algorithm)
            .with_symlinks(self.hashing.symlinks)
            .with_workers(self.hashing.workers)
    }

    /// Assemble a build request, reading secrets through `lookup`.
    pub fn build_request<F>(&self, lookup: F) -> Result<BuildRequest, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.validate()?;

        let unlock = read_secret(&lookup, &self.signing.container_password_env)?;
        let protection = read_secret(&lookup, &self.signing.key_password_env)?;
        if protection.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "key protection secret in {} must not be empty",
                self.signing.key_password_env
            )));
        }

        Ok(BuildRequest {
            asset_root: self.asset_root(),
            build_root: self.build_root.clone(),
            name: self.name.clone(),
            signing: SigningConfig {
                container: self.signing.container.clone(),
                unlock,
                protection,
                authority: self.signing.authority.clone(),
            },
            hashing: self.hash_options(),
            retain_signing_material: self.retain_signing_material,
            backend: self.signing.backend,
        })
    }
}

fn read_secret<F>(lookup: &F, var: &str) -> Result<Secret, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(Secret::from)
        .ok_or_else(|| ConfigError::MissingSecret {
            var: var.to_string(),
        })
}

/// Find the config file using the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit `--config` path (must exist)
/// 2. `PKPASS_CONFIG` (must exist)
/// 3. `pkpass.toml` in the working directory
/// 4. `$XDG_CONFIG_HOME/pkpass/config.toml` (or `~/.config/...`)
/// 5. Built-in defaults
pub fn resolve_config_source<F>(explicit: Option<&Path>, lookup: F, cwd: &Path) -> ConfigSource
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        return ConfigSource::Explicit(path.to_path_buf());
    }

    if let Some(path) = lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return ConfigSource::Environment(PathBuf::from(path));
    }

    let local = cwd.join(CONFIG_FILE_NAME);
    if local.is_file() {
        return ConfigSource::WorkingDir(local);
    }

    let xdg_config = lookup("XDG_CONFIG_HOME")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")));
    if let Some(dir) = xdg_config {
        let path = dir.join(CONFIG_DIR_NAME).join("config.toml");
        if path.is_file() {
            return ConfigSource::Xdg(path);
        }
    }

    ConfigSource::Defaults
}

/// Load configuration with the standard resolution order.
pub fn load_config<F>(explicit: Option<&Path>, lookup: F, cwd: &Path) -> Result<ResolvedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let source = resolve_config_source(explicit, lookup, cwd);
    let config = match source.path() {
        Some(path) => BuildConfig::from_file(path)?,
        None => BuildConfig::default(),
    };
    debug!(source = ?source, "Configuration resolved");
    Ok(ResolvedConfig { config, source })
}
