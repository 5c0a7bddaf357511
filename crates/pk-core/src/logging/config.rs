//! Level, format and filter selection for the log subscriber.
//!
//! Sources, highest first: `-v`/`-q` and `--log-format` on the command
//! line, then `PKPASS_LOG` and `PKPASS_LOG_FORMAT`, then raw `RUST_LOG`
//! directives.

use serde::{Deserialize, Serialize};

/// Crates whose events pass the level filter.
const LOG_TARGETS: &[&str] = &["pk_core", "pk_bundle"];

/// How events are rendered on stderr.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[value(alias = "pretty")]
    Human,
    #[value(alias = "json")]
    Jsonl,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(s, true)
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum level for the pkpass crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    /// Build progress stays quiet unless asked for.
    #[default]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    const NAMES: &'static [(&'static str, LogLevel)] = &[
        ("trace", LogLevel::Trace),
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("warning", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("off", LogLevel::Off),
        ("none", LogLevel::Off),
    ];

    /// Level selected by `-v` (repeatable) and `-q`.
    ///
    /// Returns `None` when neither flag is given so the environment decides.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Option<Self> {
        if quiet {
            return Some(LogLevel::Error);
        }
        match verbose {
            0 => None,
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    }

    /// Directive spelling understood by `EnvFilter`.
    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, level)| *level == self)
            .map(|(name, _)| *name)
            .unwrap_or("warn")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, level)| *level)
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Raw `RUST_LOG` directives; used only when no pkpass-specific level is set.
    pub directives: Option<String>,
    /// Whether to include timestamps in human output.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LogLevel::Warn,
            directives: None,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Create config from the process environment and CLI overrides.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), cli_level, cli_format)
    }

    /// Create config from an arbitrary variable lookup.
    ///
    /// Level precedence: CLI, then `PKPASS_LOG`, then `RUST_LOG` directives.
    /// Format precedence: CLI, then `PKPASS_LOG_FORMAT`.
    pub fn from_lookup<F>(lookup: F, cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LogConfig::default();

        let env_level = lookup("PKPASS_LOG").and_then(|v| v.parse::<LogLevel>().ok());
        match (cli_level, env_level) {
            (Some(level), _) | (None, Some(level)) => config.level = level,
            (None, None) => {
                config.directives = lookup("RUST_LOG").filter(|v| !v.trim().is_empty());
            }
        }

        if let Some(format) = cli_format.or_else(|| {
            lookup("PKPASS_LOG_FORMAT").and_then(|v| v.parse::<LogFormat>().ok())
        }) {
            config.format = format;
        }

        config
    }

    /// Filter directives for `EnvFilter`.
    pub fn filter_directives(&self) -> String {
        if let Some(raw) = &self.directives {
            return raw.clone();
        }
        LOG_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Pin the level, discarding any raw `RUST_LOG` directives.
    pub fn with_level(self, level: LogLevel) -> Self {
        LogConfig {
            level,
            directives: None,
            ..self
        }
    }

    pub fn with_format(self, format: LogFormat) -> Self {
        LogConfig { format, ..self }
    }

    pub fn without_timestamps(self) -> Self {
        LogConfig {
            timestamps: false,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("human".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert_eq!("jsonl".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0, false), None);
        assert_eq!(LogLevel::from_verbosity(1, false), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_verbosity(2, false), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_verbosity(5, false), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_verbosity(3, true), Some(LogLevel::Error));
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = LogConfig::from_lookup(lookup(&[]), None, None);
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.filter_directives(), "pk_core=warn,pk_bundle=warn");
    }

    #[test]
    fn test_pkpass_log_beats_rust_log() {
        let config = LogConfig::from_lookup(
            lookup(&[("PKPASS_LOG", "debug"), ("RUST_LOG", "trace")]),
            None,
            None,
        );
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.directives, None);
    }

    #[test]
    fn test_rust_log_passes_through() {
        let config = LogConfig::from_lookup(lookup(&[("RUST_LOG", "pk_bundle=trace")]), None, None);
        assert_eq!(config.filter_directives(), "pk_bundle=trace");
    }

    #[test]
    fn test_cli_overrides_environment() {
        let config = LogConfig::from_lookup(
            lookup(&[("PKPASS_LOG", "debug"), ("PKPASS_LOG_FORMAT", "jsonl")]),
            Some(LogLevel::Error),
            Some(LogFormat::Human),
        );
        assert_eq!(config.level, LogLevel::Error);
        assert_eq!(config.format, LogFormat::Human);
    }

    #[test]
    fn test_format_from_environment() {
        let config = LogConfig::from_lookup(lookup(&[("PKPASS_LOG_FORMAT", "jsonl")]), None, None);
        assert_eq!(config.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_level_names_round_trip_through_display() {
        for level in [LogLevel::Trace, LogLevel::Info, LogLevel::Warn, LogLevel::Off] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
        assert_eq!(" WARNING ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::default()
            .with_format(LogFormat::Jsonl)
            .with_level(LogLevel::Debug)
            .without_timestamps();

        assert_eq!(config.format, LogFormat::Jsonl);
        assert_eq!(config.filter_directives(), "pk_core=debug,pk_bundle=debug");
        assert!(!config.timestamps);
    }
}
