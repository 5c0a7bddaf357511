//! Log output for `pkpass`.
//!
//! Two renderings of the same `tracing` events, both on stderr so stdout
//! stays free for reports and manifests:
//! - `human`: compact lines, coloured only when stderr is a terminal
//! - `jsonl`: one JSON object per event, carrying the `run` span fields
//!
//! ```ignore
//! use pk_core::logging::{generate_run_id, init_logging, LogConfig};
//!
//! init_logging(&LogConfig::from_env(None, None));
//! let run = tracing::info_span!("run", run_id = %generate_run_id());
//! run.in_scope(|| tracing::info!(assets = "Generic.pass", "Starting build"));
//! ```
//!
//! Secret values never reach a logging macro; only the names of the
//! variables that hold them do.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber. Call once, before the first event.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(LogConfig::default().filter_directives()));

    // Exactly one of the two layers is Some; a None layer is a no-op.
    let (human, jsonl) = match config.format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            let layer = if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            };
            (Some(layer), None)
        }
        LogFormat::Jsonl => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false);
            (None, Some(layer))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(human)
        .with(jsonl)
        .init();
}

/// Fresh `run-<12 hex>` id tying one invocation's log lines and output together.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    // First 12 hex chars are enough to tell runs apart in a log stream.
    format!("run-{}", &uuid[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_hex_and_distinct() {
        let ids: Vec<String> = (0..8).map(|_| generate_run_id()).collect();
        for id in &ids {
            let hex = id.strip_prefix("run-").unwrap();
            assert_eq!(hex.len(), 12);
            assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn default_filter_is_valid() {
        let directives = LogConfig::default().filter_directives();
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
