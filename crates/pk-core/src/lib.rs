//! pkpass CLI library
//!
//! This library provides the command-line side of the bundle builder:
//! - Exit codes for CLI operations
//! - Configuration loading and validation
//! - Logging setup
//! - Output envelopes and human-readable rendering
//! - Interrupt handling
//!
//! The binary entry point is in `main.rs`.

pub mod config;
pub mod exit_codes;
pub mod logging;
pub mod output;
pub mod signal;
