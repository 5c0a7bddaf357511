//! pkpass - signed pass bundle builder
//!
//! The main entry point, handling:
//! - Building signed `.pkpass` bundles from an asset directory
//! - Printing the manifest of an asset directory without signing
//! - Verifying existing bundles
//! - Recovering an asset directory left half-staged by a killed build

use clap::{Args, Parser, Subcommand};
use pk_bundle::{
    hash_asset_root, recover, BackendKind, BundleReader, DigestAlgorithm, PassBuilder,
    PassManifest, SymlinkPolicy, Trust,
};
use pk_core::config::{load_config, BuildConfig, BuildOverrides, ConfigError};
use pk_core::exit_codes::ExitCode;
use pk_core::logging::{generate_run_id, init_logging, LogConfig, LogFormat, LogLevel};
use pk_core::output::{
    build_error_details, error_envelope, render_build_error_human, render_build_human,
    render_manifest_human, render_recovery_human, render_verification_human, success_envelope,
    OutputFormat,
};
use pk_core::signal::{self, SignalState};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// pkpass - Build and verify signed pass bundles
#[derive(Parser)]
#[command(name = "pkpass")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (default: $PKPASS_CONFIG, ./pkpass.toml, then $XDG_CONFIG_HOME/pkpass/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format on stderr
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash, sign and package an asset directory into a .pkpass bundle
    Build(BuildArgs),

    /// Print the manifest for an asset directory without signing
    Manifest(ManifestArgs),

    /// Verify an existing bundle's members, digests and signature
    Verify(VerifyArgs),

    /// Put back assets staged by a build that was killed before cleaning up
    Recover(RecoverArgs),
}

// ============================================================================
// Command argument structs
// ============================================================================

#[derive(Args, Debug, Default)]
struct HashingArgs {
    /// Manifest digest algorithm (sha1, sha256)
    #[arg(long)]
    digest: Option<DigestAlgorithm>,

    /// Symlinks inside the asset root (reject, skip, follow)
    #[arg(long)]
    symlinks: Option<SymlinkPolicy>,

    /// Hashing threads (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Asset directory (default: <name>.pass)
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Directory the build works in and writes the bundle to
    #[arg(long)]
    build_root: Option<PathBuf>,

    /// Bundle name; the output is <name>.pkpass
    #[arg(long)]
    name: Option<String>,

    /// PKCS#12 container with the pass signing certificate and key
    #[arg(long)]
    certificate: Option<PathBuf>,

    /// Authority certificate (PEM or DER) included in the signature
    #[arg(long)]
    authority: Option<PathBuf>,

    /// Signing backend (openssl, openssl-cli)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Variable holding the container password
    #[arg(long, value_name = "VAR")]
    container_password_env: Option<String>,

    /// Variable holding the key protection password
    #[arg(long, value_name = "VAR")]
    key_password_env: Option<String>,

    /// Keep the extracted certificate and key in the build root
    #[arg(long)]
    retain_artifacts: bool,

    #[command(flatten)]
    hashing: HashingArgs,
}

#[derive(Args, Debug)]
struct ManifestArgs {
    /// Asset directory (default: <name>.pass from config)
    #[arg(long)]
    assets: Option<PathBuf>,

    #[command(flatten)]
    hashing: HashingArgs,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Bundle to verify
    bundle: PathBuf,

    /// Authority certificate to validate the signer against
    #[arg(long, conflicts_with = "signature_only")]
    authority: Option<PathBuf>,

    /// Check the signature without validating the certificate chain
    #[arg(long)]
    signature_only: bool,
}

#[derive(Args, Debug)]
struct RecoverArgs {
    /// Asset directory (default: <name>.pass from config)
    #[arg(long)]
    assets: Option<PathBuf>,
}

/// Per-invocation state shared by the commands.
struct Context {
    format: OutputFormat,
    run_id: String,
    config_path: Option<PathBuf>,
}

impl Context {
    fn load_config(&self) -> Result<BuildConfig, ConfigError> {
        let cwd = std::env::current_dir().map_err(|source| ConfigError::IoError {
            path: PathBuf::from("."),
            source,
        })?;
        let resolved = load_config(self.config_path.as_deref(), env_lookup, &cwd)?;
        debug!(source = ?resolved.source, "Using configuration");
        Ok(resolved.config)
    }

    fn emit_success<T: serde::Serialize>(&self, command: &str, result: &T, human: String) -> ExitCode {
        match self.format {
            OutputFormat::Json => print_json(&success_envelope(command, &self.run_id, result)),
            OutputFormat::Human => print!("{}", human),
        }
        ExitCode::Clean
    }

    fn emit_error(
        &self,
        command: &str,
        code: ExitCode,
        message: &str,
        details: Option<Value>,
        human: String,
    ) -> ExitCode {
        match self.format {
            OutputFormat::Json => {
                let value = error_envelope(command, &self.run_id, code, message, details);
                eprintln!("{}", to_pretty(&value));
            }
            OutputFormat::Human => eprint!("{}", human),
        }
        code
    }

    fn config_error(&self, command: &str, err: &ConfigError) -> ExitCode {
        let code = ExitCode::for_config_error(err);
        let message = err.to_string();
        self.emit_error(command, code, &message, None, format!("Configuration error: {}\n", message))
    }

    fn bundle_error(&self, command: &str, err: &pk_bundle::BundleError) -> ExitCode {
        let code = ExitCode::for_bundle_error(err);
        let message = err.to_string();
        self.emit_error(command, code, &message, None, format!("Error: {}\n", message))
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn to_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn print_json(value: &Value) {
    println!("{}", to_pretty(value));
}

// ============================================================================
// Main entry point
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(
        LogLevel::from_verbosity(cli.global.verbose, cli.global.quiet),
        cli.global.log_format,
    );
    init_logging(&log_config);

    let ctx = Context {
        format: cli.global.format,
        run_id: generate_run_id(),
        config_path: cli.global.config.clone(),
    };
    let span = info_span!("run", run_id = %ctx.run_id);
    let exit_code = span.in_scope(|| match &cli.command {
        Commands::Build(args) => run_build(&ctx, args),
        Commands::Manifest(args) => run_manifest(&ctx, args),
        Commands::Verify(args) => run_verify(&ctx, args),
        Commands::Recover(args) => run_recover(&ctx, args),
    });

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Command implementations
// ============================================================================

fn hashing_overrides(args: &HashingArgs, overrides: &mut BuildOverrides) {
    overrides.algorithm = args.digest;
    overrides.symlinks = args.symlinks;
    overrides.workers = args.workers;
}

fn run_build(ctx: &Context, args: &BuildArgs) -> ExitCode {
    let mut config = match ctx.load_config() {
        Ok(config) => config,
        Err(e) => return ctx.config_error("build", &e),
    };

    let mut overrides = BuildOverrides {
        name: args.name.clone(),
        asset_root: args.assets.clone(),
        build_root: args.build_root.clone(),
        container: args.certificate.clone(),
        authority: args.authority.clone(),
        backend: args.backend,
        container_password_env: args.container_password_env.clone(),
        key_password_env: args.key_password_env.clone(),
        retain_signing_material: args.retain_artifacts,
        ..BuildOverrides::default()
    };
    hashing_overrides(&args.hashing, &mut overrides);
    config.apply(overrides);

    let request = match config.build_request(env_lookup) {
        Ok(request) => request,
        Err(e) => return ctx.config_error("build", &e),
    };

    info!(
        assets = %request.asset_root.display(),
        build_root = %request.build_root.display(),
        name = %request.name,
        backend = %request.backend,
        "Starting build"
    );

    let signals = Arc::new(SignalState::new());
    if let Err(e) = signal::install(Arc::clone(&signals)) {
        warn!(error = %e, "Could not install interrupt handler");
    }

    let builder = PassBuilder::new(request).with_cancel_flag(signals.cancel_flag());
    match builder.build() {
        Ok(report) => {
            let human = render_build_human(&report);
            ctx.emit_success("build", &report, human)
        }
        Err(err) => {
            let code = ExitCode::for_build_error(&err);
            ctx.emit_error(
                "build",
                code,
                &err.to_string(),
                Some(build_error_details(&err)),
                render_build_error_human(&err),
            )
        }
    }
}

fn run_manifest(ctx: &Context, args: &ManifestArgs) -> ExitCode {
    let mut config = match ctx.load_config() {
        Ok(config) => config,
        Err(e) => return ctx.config_error("manifest", &e),
    };
    let mut overrides = BuildOverrides {
        asset_root: args.assets.clone(),
        ..BuildOverrides::default()
    };
    hashing_overrides(&args.hashing, &mut overrides);
    config.apply(overrides);

    let asset_root = config.asset_root();
    let options = config.hash_options();

    let manifest = hash_asset_root(&asset_root, &options)
        .and_then(|hashed| PassManifest::from_hashed(&hashed, options.algorithm));
    let manifest = match manifest {
        Ok(manifest) => manifest,
        Err(e) => return ctx.bundle_error("manifest", &e),
    };

    match ctx.format {
        // The canonical bytes are the payload: exactly what a build would sign.
        OutputFormat::Json => match manifest.to_canonical_bytes() {
            Ok(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
            Err(e) => return ctx.bundle_error("manifest", &e),
        },
        OutputFormat::Human => print!("{}", render_manifest_human(&manifest)),
    }
    ExitCode::Clean
}

fn run_verify(ctx: &Context, args: &VerifyArgs) -> ExitCode {
    let trust = if args.signature_only {
        Ok(Trust::SignatureOnly)
    } else {
        let authority = match &args.authority {
            Some(path) => path.clone(),
            None => match ctx.load_config() {
                Ok(config) => config.signing.authority,
                Err(e) => return ctx.config_error("verify", &e),
            },
        };
        Trust::from_authority_file(&authority)
    };

    let result = trust.and_then(|trust| {
        let mut reader = BundleReader::open(&args.bundle)?;
        reader.verify(&trust)
    });

    match result {
        Ok(verification) => {
            let human = render_verification_human(&args.bundle, &verification);
            let payload = serde_json::json!({
                "bundle": display_path(&args.bundle),
                "verification": verification,
            });
            ctx.emit_success("verify", &payload, human)
        }
        Err(e) => ctx.bundle_error("verify", &e),
    }
}

fn run_recover(ctx: &Context, args: &RecoverArgs) -> ExitCode {
    let asset_root = match &args.assets {
        Some(path) => path.clone(),
        None => match ctx.load_config() {
            Ok(config) => config.asset_root(),
            Err(e) => return ctx.config_error("recover", &e),
        },
    };

    let report = match recover(&asset_root) {
        Ok(report) => report,
        Err(e) => return ctx.bundle_error("recover", &e),
    };
    let human = render_recovery_human(&asset_root, report.as_ref());
    let payload = serde_json::json!({
        "asset_root": display_path(&asset_root),
        "recovered": report.is_some(),
        "cleanup": report,
    });

    match report {
        Some(report) if !report.is_clean() => ctx.emit_error(
            "recover",
            ExitCode::IoError,
            "recovery left items behind",
            Some(payload),
            human,
        ),
        _ => ctx.emit_success("recover", &payload, human),
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
