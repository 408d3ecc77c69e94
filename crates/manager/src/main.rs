//! Certward - certificate storage inspection and maintenance

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use certward::{
    clean_storage, in_renewal_window, ChainInfo, CleanOptions, FileStorage, Storage, StorageKeys,
};
use certward_common::OperationContext;
use certward_config::Config;

/// Certward - TLS certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "certward")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTWARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// List stored certificates and their renewal state (default)
    Status,
    /// Delete stale OCSP staples and long-expired certificates
    Clean {
        /// Days an expired certificate is kept before deletion
        #[arg(long = "grace-days", default_value_t = 14)]
        grace_days: u64,

        /// Leave OCSP staples alone
        #[arg(long = "keep-staples")]
        keep_staples: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Test => test_config(&config, cli.config.as_deref()),
        Commands::Status => show_status(&config).await,
        Commands::Clean {
            grace_days,
            keep_staples,
        } => {
            let options = CleanOptions {
                ocsp_staples: !keep_staples,
                expired_certs: true,
                grace_period: Duration::from_secs(grace_days * 24 * 60 * 60),
            };
            clean(&config, options).await
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(Config::default())
        }
    }
}

/// Validate configuration and report problems
fn test_config(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    let result = config.validate();

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    for error in &result.errors {
        eprintln!("error: {error}");
    }

    let shown = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());
    if !result.is_valid() {
        anyhow::bail!(
            "configuration {} has {} error(s)",
            shown,
            result.errors.len()
        );
    }

    info!(
        storage = %config.storage.path.display(),
        on_demand = config.on_demand.is_some(),
        capacity = config.cache.capacity,
        "Configuration test successful"
    );
    println!("certward: configuration {shown} test is successful");
    Ok(())
}

/// Print every stored certificate with its renewal state
async fn show_status(config: &Config) -> Result<()> {
    let storage = FileStorage::from_config(&config.storage);
    let keys = match storage.list(StorageKeys::CERTIFICATES, true).await {
        Ok(keys) => keys,
        Err(e) if e.is_not_found() => {
            println!("no certificates in {}", storage.root().display());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to list certificates"),
    };

    let now = Utc::now();
    for key in keys.iter().filter(|key| key.ends_with(".crt")) {
        let pem = storage
            .load(key)
            .await
            .with_context(|| format!("Failed to load {key}"))?;
        let info = match ChainInfo::from_pem(&pem) {
            Ok(info) => info,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable certificate");
                continue;
            }
        };

        let state = if now > info.not_after {
            "EXPIRED"
        } else if in_renewal_window(
            info.not_before,
            info.not_after,
            config.renewal_window_ratio,
            now,
        ) {
            "RENEW"
        } else {
            "VALID"
        };
        println!(
            "{state:<8} {:<40} expires {} ({} days)",
            info.names.join(","),
            info.not_after.format("%Y-%m-%d %H:%M UTC"),
            (info.not_after - now).num_days()
        );
    }
    Ok(())
}

async fn clean(config: &Config, options: CleanOptions) -> Result<()> {
    let storage = FileStorage::from_config(&config.storage);
    let ctx = OperationContext::new();
    let report = clean_storage(&ctx, &storage, &options).await;
    println!(
        "deleted {} staple(s), {} certificate(s), {} site folder(s)",
        report.staples_deleted, report.certificates_deleted, report.sites_deleted
    );
    Ok(())
}
