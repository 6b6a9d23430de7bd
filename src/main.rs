// RateKeeper - Main Entry Point
//
// Durable multi-window admission control:
// - `serve` runs the JSON API, metrics listener, and maintenance loops
// - one-shot subcommands drive the same library calls from scripts
//
// Exit codes: 0 admitted/success, 2 blocked, 3 batch too large,
// 4 configuration error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ratekeeper::admin::{AdminOverride, OverrideRequest};
use ratekeeper::analytics::{ReportType, UsageAnalytics};
use ratekeeper::config::Config;
use ratekeeper::limiter::{BlockReason, Decision, RateLimitError, RateLimiter};
use ratekeeper::maintenance::Maintenance;
use ratekeeper::metrics;
use ratekeeper::metrics_server;
use ratekeeper::server::{self, AppState};
use ratekeeper::store::UsageStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

const EXIT_BLOCKED: i32 = 2;
const EXIT_BATCH_TOO_LARGE: i32 = 3;
const EXIT_CONFIG: i32 = 4;

/// RateKeeper: persistent multi-window admission control
#[derive(Parser, Debug)]
#[command(name = "ratekeeper")]
#[command(version = "0.1.0")]
#[command(about = "Durable admission control with calendar and burst windows", long_about = None)]
struct Args {
    /// Path to the configuration file (default: ratekeeper.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission API server with maintenance loops
    Serve,
    /// Check admission for a request without consuming anything
    Check {
        identifier: String,
        operation_type: String,
        /// Units the request would consume
        #[arg(long, default_value_t = 1)]
        amount: u64,
    },
    /// Check admission and record the consumption if admitted
    Consume {
        identifier: String,
        operation_type: String,
        #[arg(long, default_value_t = 1)]
        amount: u64,
        /// User recorded on the usage record
        #[arg(long)]
        user: Option<String>,
    },
    /// Show usage against every window
    Status {
        identifier: String,
        /// Limit output to one operation type
        operation_type: Option<String>,
    },
    /// Manage rate limit overrides
    Override {
        #[command(subcommand)]
        action: OverrideCommands,
    },
    /// Reset usage counters
    Reset {
        operation_type: String,
        /// Identifier to reset; required unless --all is given
        identifier: Option<String>,
        /// Reset every identifier with this operation type
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "admin")]
        performed_by: String,
    },
    /// Generate a usage report (daily, weekly, or monthly)
    Report {
        report_type: String,
        #[arg(long)]
        operation_type: Option<String>,
    },
    /// Run one maintenance pass and exit
    Maintain,
}

#[derive(Subcommand, Debug)]
enum OverrideCommands {
    /// Grant a time-bounded override for one key
    Grant {
        identifier: String,
        operation_type: String,
        #[arg(long, default_value = "")]
        justification: String,
        /// Override duration; defaults to the configured duration
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long, default_value = "admin")]
        requested_by: String,
    },
    /// Revoke an active override
    Revoke {
        identifier: String,
        operation_type: String,
        #[arg(long, default_value = "admin")]
        performed_by: String,
    },
    /// Grant overrides for every tracked key of an operation type
    Emergency {
        operation_type: String,
        #[arg(long)]
        justification: String,
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long, default_value = "admin")]
        performed_by: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let level = if args.verbose {
        Level::DEBUG
    } else {
        match config.log_level() {
            Ok(level) => level,
            Err(e) => {
                eprintln!("Configuration error: {e:#}");
                std::process::exit(EXIT_CONFIG);
            }
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let code = run(args.command, config).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

async fn run(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Serve => serve(config).await.map(|_| 0),
        Commands::Check {
            identifier,
            operation_type,
            amount,
        } => check(config, &identifier, &operation_type, amount).await,
        Commands::Consume {
            identifier,
            operation_type,
            amount,
            user,
        } => consume(config, &identifier, &operation_type, amount, user).await,
        Commands::Status {
            identifier,
            operation_type,
        } => status(config, &identifier, operation_type.as_deref()).await,
        Commands::Override { action } => override_command(config, action).await,
        Commands::Reset {
            operation_type,
            identifier,
            all,
            performed_by,
        } => reset(config, &operation_type, identifier.as_deref(), all, &performed_by).await,
        Commands::Report {
            report_type,
            operation_type,
        } => report(config, &report_type, operation_type.as_deref()).await,
        Commands::Maintain => maintain(config).await,
    }
}

/// Open the store and wire up the shared layers.
async fn build_state(config: Config) -> Result<AppState> {
    let data_dir = config.storage.data_directory.clone();
    let io_timeout = Duration::from_millis(config.storage.io_timeout_ms);
    let store = Arc::new(
        UsageStore::open(data_dir, io_timeout)
            .await
            .context("Failed to open usage store")?,
    );

    let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), config));
    let admin = Arc::new(AdminOverride::new(
        Arc::clone(&store),
        limiter.config_handle(),
    ));
    let analytics = Arc::new(UsageAnalytics::new(store, limiter.config_handle()));

    Ok(AppState {
        limiter,
        admin,
        analytics,
    })
}

async fn serve(config: Config) -> Result<()> {
    info!("RateKeeper v{} starting...", env!("CARGO_PKG_VERSION"));

    metrics::init().context("Failed to initialize metrics")?;

    let metrics_config = config.metrics.clone();
    let server_config = config.server.clone();
    let state = build_state(config).await?;

    if metrics_config.enabled {
        let port = metrics_config.port;
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let maintenance = Arc::new(Maintenance::new(
        state.limiter.store(),
        state.limiter.config_handle(),
        Arc::clone(&state.admin),
        Arc::clone(&state.analytics),
    ));
    let _handles = maintenance.spawn_all().await;

    server::start_server(state, &server_config.bind_address, server_config.port).await
}

async fn check(config: Config, identifier: &str, operation_type: &str, amount: u64) -> Result<i32> {
    let state = build_state(config).await?;
    let decision = state.limiter.check(identifier, operation_type, amount).await;
    println!("{decision}");
    Ok(match decision {
        Decision::Blocked(BlockReason::BatchTooLarge { .. }) => EXIT_BATCH_TOO_LARGE,
        Decision::Blocked(_) => EXIT_BLOCKED,
        _ => 0,
    })
}

async fn consume(
    config: Config,
    identifier: &str,
    operation_type: &str,
    amount: u64,
    user: Option<String>,
) -> Result<i32> {
    let state = build_state(config).await?;
    match state
        .limiter
        .consume(identifier, operation_type, amount, user, None)
        .await
    {
        Ok(true) => {
            println!("admitted: {amount} unit(s) recorded for {identifier}");
            Ok(0)
        }
        Ok(false) => {
            println!("blocked (degraded): limit reached for {operation_type}");
            Ok(EXIT_BLOCKED)
        }
        Err(e @ RateLimitError::BatchTooLarge { .. }) => {
            println!("{e}");
            Ok(EXIT_BATCH_TOO_LARGE)
        }
        Err(e @ RateLimitError::Exceeded { .. }) => {
            println!("{e}");
            Ok(EXIT_BLOCKED)
        }
        Err(e) => Err(e).context("Admission check failed"),
    }
}

async fn status(config: Config, identifier: &str, operation_type: Option<&str>) -> Result<i32> {
    let state = build_state(config).await?;
    match operation_type {
        Some(operation_type) => {
            let status = state.limiter.status(identifier, operation_type).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        None => {
            let statuses = state.limiter.all_statuses(identifier).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }
    Ok(0)
}

async fn override_command(config: Config, action: OverrideCommands) -> Result<i32> {
    let state = build_state(config).await?;
    match action {
        OverrideCommands::Grant {
            identifier,
            operation_type,
            justification,
            hours,
            requested_by,
        } => {
            let expiry = state
                .admin
                .request_override(&OverrideRequest {
                    identifier,
                    operation_type,
                    justification,
                    duration_hours: hours,
                    requested_by,
                })
                .await?;
            println!("override active until {expiry}");
        }
        OverrideCommands::Revoke {
            identifier,
            operation_type,
            performed_by,
        } => {
            state
                .admin
                .revoke_override(&identifier, &operation_type, &performed_by)
                .await?;
            println!("override revoked for {identifier}:{operation_type}");
        }
        OverrideCommands::Emergency {
            operation_type,
            justification,
            hours,
            performed_by,
        } => {
            let outcome = state
                .admin
                .emergency_override(&operation_type, hours, &performed_by, &justification)
                .await?;
            println!(
                "emergency override applied to {}/{} tracked key(s)",
                outcome.applied, outcome.targets
            );
        }
    }
    Ok(0)
}

async fn reset(
    config: Config,
    operation_type: &str,
    identifier: Option<&str>,
    all: bool,
    performed_by: &str,
) -> Result<i32> {
    let state = build_state(config).await?;
    match (identifier, all) {
        (Some(identifier), false) => {
            let summary = state
                .admin
                .reset_usage(identifier, operation_type, performed_by)
                .await?;
            println!(
                "reset {identifier}:{operation_type} (was {} used, {} blocked)",
                summary.previous_usage, summary.previous_blocked
            );
        }
        (None, true) => {
            let outcome = state
                .admin
                .bulk_reset_usage(operation_type, performed_by)
                .await?;
            println!(
                "reset {}/{} tracked key(s) for {operation_type}",
                outcome.applied, outcome.targets
            );
        }
        _ => anyhow::bail!("pass an identifier or --all, but not both"),
    }
    Ok(0)
}

async fn report(config: Config, report_type: &str, operation_type: Option<&str>) -> Result<i32> {
    let report_type: ReportType = report_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let state = build_state(config).await?;
    let report = state
        .analytics
        .generate_usage_report(report_type, operation_type)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

async fn maintain(config: Config) -> Result<i32> {
    let backup_enabled = config.storage.backup_enabled;
    let state = build_state(config).await?;
    let maintenance = Maintenance::new(
        state.limiter.store(),
        state.limiter.config_handle(),
        Arc::clone(&state.admin),
        Arc::clone(&state.analytics),
    );

    maintenance.run_retention_cleanup().await;
    maintenance.run_analytics_cleanup().await;
    maintenance.run_override_sweep().await;
    if backup_enabled {
        maintenance.run_backup().await;
    }
    println!("maintenance pass complete");
    Ok(0)
}
