use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::{Limiter, PolicyRegistry};

/// Inspect and exercise action rate limits.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count attempts of an action and print each decision
    Check {
        action: String,
        identifier: String,
        /// Number of attempts to make
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Print how long until an action would be admitted
    Wait { action: String, identifier: String },
    /// Drop every window held for an identifier
    Reset { identifier: String },
    /// Print the effective policy table
    Policies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    debug!(version = env!("CARGO_PKG_VERSION"), "Starting Floodgate");

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    let limiter = Limiter::from_config(&config, PolicyRegistry::builder().defaults()).await?;
    info!(backend = limiter.backend_name(), "Configuration loaded");

    let output = match &cli.command {
        Command::Check {
            action,
            identifier,
            times,
        } => {
            let mut decisions = Vec::with_capacity(*times as usize);
            for _ in 0..*times {
                decisions.push(limiter.check_limit(action, identifier).await?);
            }
            json!({
                "backend": limiter.backend_name(),
                "decisions": decisions,
                "metrics": limiter.metrics_snapshot(),
            })
        }
        Command::Wait { action, identifier } => {
            let wait = limiter.time_until_allowed(action, identifier).await?;
            json!({
                "action": action,
                "identifier": identifier,
                "wait_ms": wait.as_millis() as u64,
            })
        }
        Command::Reset { identifier } => {
            let reset = limiter.reset_limits(identifier).await?;
            json!({ "identifier": identifier, "reset": reset })
        }
        Command::Policies => {
            let policies = limiter.policies();
            let table: BTreeMap<&str, _> = policies
                .actions()
                .into_iter()
                .filter_map(|action| policies.get(action).map(|p| (action, p.to_config())))
                .collect();
            serde_json::to_value(table)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    limiter.shutdown().await;
    Ok(())
}

/// Logs go to stderr so stdout carries only JSON.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
