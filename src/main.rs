use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use snmp_rate_exporter::agent::Agent;
use snmp_rate_exporter::config::{ExporterConfig, DEFAULT_TARGETS_PATH};
use snmp_rate_exporter::export::health::DEFAULT_LISTEN_ADDR;

/// Exposes per-second rates of SNMP counters as Prometheus gauges.
#[derive(Parser)]
#[command(name = "snmp-rate-exporter", about)]
struct Cli {
    /// Path to the YAML targets document. Reloaded when it changes.
    #[arg(short, long, default_value = DEFAULT_TARGETS_PATH)]
    config: PathBuf,

    /// Listen address of the metrics endpoint (":port" listens on all interfaces).
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Timeout of a single SNMP request (e.g. "5s", "1500ms").
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    snmp_timeout: Duration,

    /// Window in which targets file events are folded into one reload.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    reload_debounce: Duration,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, or "unknown" outside a checkout.
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            targets_path: self.config.clone(),
            listen_addr: self.listen.clone(),
            snmp_timeout: self.snmp_timeout,
            reload_debounce: self.reload_debounce,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("snmp-rate-exporter {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = cli.exporter_config();
    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        config = %cfg.targets_path.display(),
        listen = %cfg.listen_addr,
        "starting snmp-rate-exporter",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: ExporterConfig) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    wait_for_shutdown().await?;

    agent.stop().await?;

    tracing::info!("snmp-rate-exporter stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("received ctrl-c, shutting down");
    Ok(())
}
