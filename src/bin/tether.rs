//! Command line entry point for the tether bot runtime.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether::config::{ConfigIssueSeverity, validate_config};
use tether::state::persist::{JsonFilePersistence, StatePersistence};
use tether::{BotConfig, BotRuntime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Tether: keeps bot runtime state durable, runs recurring jobs and accepts
/// trigger requests.
#[derive(Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot runtime until SIGINT or SIGTERM (default).
    Run {
        /// Read newline-delimited JSON bot events from stdin.
        #[arg(long)]
        stdin_events: bool,
    },

    /// Validate the configuration and exit.
    CheckConfig,

    /// Print the persisted state snapshot as JSON.
    DumpState,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _log_guard = tether::diagnostics::init_tracing(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Run {
            stdin_events: false,
        }) {
            Command::Run { stdin_events } => run(config, stdin_events).await,
            Command::CheckConfig => check_config(&config),
            Command::DumpState => dump_state(&config).await,
        }
    });
    // A blocking stdin read cannot be cancelled; do not wait for it.
    runtime.shutdown_background();
    result
}

/// Explicit path must exist; otherwise the default location is optional.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<BotConfig> {
    if let Some(path) = path {
        return BotConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default_path = BotConfig::default_config_path();
    if default_path.is_file() {
        BotConfig::from_file(&default_path)
            .with_context(|| format!("loading config from {}", default_path.display()))
    } else {
        Ok(BotConfig::default())
    }
}

async fn run(config: BotConfig, stdin_events: bool) -> anyhow::Result<()> {
    info!("tether v{} starting", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let shutdown = shutdown_signal()?;
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("shutdown signal received");
        token.cancel();
    });

    let mut runtime = BotRuntime::new(config);
    if stdin_events {
        runtime = runtime.with_event_source(tokio::io::BufReader::new(tokio::io::stdin()));
    }
    runtime.run(cancel).await?;

    info!("tether shut down cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Handlers are installed before returning.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("listening for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("listening for SIGTERM")?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()> + Send + 'static> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
}

fn check_config(config: &BotConfig) -> anyhow::Result<()> {
    let issues = validate_config(config);
    if issues.is_empty() {
        println!("configuration OK");
        return Ok(());
    }
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues
        .iter()
        .filter(|issue| issue.severity == ConfigIssueSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("{errors} configuration error(s)");
    }
    Ok(())
}

async fn dump_state(config: &BotConfig) -> anyhow::Result<()> {
    let persistence = JsonFilePersistence::new(config.state.path.clone());
    let Some(snapshot) = persistence.load().await? else {
        anyhow::bail!("no saved state at {}", config.state.path.display());
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
