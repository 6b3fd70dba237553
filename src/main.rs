// sshwatch CLI - run the monitor or validate its configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sshwatch::inventory::{Inventory, MonitorSettings};
use sshwatch::monitor::Fleet;
use sshwatch::output::http;

#[derive(Parser)]
#[command(
    name = "sshwatch",
    about = "Agent-less health checks over SSH",
    version,
    disable_colored_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Hosts inventory
    #[arg(long, global = true, default_value = "conf/hosts.yml")]
    hosts: PathBuf,

    /// Check definitions
    #[arg(long, global = true, default_value = "conf/checks.yml")]
    checks: PathBuf,

    /// Handler definitions
    #[arg(long, global = true, default_value = "conf/handlers.yml")]
    handlers: PathBuf,

    /// Address the status API listens on
    #[arg(long, global = true, default_value = "0.0.0.0:8080")]
    listen: String,

    /// SSH connect timeout (e.g. 30s, 1m)
    #[arg(long, global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring (the default)
    Run,

    /// Load and validate the configuration, then exit
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let result = match &cli.command {
        Some(Commands::Validate) => validate(&cli),
        Some(Commands::Run) | None => run(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn load(cli: &Cli) -> Result<Inventory> {
    Inventory::load(&cli.hosts, &cli.checks, &cli.handlers)
        .with_context(|| format!("Failed to load configuration from {}", cli.hosts.display()))
}

fn validate(cli: &Cli) -> Result<()> {
    let inventory = load(cli)?;

    println!("{}", "Configuration is valid".green().bold());
    println!("  Hosts:    {}", inventory.hosts.hosts.len());
    println!("  Checks:   {}", inventory.checks.checks.len());
    println!("  Handlers: {}", inventory.handlers.handlers.len());

    for host in &inventory.hosts.hosts {
        let checks: Vec<String> = inventory
            .checks_for(host)
            .into_iter()
            .map(|c| c.name)
            .collect();
        println!(
            "  {} {} [{}]",
            host.name.cyan(),
            host.target().dimmed(),
            if checks.is_empty() {
                "keepalive only".to_string()
            } else {
                checks.join(", ")
            }
        );
    }

    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let inventory = load(cli)?;
    let settings = MonitorSettings {
        listen: cli.listen.clone(),
        connect_timeout: cli.connect_timeout,
        ..MonitorSettings::default()
    };

    let listener = http::bind(&settings.listen).await?;
    let fleet = Arc::new(Fleet::new(inventory, settings));

    // Serve while hosts dial; /status stays empty until the fleet has started
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(http::serve(listener, fleet.clone(), shutdown.clone()));

    let summary = fleet.start().await;
    if summary.started == 0 && summary.failed > 0 {
        warn!("No host started; serving status only");
    }

    wait_for_signal().await?;
    info!("Shutdown signal received");

    fleet.stop().await;
    shutdown.cancel();
    server.await.context("Status API task failed")??;

    info!("Stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
