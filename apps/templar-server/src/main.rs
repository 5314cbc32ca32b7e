use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use runtime::{AppConfig, CliArgs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use osb_broker::api;
use osb_broker::config::BrokerConfig;
use osb_broker::platform::MemoryPlatform;
use osb_broker::{Broker, BrokerSettings};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Templar - template-driven Open Service Broker
#[derive(Parser)]
#[command(name = "templar-server")]
#[command(about = "Templar - template-driven Open Service Broker")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the application configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the broker document (overrides config)
    #[arg(short, long)]
    broker_config: Option<PathBuf>,

    /// Port for the HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use the in-memory platform instead of a real backend
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Run,
    /// Check the application and broker configuration
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        broker_config: cli
            .broker_config
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
        mock: cli.mock,
    };

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    runtime::logging::init_logging_from_config(&logging_config, Path::new("."));
    tracing::info!("Templar broker starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config, args).await,
        Commands::Check => check_config(config),
    }
}

fn load_broker_document(path: &str) -> Result<BrokerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read broker document {path}"))?;
    BrokerConfig::from_yaml(&raw).map_err(|e| anyhow!("broker document {path} is invalid: {e}"))
}

async fn run_server(config: AppConfig, args: CliArgs) -> Result<()> {
    let settings = BrokerSettings {
        default_namespace: config.broker.default_namespace.clone(),
        token: config.broker.token.clone(),
        strict_polling: config.broker.strict_polling,
    };

    // The real platform wiring (a Kubernetes client) is injected here in
    // production deployments; the in-memory platform serves --mock runs and
    // keeps the broker operable without a backend.
    if args.mock {
        tracing::info!("using the in-memory platform (--mock)");
    } else {
        tracing::warn!("no platform backend configured, using the in-memory platform");
    }
    let broker = Arc::new(Broker::new(settings, Arc::new(MemoryPlatform::new())));

    // Load the broker document before accepting traffic; a broken document
    // leaves /readyz at 503 rather than aborting startup.
    let config_file = config.broker.config_file.clone();
    match load_broker_document(&config_file) {
        Ok(document) => match broker.config.replace(document) {
            Ok(()) => tracing::info!(file = %config_file, "broker document loaded"),
            Err(error) => tracing::error!(%error, file = %config_file, "broker document rejected"),
        },
        Err(error) => tracing::error!(%error, file = %config_file, "broker document unreadable"),
    }

    spawn_reload_handler(Arc::clone(&broker), config_file);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, api::router(broker))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

/// SIGHUP re-reads the broker document and swaps it in atomically; a failed
/// validation keeps the old document active.
fn spawn_reload_handler(broker: Arc<Broker>, config_file: String) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match load_broker_document(&config_file) {
                Ok(document) => match broker.config.replace(document) {
                    Ok(()) => tracing::info!(file = %config_file, "broker document reloaded"),
                    Err(error) => {
                        tracing::error!(%error, file = %config_file, "reload rejected, keeping the active document")
                    }
                },
                Err(error) => {
                    tracing::error!(%error, file = %config_file, "reload failed, keeping the active document")
                }
            }
        }
    });
    #[cfg(not(unix))]
    let _ = (broker, config_file);
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");

    let document = load_broker_document(&config.broker.config_file)?;
    osb_broker::config::validate(&document).map_err(|e| anyhow!("broker document invalid: {e}"))?;

    println!("Configuration check passed");
    println!("{}", config.to_yaml()?);
    Ok(())
}
