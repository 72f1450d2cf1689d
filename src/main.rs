//! KBI Host - Rust implementation
//!
//! Host-side driver for the Synclavier KBI-1 keyboard interface: detects the
//! interface, identifies it, tracks the ORK/VK keyboard behind it and drives
//! its displays and button lights.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kbi_host::config::AppConfig;
use kbi_host::runtime::SessionRunner;
use kbi_host::transport::MidiTransport;
use kbi_host::{cli, sniffer};

/// KBI Host - talk to a Synclavier KBI-1 over MIDI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "kbi.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Port name pattern, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    /// Run in sniffer mode
    #[arg(long)]
    sniffer: bool,

    /// Open the interactive console
    #[arg(long)]
    repl: bool,

    /// Show the display counter and light chase while a keyboard is connected
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Starting KBI Host v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = AppConfig::load_or_default(&args.config).await?;
    if let Some(port) = args.port {
        config.midi.port_name = port;
    }
    if args.demo {
        config.demo.enabled = true;
    }

    if args.list_ports {
        sniffer::list_ports_formatted(&config.midi.port_name);
        return Ok(());
    }

    if args.sniffer {
        sniffer::run_cli_sniffer(&config.midi.port_name, config.session.framing).await?;
        return Ok(());
    }

    run_app(config, args.repl).await?;

    info!("KBI Host shutdown complete");
    Ok(())
}

async fn run_app(config: AppConfig, repl: bool) -> Result<()> {
    info!(
        port = %config.midi.port_name,
        framing = ?config.session.framing,
        demo = config.demo.enabled,
        "Starting session"
    );

    let transport = MidiTransport::new(
        config.midi.port_name.clone(),
        config.midi.client_name.clone(),
        config.session.framing,
    );
    let (runner, handle) = SessionRunner::new(transport, &config.session, config.demo.enabled);
    let session = tokio::spawn(runner.run(shutdown_signal()));

    if repl {
        cli::run_repl(handle.clone()).await?;
    }

    // The handle lives until here; dropping it would stop the runner
    session.await?;
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
