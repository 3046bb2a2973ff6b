// Thrill Linux host: LAN discovery, encrypted links and a console around the engine.

mod actor;
mod config;
mod console;
mod discovery;
mod ranging;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thrill_core::ThrillEngine;
use tokio::sync::{mpsc, watch};

use crate::config::RangingBackend;
use crate::discovery::DiscoveryControl;
use crate::ranging::ManualRanging;
use crate::transport::LinkTransport;

#[derive(Parser, Debug)]
#[command(name = "thrill-linux", version, about = "Send thrills to people standing nearby")]
struct Cli {
    /// Config file (default: ~/.config/thrill/config.toml, then /etc/thrill/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name, overriding config and THRILL_NAME
    #[arg(short, long)]
    name: Option<String>,

    /// Start scanning right away
    #[arg(long)]
    start: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref(), cli.name)?;
    tracing::info!("Running as '{}' on service '{}'", cfg.display_name, cfg.service_id);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg, cli.start));
    // The console's stdin read never finishes on its own.
    rt.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn run(cfg: config::Config, start: bool) -> anyhow::Result<()> {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (dial_tx, dial_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = watch::channel(DiscoveryControl::default());
    let (snapshot_tx, snapshot_rx) = watch::channel(actor::Snapshot::default());
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    let transport = LinkTransport::new(cfg.display_name.clone(), control_tx, dial_tx);
    let ranging = match cfg.ranging {
        RangingBackend::Manual => ManualRanging::new(),
        RangingBackend::None => ManualRanging::unsupported(),
    };
    let engine = ThrillEngine::new(cfg.engine_config(), transport, ranging);

    let name = cfg.display_name.clone();
    let disc_inputs = input_tx.clone();
    let (discovery_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    tokio::spawn(async move {
        if let Err(e) =
            discovery::run_discovery(name, discovery_port, transport_port, control_rx, disc_inputs).await
        {
            tracing::error!("Discovery stopped: {}", e);
        }
    });
    let name = cfg.display_name.clone();
    let link_inputs = input_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::run_links(name, transport_port, dial_rx, link_inputs).await {
            tracing::error!("Transport stopped: {}", e);
        }
    });
    tokio::spawn(console::print_output(output_rx));

    if start {
        let _ = input_tx.send(actor::Input::Command(console::Command::Start));
    }
    tokio::spawn(console::run_console(input_tx, snapshot_rx));

    tokio::select! {
        _ = actor::run(engine, input_rx, snapshot_tx, output_tx) => {}
        res = shutdown_signal() => {
            res?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
