use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use herald_common::config::HeraldConfig;
use herald_protocol_pg::dispatch::{NotifyDispatcher, INPUT_CHANNEL_CAPACITY};
use herald_protocol_pg::listen::Listener;
use herald_protocol_pg::liveness::ConnectionGate;
use herald_protocol_pg::server::ProxyServer;
use herald_protocol_pg::upstream::UpstreamDriver;

#[derive(Parser, Debug)]
#[command(name = "herald", about = "PostgreSQL LISTEN/NOTIFY fan-out proxy")]
struct Cli {
    /// Path to the JSON configuration file.
    configfile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    herald_observability::init_tracing();
    let cli = Cli::parse();

    let config = HeraldConfig::load(&cli.configfile)
        .context("error while reading configuration file")?;
    tracing::info!("loaded configuration from {}", cli.configfile.display());
    let config = Arc::new(config);

    // Bind before anything else so a bad listen config fails fast.
    let listener = Listener::bind(&config.listen)
        .await
        .context("could not open listen socket")?;

    if let Some(prometheus) = &config.prometheus {
        let addr = prometheus.listen.address();
        herald_observability::init_metrics(&addr)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Prometheus exporter setup failed")?;
    }

    let gate = Arc::new(ConnectionGate::new());
    let (dispatcher, command_rx) = NotifyDispatcher::new();
    let (notification_tx, notification_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    dispatcher.spawn_fanout(notification_rx);

    let driver = UpstreamDriver::new(
        &config.connect,
        gate.clone(),
        dispatcher.clone(),
        command_rx,
        notification_tx,
    );
    tokio::spawn(driver.run());

    let server = ProxyServer::new(config, dispatcher, gate);
    server.run(listener).await.context("accept loop failed")?;
    Ok(())
}
