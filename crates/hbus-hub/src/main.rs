//! hbus-hub: router bus hub daemon.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use hbus_hub::bridge::NotificationBridge;
use hbus_hub::{
    BusMode, ConfigError, ExchangeError, HubConfig, MirrorStore, ModeController, ModeError,
    RouterProbe, SerialBus, EVENT_QUEUE_LEN,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hbus-hub", version, about = "Router bus hub")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device or tcp://host:port bridge
    #[arg(long)]
    endpoint: Option<String>,

    /// Line speed of a serial device
    #[arg(long)]
    baud: Option<u32>,

    /// Router id
    #[arg(long)]
    router: Option<u8>,

    /// Backend websocket URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Client address known at startup
    #[arg(long)]
    client: Option<IpAddr>,

    /// Operate without a client and buffer events
    #[arg(long)]
    test_mode: bool,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open bus {endpoint}: {source}")]
    Bus {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[cfg(feature = "prometheus")]
    #[error("failed to start metrics exporter: {0}")]
    Metrics(String),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("hbus-hub: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<HubConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };
    if let Some(endpoint) = &cli.endpoint {
        config.bus.endpoint = endpoint.clone();
    }
    if let Some(baud) = cli.baud {
        config.bus.baud = baud;
    }
    if let Some(router) = cli.router {
        config.bus.router = router;
    }
    if let Some(url) = &cli.backend_url {
        config.backend.url = Some(url.clone());
    }
    if let Some(client) = cli.client {
        config.hub.client = Some(client);
    }
    config.hub.test_mode |= cli.test_mode;
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = load_config(&cli)?;

    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.hub.metrics_addr {
        hbus_metrics::install_prometheus(addr).map_err(|e| StartupError::Metrics(e.to_string()))?;
        info!("hbus-hub: metrics on http://{}/metrics", addr);
    }

    let bus = SerialBus::open(&config.bus.endpoint, config.bus.baud)
        .await
        .map_err(|source| StartupError::Bus {
            endpoint: config.bus.endpoint.clone(),
            source,
        })?;
    info!("hbus-hub: bus open on {}", config.bus.endpoint);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
    let ctl = ModeController::new(bus, config.mode_config(), MirrorStore::new(), events_tx);

    match ctl.exchange().probe_router().await? {
        RouterProbe::Available => info!("hbus-hub: router {} available", config.bus.router),
        RouterProbe::Unreachable => warn!("hbus-hub: router {} not answering", config.bus.router),
    }
    if !ctl.set_initial_server_mode().await? {
        warn!("hbus-hub: continuing without server mode acknowledgement");
    }
    let monitor = ctl.spawn_fault_monitor();

    if let Some(client) = config.startup_client() {
        info!("hbus-hub: client {} known at startup", client);
        ctl.set_client(client);
    }
    let bridge = NotificationBridge::new(
        config.bridge_config(),
        config.token_source(),
        ctl.client_watch(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge_task = tokio::spawn(bridge.run(events_rx, shutdown_rx));
    let operate_task = tokio::spawn(operate_when_client_known(ctl.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("hbus-hub: failed to listen for shutdown signal: {}", e);
    }
    info!("hbus-hub: shutting down");

    operate_task.abort();
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    if let Err(e) = ctl.enter_server().await {
        warn!("hbus-hub: router left in {} mode: {}", ctl.mode(), e);
    }
    shutdown_tx.send_replace(true);
    let _ = bridge_task.await;
    Ok(())
}

/// Enter operate mode once a client address is known, and again whenever
/// it changes while the bus sits in server mode.
async fn operate_when_client_known(ctl: ModeController) {
    let mut client = ctl.client_watch();
    loop {
        let ready = ctl.test_mode() || client.borrow_and_update().is_some();
        if ready && ctl.mode() == BusMode::Server {
            if let Err(e) = ctl.enter_operate().await {
                warn!("hbus-hub: operate mode not entered: {}", e);
            }
        }
        if client.changed().await.is_err() {
            return;
        }
    }
}
