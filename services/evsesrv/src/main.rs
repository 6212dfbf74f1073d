//! EVSE gateway service (`evsesrv`)
//!
//! Bridges a Modbus RTU charge controller on a serial line to a JSON-RPC API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evse_modbus::{ChargerSession, RegisterCatalog, SerialConnector, SessionEvent};
use evsesrv::config::DEFAULT_CONFIG_PATH;
use evsesrv::{create_routes, AppState, ChargerController, ServiceConfig};

/// Command-line arguments for evsesrv
#[derive(Parser, Clone)]
#[command(
    name = "evsesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "EVSE Modbus RTU gateway",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overrides `serial.port`
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// Bind address for the API server, overrides `api.bind`
    #[arg(short = 'b', long)]
    bind_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(bind) = &self.bind_address {
            config.api.bind = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// Log session lifecycle events until shutdown
fn spawn_event_logger(session: &ChargerSession, token: CancellationToken) {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SessionEvent::Connected) => info!("Charger link up"),
                    Ok(SessionEvent::Disconnected) => info!("Charger link closed"),
                    Ok(SessionEvent::ConnectionLost { reason }) => {
                        warn!("Charger link lost: {}", reason)
                    },
                    Ok(SessionEvent::Error { message }) => warn!("Charger error: {}", message),
                    Err(RecvError::Lagged(n)) => warn!("Event logger lagged {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServiceConfig::load(Some(&args.config))?;
    args.apply(&mut config);

    let _log_guard = common::logging::init_logging(&config.logging)?;
    common::config::report_source(Some(&args.config));
    config.validate()?;

    if args.validate {
        info!("Configuration valid");
        return Ok(());
    }

    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;

    let catalog = Arc::new(RegisterCatalog::standard()?);
    info!("Register catalog: {} registers", catalog.len());

    let connector = Arc::new(SerialConnector::new(config.serial.clone())?);
    let session = ChargerSession::new(catalog, connector, config.session_config());

    let shutdown_token = common::shutdown::shutdown_token();
    spawn_event_logger(&session, shutdown_token.clone());

    if config.keep_alive.enabled {
        session.start_keep_alive();
    }
    if let Err(e) = session.connect().await {
        // A reconnect is already scheduled; serve the API meanwhile
        error!("Initial connect to {} failed: {}", config.serial.port, e);
    }

    let controller = Arc::new(ChargerController::new(session.clone()));
    let app = create_routes(AppState::new(controller));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API server listening on http://{}", addr);
    info!("JSON-RPC endpoint: http://{}/rpc", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_token.clone().cancelled_owned())
        .await
        .context("API server error")?;

    info!("Shutting down");
    session.disconnect().await;
    Ok(())
}
