use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use tokio::process::Command;
use tracing::{error, info};

use docbridge_gateway::broker::PipeBroker;
use docbridge_gateway::config::RuntimeConfig;
use docbridge_gateway::state::GatewayState;
use docbridge_gateway::ws::{client_ws_handler, worker_ws_handler};
use docbridge_protocol::wellknown;

#[derive(Parser, Debug)]
#[command(name = "docbridge-gateway")]
#[command(about = "Collaborative document-editing gateway")]
struct Args {
    /// Public WebSocket port
    #[arg(long = "port", default_value_t = 9980)]
    public_port: u16,

    /// Loopback port workers dial back on
    #[arg(long = "internalport", default_value_t = 9982)]
    internal_port: u16,

    /// Directory the jails are built under
    #[arg(long = "childroot", default_value = "/var/cache/docbridge/jails")]
    child_root: PathBuf,

    /// Root of the per-document tile caches
    #[arg(long = "cacheroot", default_value = "/var/cache/docbridge/tiles")]
    cache_root: PathBuf,

    /// Engine install subpath inside each jail
    #[arg(long = "losubpath", default_value = "lo")]
    lo_subpath: String,

    /// System template copied into each jail
    #[arg(long = "systemplate")]
    systemplate: Option<PathBuf>,

    /// Engine install mirrored into each jail
    #[arg(long = "lotemplate")]
    lotemplate: Option<PathBuf>,

    /// Workers kept warm by the broker
    #[arg(long = "numprespawn", default_value_t = 1)]
    num_prespawn: usize,

    /// Request FIFO shared with the broker
    #[arg(long = "requestpipe", default_value = wellknown::BROKER_REQUEST_FIFO)]
    request_pipe: PathBuf,

    /// Broker binary; defaults to docbridge-broker next to this binary
    #[arg(long = "brokerbin")]
    broker_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    if let Err(err) = run(Args::parse()).await {
        error!("gateway failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.cache_root).context("creating cache root")?;
    std::fs::create_dir_all(&args.child_root).context("creating child root")?;

    let mut broker_process = spawn_broker(&args)?;
    tokio::spawn(async move {
        match broker_process.wait().await {
            Ok(status) => error!(%status, "broker exited"),
            Err(err) => error!("broker wait failed: {}", err),
        }
    });

    let broker = Arc::new(
        PipeBroker::open(&args.request_pipe)
            .await
            .context("connecting to broker request pipe")?,
    );

    let config = RuntimeConfig {
        public_port: args.public_port,
        internal_port: args.internal_port,
        child_root: args.child_root.clone(),
        cache_root: args.cache_root.clone(),
    };
    let state = GatewayState::new(config, broker);

    let public_app = Router::new()
        .route(wellknown::CLIENT_WS_PATH, get(client_ws_handler))
        .with_state(state.clone());
    let internal_app = Router::new()
        .route("/loolws/child/:session_id", get(worker_ws_handler))
        .with_state(state.clone());

    let public_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", args.public_port))
            .await
            .with_context(|| format!("binding public port {}", args.public_port))?;
    let internal_listener =
        tokio::net::TcpListener::bind(("127.0.0.1", args.internal_port))
            .await
            .with_context(|| format!("binding internal port {}", args.internal_port))?;

    info!(
        public = args.public_port,
        internal = args.internal_port,
        "gateway is listening"
    );

    tokio::spawn(async move {
        if let Err(err) = axum::serve(internal_listener, internal_app).await {
            error!("internal listener failed: {}", err);
        }
    });

    axum::serve(public_listener, public_app)
        .await
        .context("serving public listener")?;
    Ok(())
}

/// The broker is our child; it builds the jails and forks the workers.
fn spawn_broker(args: &Args) -> Result<tokio::process::Child> {
    let broker_bin = match &args.broker_bin {
        Some(path) => path.clone(),
        None => {
            let current = std::env::current_exe().context("locating gateway binary")?;
            current
                .parent()
                .context("gateway binary has no parent directory")?
                .join("docbridge-broker")
        }
    };

    let mut command = Command::new(&broker_bin);
    command
        .arg(format!("--childroot={}", args.child_root.display()))
        .arg(format!("--losubpath={}", args.lo_subpath))
        .arg(format!("--numprespawn={}", args.num_prespawn))
        .arg(format!("--clientport={}", args.internal_port))
        .arg(format!("--requestpipe={}", args.request_pipe.display()));
    if let Some(template) = &args.systemplate {
        command.arg(format!("--systemplate={}", template.display()));
    }
    if let Some(template) = &args.lotemplate {
        command.arg(format!("--lotemplate={}", template.display()));
    }
    command
        .spawn()
        .with_context(|| format!("spawning broker {}", broker_bin.display()))
}
