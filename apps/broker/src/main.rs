mod jail;
mod pool;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use docbridge_protocol::{wellknown, Tokens};

use crate::pool::{PoolConfig, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "docbridge-broker")]
#[command(about = "Supervisor for the pool of jailed document workers")]
struct Args {
    /// Directory the jails are built under
    #[arg(long = "childroot", default_value = "/var/cache/docbridge/jails")]
    child_root: PathBuf,

    /// Engine install subpath inside each jail
    #[arg(long = "losubpath", default_value = "lo")]
    lo_subpath: String,

    /// System template copied into each jail
    #[arg(long = "systemplate")]
    systemplate: Option<PathBuf>,

    /// Engine install mirrored into each jail
    #[arg(long = "lotemplate")]
    lotemplate: Option<PathBuf>,

    /// Number of workers kept warm
    #[arg(long = "numprespawn", default_value_t = 1)]
    num_prespawn: usize,

    /// Gateway internal loopback port workers dial back on
    #[arg(long = "clientport", default_value_t = 9982)]
    client_port: u16,

    /// Request FIFO the gateway writes to
    #[arg(long = "requestpipe", default_value = wellknown::BROKER_REQUEST_FIFO)]
    request_pipe: PathBuf,

    /// Worker binary; defaults to docbridge-worker next to this binary
    #[arg(long = "workerbin")]
    worker_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    if let Err(err) = run(Args::parse()).await {
        error!("broker failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.child_root).context("creating child root")?;

    let reply_fifo = args.child_root.join(
        std::path::Path::new(wellknown::BROKER_REPLY_FIFO)
            .file_name()
            .context("reply fifo name")?,
    );
    ensure_fifo(&reply_fifo)?;
    ensure_fifo(&args.request_pipe)?;

    let worker_bin = match &args.worker_bin {
        Some(path) => path.clone(),
        None => sibling_binary("docbridge-worker")?,
    };

    let mut pool = WorkerPool::new(PoolConfig {
        child_root: args.child_root.clone(),
        lo_subpath: args.lo_subpath.clone(),
        systemplate: args.systemplate.clone(),
        lotemplate: args.lotemplate.clone(),
        client_port: args.client_port,
        worker_bin,
        reply_fifo: reply_fifo.clone(),
        num_prespawn: args.num_prespawn,
    });

    // Hold our own write ends so reads never see EOF while peers
    // restart.
    let request_receiver = pipe::OpenOptions::new()
        .open_receiver(&args.request_pipe)
        .with_context(|| format!("opening request fifo {}", args.request_pipe.display()))?;
    let _request_keepalive = pipe::OpenOptions::new()
        .open_sender(&args.request_pipe)
        .context("request fifo keepalive")?;
    let reply_receiver = pipe::OpenOptions::new()
        .open_receiver(&reply_fifo)
        .with_context(|| format!("opening reply fifo {}", reply_fifo.display()))?;
    let _reply_keepalive = pipe::OpenOptions::new()
        .open_sender(&reply_fifo)
        .context("reply fifo keepalive")?;

    let mut requests = line_stream(request_receiver);
    let mut replies = reply_stream(reply_receiver);

    pool.prespawn().await.context("prespawning workers")?;
    info!(
        workers = pool.len(),
        pipe = %args.request_pipe.display(),
        "broker is ready"
    );

    let mut sigchld = signal(SignalKind::child()).context("installing SIGCHLD handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping pool");
                break;
            }
            _ = sigchld.recv() => {
                let dead = pool.harvest();
                if !dead.is_empty() {
                    info!(?dead, "harvested workers");
                    pool.respawn_to_minimum().await;
                }
            }
            line = requests.recv() => {
                let Some(line) = line else { break };
                handle_request(&line, &mut pool, &mut replies).await;
            }
            reply = replies.recv() => {
                let Some((pid, rest)) = reply else { break };
                pool.note_reply(pid, &rest);
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}

/// One `request <session-id> <url>` line from the gateway.
async fn handle_request(
    line: &str,
    pool: &mut WorkerPool,
    replies: &mut mpsc::UnboundedReceiver<(u32, String)>,
) {
    let tokens = Tokens::parse(line);
    if tokens.name() != "request" || tokens.count() != 3 {
        warn!(line, "malformed gateway request");
        return;
    }
    let session_id = tokens.get(1).unwrap_or_default();
    let url = tokens.get(2).unwrap_or_default();
    debug!(session = session_id, url, "routing session");
    if let Err(err) = pool.route(session_id, url, replies).await {
        error!(session = session_id, url, "routing failed: {:#}", err);
    }
}

fn ensure_fifo(path: &std::path::Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("creating fifo {}", path.display())),
    }
}

fn sibling_binary(name: &str) -> Result<PathBuf> {
    let current = std::env::current_exe().context("locating broker binary")?;
    Ok(current
        .parent()
        .context("broker binary has no parent directory")?
        .join(name))
}

/// Turns a pipe into a stream of CRLF-trimmed lines.
fn line_stream(receiver: pipe::Receiver) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(receiver);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if !line.is_empty() && tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Same, but splits the worker pid prefix off every reply line.
fn reply_stream(receiver: pipe::Receiver) -> mpsc::UnboundedReceiver<(u32, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut lines = line_stream(receiver);
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            match line.split_once(' ') {
                Some((pid, rest)) => match pid.parse::<u32>() {
                    Ok(pid) => {
                        if tx.send((pid, rest.trim().to_string())).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!(line = %line, "reply without pid prefix"),
                },
                None => warn!(line = %line, "short reply line"),
            }
        }
    });
    rx
}
