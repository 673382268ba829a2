use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

use docbridge_engine::Engine;
use docbridge_protocol::{wellknown, Tokens};
use docbridge_worker::document::Document;
use docbridge_worker::{jail, EXIT_SOFTWARE};

#[derive(Parser, Debug)]
#[command(name = "docbridge-worker")]
#[command(about = "Jailed worker host for one document")]
struct Args {
    /// Engine install subpath inside the jail
    #[arg(long = "losubpath")]
    lo_subpath: String,

    /// Jail identifier assigned by the broker
    #[arg(long = "jailid")]
    jail_id: String,

    /// Inbound request pipe, as seen from inside the jail
    #[arg(long = "pipe")]
    pipe: PathBuf,

    /// Gateway internal loopback port for session dial-back
    #[arg(long = "clientport", default_value_t = 9982)]
    client_port: u16,
}

fn main() {
    if let Ok(value) = std::env::var("SLEEPFORDEBUGGER") {
        if let Ok(seconds) = value.parse::<u64>() {
            eprintln!(
                "Sleeping {} seconds to attach debugger to process {}",
                seconds,
                std::process::id()
            );
            std::thread::sleep(Duration::from_secs(seconds));
        }
    }

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    jail::set_process_name("docbridge_kit");
    if std::env::var("LOOL_DEBUG").as_deref() == Ok("1") {
        jail::install_debug_traps();
    }

    let jailed = match jail::enter_jail() {
        Ok(jailed) => jailed,
        Err(err) => {
            error!("jail entry failed: {:#}", err);
            std::process::exit(EXIT_SOFTWARE);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("runtime start failed: {}", err);
            std::process::exit(EXIT_SOFTWARE);
        }
    };
    if let Err(err) = runtime.block_on(run(args, jailed)) {
        error!("worker failed: {:#}", err);
        std::process::exit(EXIT_SOFTWARE);
    }
    info!("worker finished");
}

/// Resolves a jail-absolute path: verbatim when chrooted, relative to
/// the jail working directory otherwise.
fn jail_path(path: &Path, jailed: bool) -> PathBuf {
    if jailed {
        path.to_path_buf()
    } else {
        path.strip_prefix("/").map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
    }
}

async fn run(args: Args, jailed: bool) -> Result<()> {
    let multi_view = std::env::var("LOK_VIEW_CALLBACK").is_ok();
    if !multi_view {
        debug!("LOK_VIEW_CALLBACK is not set, single-view mode");
    }

    let install = jail_path(&Path::new("/").join(&args.lo_subpath).join("program"), jailed);
    let engine =
        docbridge_engine::init(&install, "file:///user").context("engine initialisation")?;

    let request_pipe = jail_path(&args.pipe, jailed);
    let receiver = pipe::OpenOptions::new()
        .open_receiver(&request_pipe)
        .with_context(|| format!("opening request pipe {}", request_pipe.display()))?;
    let mut sender = open_reply_fifo(jailed).await?;

    info!(pid = std::process::id(), jail = %args.jail_id, "worker is ready");
    // advertise ourselves as idle
    sender
        .write_all(format!("{} empty\r\n", std::process::id()).as_bytes())
        .await
        .context("advertising on broker fifo")?;

    let mut documents: HashMap<String, Arc<Document>> = HashMap::new();
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut reader = BufReader::new(receiver);
    let mut line_buffer = Vec::new();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            read = reader.read_until(b'\n', &mut line_buffer) => {
                let n = read.context("reading request pipe")?;
                if n == 0 {
                    info!("request pipe closed by broker, exiting");
                    break;
                }
                let line = String::from_utf8_lossy(&line_buffer)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                line_buffer.clear();
                if line.is_empty() {
                    continue;
                }
                let reply = handle_broker_line(&line, &mut documents, &engine, &args, multi_view).await;
                debug!(recv = %line, send = %reply, "broker exchange");
                sender
                    .write_all(format!("{}\r\n", reply).as_bytes())
                    .await
                    .context("writing broker fifo")?;
            }
        }
    }

    for document in documents.values() {
        document.shutdown(false);
    }
    Ok(())
}

/// One CRLF-terminated broker request. Replies are prefixed with our pid
/// since the reply FIFO is shared by the whole pool.
async fn handle_broker_line(
    line: &str,
    documents: &mut HashMap<String, Arc<Document>>,
    engine: &Arc<dyn Engine>,
    args: &Args,
    multi_view: bool,
) -> String {
    let pid = std::process::id();
    let tokens = Tokens::parse(line);
    match tokens.name() {
        "query" if tokens.get(1) == Some("url") => {
            // drop documents nobody needs any more before answering
            let discardable: Vec<String> = documents
                .iter()
                .filter(|(_, document)| document.can_discard())
                .map(|(url, _)| url.clone())
                .collect();
            for url in discardable {
                if let Some(document) = documents.remove(&url) {
                    info!(url = %url, "discarding idle document");
                    document.shutdown(false);
                }
            }
            match documents.keys().next() {
                None => format!("{} empty", pid),
                Some(url) => format!("{} {}", pid, url),
            }
        }
        "thread" if tokens.count() == 3 => {
            let session_id = tokens.get(1).unwrap_or_default().to_string();
            let url = tokens.get(2).unwrap_or_default().to_string();
            let document = documents.entry(url.clone()).or_insert_with(|| {
                Document::new(engine.clone(), args.jail_id.clone(), url, multi_view)
            });
            match document.create_session(&session_id, args.client_port).await {
                Ok(()) => format!("{} ok", pid),
                Err(err) => {
                    error!(session = %session_id, "session creation failed: {:#}", err);
                    format!("{} bad", pid)
                }
            }
        }
        _ => format!("{} bad", pid),
    }
}

/// The write end of a FIFO cannot open before the broker holds the read
/// end; retry briefly during startup races.
async fn open_reply_fifo(jailed: bool) -> Result<pipe::Sender> {
    let path = jail_path(Path::new(wellknown::BROKER_REPLY_FIFO), jailed);
    for _ in 0..50 {
        match pipe::OpenOptions::new().open_sender(&path) {
            Ok(sender) => return Ok(sender),
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("opening broker fifo {}", path.display()));
            }
        }
    }
    bail!("broker fifo {} never became writable", path.display());
}
