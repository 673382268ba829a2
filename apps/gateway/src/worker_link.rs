use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use docbridge_protocol::{abbreviate, parse_nextmessage, Frame, TileRequest, Tokens};

use crate::cache::TileCache;
use crate::config::TerminationFlag;

/// Command-value sets worth caching; everything else changes too often.
const CACHED_COMMAND_VALUES: &[&str] = &[".uno:CharFontName", ".uno:StyleApply"];

/// The client-side endpoints a worker link relays into once the session
/// halves are matched.
pub struct ClientPeer {
    pub session_id: String,
    /// Toward the client socket.
    pub tx: mpsc::UnboundedSender<Frame>,
    pub cache: Arc<TileCache>,
    /// Part the worker's responses currently refer to.
    pub current_part: Arc<AtomicI32>,
    /// Completed save-as URLs, already rewritten.
    pub save_as: mpsc::UnboundedSender<String>,
    /// `<childroot>/<jail-id>`, for rewriting jail-relative URLs.
    pub jail_root: PathBuf,
    /// Rung when the client socket must be torn down.
    pub shutdown: Arc<Notify>,
}

/// Bind point between a worker socket and its client session. The link
/// is created when the worker dials in; the client side attaches during
/// matchmaking. Neither side owns the other.
#[derive(Default)]
pub struct WorkerLink {
    client: OnceLock<ClientPeer>,
}

impl WorkerLink {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerLink::default())
    }

    /// Attaches the client half. Returns false if something already
    /// bound, which would mean a duplicate session id.
    pub fn bind(&self, peer: ClientPeer) -> bool {
        self.client.set(peer).is_ok()
    }

    pub fn client(&self) -> Option<&ClientPeer> {
        self.client.get()
    }
}

/// A worker's half of a session as deposited with the matchmaker.
pub struct WorkerPeer {
    pub jail_id: String,
    pub pid: u32,
    /// Toward the worker socket.
    pub tx: mpsc::UnboundedSender<Frame>,
    pub link: Arc<WorkerLink>,
}

/// Receive loop over a worker socket: joins `nextmessage:` preludes,
/// snoops cache-relevant traffic, and relays the rest to the peered
/// client. When the socket dies every dependent client is disconnected.
pub async fn run_worker_link(
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    link: Arc<WorkerLink>,
    termination: Arc<TerminationFlag>,
) {
    let mut clean_close = false;
    while let Some(frame) = inbound.recv().await {
        let frame = match parse_nextmessage(frame.first_line()) {
            Some(size) => match inbound.recv().await {
                Some(next) => {
                    if next.len() != size {
                        warn!(expected = size, got = next.len(), "prelude size mismatch");
                    }
                    next
                }
                None => break,
            },
            None => frame,
        };

        let Some(client) = link.client() else {
            debug!(
                frame = %abbreviate(frame.first_line()),
                "frame from unmatched worker dropped"
            );
            continue;
        };

        if frame.first_line().starts_with("disconnect") {
            debug!(session = %client.session_id, "worker said goodbye");
            clean_close = true;
            client.shutdown.notify_one();
            continue;
        }
        snoop_and_relay(&frame, client);
    }

    if let Some(client) = link.client() {
        // unblock anyone awaiting a save-as result
        let _ = client.save_as.send(String::new());
        if !clean_close {
            termination.set_abnormal();
            warn!(session = %client.session_id, "worker socket died, disconnecting client");
        }
        client.shutdown.notify_one();
    }
}

/// Examines one worker frame on its way to the client, capturing what
/// the cache can reuse. Returns whether the frame was relayed.
fn snoop_and_relay(frame: &Frame, client: &ClientPeer) -> bool {
    let line = frame.first_line().to_string();
    let tokens = Tokens::parse(&line);
    trace!(session = %client.session_id, frame = %abbreviate(&line), "from worker");

    match tokens.name() {
        "curpart:" => {
            if let Some(part) = tokens.int(1, "part") {
                client.current_part.store(part, Ordering::SeqCst);
            }
            // bookkeeping between the halves, not client traffic
            return false;
        }
        "saveas:" => {
            if let Some(url) = tokens.find_string("url") {
                let rewritten = rewrite_jail_url(url, &client.jail_root);
                let _ = client.save_as.send(rewritten.clone());
                let _ = client
                    .tx
                    .send(Frame::Text(format!("saveas: url={}", rewritten)));
            }
            return true;
        }
        "tile:" => {
            if let (Ok(tile), Some(body)) = (TileRequest::parse(&tokens), frame_body(frame)) {
                client.cache.save_tile(&tile, body);
            }
        }
        "status:" => {
            if let Frame::Text(text) = frame {
                client.cache.save_text_file("status.txt", text);
            }
        }
        "commandvalues:" => {
            if let Frame::Text(text) = frame {
                if let Some(command) = command_values_name(text) {
                    if CACHED_COMMAND_VALUES
                        .iter()
                        .any(|cached| command.contains(cached))
                    {
                        client
                            .cache
                            .save_text_file(&format!("cmdValues{}.txt", command), text);
                    }
                }
            }
        }
        "partpagerectangles:" => {
            if let Frame::Text(text) = frame {
                if tokens.count() > 1 {
                    client.cache.save_text_file("partpagerectangles.txt", text);
                }
            }
        }
        "invalidatecursor:" => {
            client.cache.set_editing(true);
        }
        "invalidatetiles:" => {
            client.cache.set_editing(true);
            client
                .cache
                .invalidate_from_line(&line, client.current_part.load(Ordering::SeqCst));
        }
        "renderfont:" => {
            if let (Some(font), Some(body)) = (tokens.find_string("font"), frame_body(frame)) {
                client.cache.save_rendering(font, "font", body);
            }
        }
        _ => {}
    }

    client.tx.send(frame.clone()).is_ok()
}

/// Bytes following the header line of a binary response frame.
fn frame_body(frame: &Frame) -> Option<&[u8]> {
    let data = frame.as_bytes();
    let pos = data.iter().position(|&b| b == b'\n')?;
    Some(&data[pos + 1..])
}

/// Extracts `commandName` from a `commandvalues:` payload.
fn command_values_name(text: &str) -> Option<String> {
    let json_start = text.find('{')?;
    let value: Value = serde_json::from_str(&text[json_start..]).ok()?;
    value
        .get("commandName")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Anchors a jail-relative `file://` URL under the jail root on the
/// host, by joining the prefix rather than trimming characters.
pub fn rewrite_jail_url(url: &str, jail_root: &Path) -> String {
    match url.strip_prefix("file://") {
        Some(path) => format!(
            "file://{}",
            jail_root.join(path.trim_start_matches('/')).display()
        ),
        None => url.to_string(),
    }
}

/// Validates the worker's first frame, `child <jail-id> <session-id>
/// <pid>`, and returns its fields.
pub fn parse_child_hello(line: &str) -> Option<(String, String, u32)> {
    let tokens = Tokens::parse(line);
    if tokens.name() != "child" || tokens.count() != 4 {
        return None;
    }
    let jail_id = tokens.get(1)?.to_string();
    let session_id = tokens.get(2)?.to_string();
    let pid = tokens.get(3)?.parse().ok()?;
    Some((jail_id, session_id, pid))
}
