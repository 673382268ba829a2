use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use url::Url;

use docbridge_protocol::{
    abbreviate, error_frame, is_client_command, nextmessage_prelude, protocol_version,
    version::handshake_matches, ErrorKind, Frame, LoadCommand, TileCombineRequest, TileRequest,
    Tokens, SMALL_MESSAGE_SIZE,
};

use crate::broker::SessionBroker;
use crate::cache::TileCache;
use crate::config::RuntimeConfig;
use crate::matchmaker::Matchmaker;
use crate::worker_link::{ClientPeer, WorkerPeer};

/// Matchmaking policy: each attempt republishes the broker request and
/// waits bounded for the worker half to arrive.
const MATCH_ATTEMPTS: u32 = 3;
const MATCH_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    Close,
}

/// The gateway half of a client session: validates the protocol,
/// answers cacheable reads from the tile cache, and forwards the rest to
/// the peered worker session.
pub struct ClientSession {
    id: String,
    config: Arc<RuntimeConfig>,
    matchmaker: Arc<Matchmaker>,
    broker: Arc<dyn SessionBroker>,
    client_tx: mpsc::UnboundedSender<Frame>,
    shutdown: Arc<Notify>,
    handshaken: bool,
    doc_url: Option<String>,
    load_part: Option<i32>,
    doc_options: Option<String>,
    cache: Option<Arc<TileCache>>,
    peer: Option<WorkerPeer>,
    current_part: Arc<AtomicI32>,
    save_as_tx: mpsc::UnboundedSender<String>,
    save_as_rx: mpsc::UnboundedReceiver<String>,
    disconnected: bool,
}

impl ClientSession {
    pub fn new(
        id: String,
        config: Arc<RuntimeConfig>,
        matchmaker: Arc<Matchmaker>,
        broker: Arc<dyn SessionBroker>,
        client_tx: mpsc::UnboundedSender<Frame>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let (save_as_tx, save_as_rx) = mpsc::unbounded_channel();
        info!(session = %id, "client session created");
        ClientSession {
            id,
            config,
            matchmaker,
            broker,
            client_tx,
            shutdown,
            handshaken: false,
            doc_url: None,
            load_part: None,
            doc_options: None,
            cache: None,
            peer: None,
            current_part: Arc::new(AtomicI32::new(0)),
            save_as_tx,
            save_as_rx,
            disconnected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dispatches one frame from the client socket.
    pub async fn handle_frame(&mut self, frame: Frame) -> SessionFlow {
        let line = frame.first_line().to_string();
        let tokens = Tokens::parse(&line);
        debug!(session = %self.id, command = %abbreviate(&line), "from client");

        if !self.handshaken {
            return self.handshake(&tokens);
        }

        match tokens.name() {
            "load" => return self.load_document(&line).await,
            "disconnect" => {
                info!(
                    session = %self.id,
                    reason = tokens.get(1).unwrap_or("no reason"),
                    "graceful disconnect"
                );
                self.disconnect();
                return SessionFlow::Close;
            }
            name if !is_client_command(name) => {
                self.send_error(name, ErrorKind::Unknown);
                return SessionFlow::Continue;
            }
            _ => {}
        }

        if self.doc_url.is_none() {
            self.send_error(tokens.name(), ErrorKind::NoDocLoaded);
            return SessionFlow::Continue;
        }

        match tokens.name() {
            "canceltiles" => {
                if self.peer.is_some() {
                    self.forward_to_peer(frame);
                }
            }
            "commandvalues" => return self.get_command_values(frame, &tokens).await,
            "partpagerectangles" => return self.get_part_page_rectangles(frame).await,
            "invalidatetiles" => self.invalidate_tiles(&tokens),
            "renderfont" => return self.send_font_rendering(frame, &tokens).await,
            "status" => return self.get_status(frame).await,
            "tile" => return self.send_tile(&tokens).await,
            "tilecombine" => return self.send_combined_tiles(&tokens).await,
            _ => {
                // everything else needs the engine in the worker
                if !self.ensure_peer().await {
                    return SessionFlow::Close;
                }
                let is_save =
                    tokens.name() == "uno" && tokens.get(1) == Some(".uno:Save");
                if tokens.name() != "requestloksession" {
                    self.forward_to_peer(frame);
                }
                if is_save {
                    if let Some(cache) = &self.cache {
                        cache.document_saved();
                    }
                }
            }
        }
        SessionFlow::Continue
    }

    fn handshake(&mut self, tokens: &Tokens) -> SessionFlow {
        let compatible = tokens.name() == "loolclient"
            && tokens.count() == 2
            && handshake_matches(tokens.get(1).unwrap_or(""));
        if !compatible {
            self.send_text(&error_frame("loolclient", ErrorKind::BadVersion));
            return SessionFlow::Close;
        }
        self.handshaken = true;
        self.send_text(&format!("loolserver {}", protocol_version()));
        SessionFlow::Continue
    }

    async fn load_document(&mut self, line: &str) -> SessionFlow {
        if self.doc_url.is_some() {
            self.send_error("load", ErrorKind::DocAlreadyLoaded);
            return SessionFlow::Continue;
        }
        let command = match LoadCommand::parse(line) {
            Ok(command) => command,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return SessionFlow::Continue;
            }
        };
        if Url::parse(&command.url).is_err() {
            self.send_error("load", ErrorKind::UriInvalid);
            return SessionFlow::Continue;
        }

        self.cache = Some(Arc::new(TileCache::new(
            &self.config.cache_root,
            &command.url,
            command.timestamp.as_deref(),
        )));
        self.doc_url = Some(command.url);
        self.load_part = command.part;
        self.doc_options = command.options;

        if self.ensure_peer().await {
            SessionFlow::Continue
        } else {
            SessionFlow::Close
        }
    }

    /// Obtains the worker half, matchmaking with bounded retries. On
    /// exhaustion the client socket is shut down.
    async fn ensure_peer(&mut self) -> bool {
        if self.peer.is_some() {
            return true;
        }
        let Some(url) = self.doc_url.clone() else {
            return false;
        };

        for attempt in 1..=MATCH_ATTEMPTS {
            if let Err(err) = self.broker.request_session(&self.id, &url).await {
                error!(session = %self.id, "broker request failed: {:#}", err);
                break;
            }
            if let Some(peer) = self.matchmaker.claim(&self.id, MATCH_WAIT).await {
                return self.bind_peer(peer, &url);
            }
            info!(session = %self.id, attempt, "retrying worker matchmaking");
        }

        error!(session = %self.id, url = %url, "no worker arrived, shutting down socket");
        false
    }

    /// Records the two halves as peers and sends the worker its `load`.
    fn bind_peer(&mut self, peer: WorkerPeer, url: &str) -> bool {
        let Some(cache) = self.cache.clone() else {
            return false;
        };
        let jail_root = self.config.child_root.join(&peer.jail_id);
        let bound = peer.link.bind(ClientPeer {
            session_id: self.id.clone(),
            tx: self.client_tx.clone(),
            cache,
            current_part: self.current_part.clone(),
            save_as: self.save_as_tx.clone(),
            jail_root: jail_root.clone(),
            shutdown: self.shutdown.clone(),
        });
        if !bound {
            warn!(session = %self.id, "worker link was already bound");
        }

        let load = LoadCommand {
            url: url.to_string(),
            jail: stage_document(url, &jail_root, peer.pid),
            part: self.load_part,
            timestamp: None,
            options: self.doc_options.clone(),
        };
        let sent = peer.tx.send(Frame::Text(load.to_command())).is_ok();
        debug!(session = %self.id, pid = peer.pid, "peered with worker");
        self.peer = Some(peer);
        sent
    }

    async fn get_status(&mut self, frame: Frame) -> SessionFlow {
        if let Some(status) = self.cached_text("status.txt") {
            self.send_text(&status);
            return SessionFlow::Continue;
        }
        self.forward_for(frame).await
    }

    async fn get_command_values(&mut self, frame: Frame, tokens: &Tokens<'_>) -> SessionFlow {
        let Some(command) = tokens.string(1, "command").filter(|_| tokens.count() == 2) else {
            self.send_error("commandvalues", ErrorKind::Syntax);
            return SessionFlow::Continue;
        };
        if let Some(values) = self.cached_text(&format!("cmdValues{}.txt", command)) {
            self.send_text(&values);
            return SessionFlow::Continue;
        }
        self.forward_for(frame).await
    }

    async fn get_part_page_rectangles(&mut self, frame: Frame) -> SessionFlow {
        if let Some(rectangles) = self.cached_text("partpagerectangles.txt") {
            self.send_text(&rectangles);
            return SessionFlow::Continue;
        }
        self.forward_for(frame).await
    }

    async fn send_font_rendering(&mut self, frame: Frame, tokens: &Tokens<'_>) -> SessionFlow {
        let Some(font) = tokens.find_string("font") else {
            self.send_error("renderfont", ErrorKind::Syntax);
            return SessionFlow::Continue;
        };
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.lookup_rendering(font, "font"));
        if let Some(rendering) = cached {
            let mut output = format!("renderfont: {}\n", tokens.join_from(1)).into_bytes();
            output.extend_from_slice(&rendering);
            self.send_binary(output);
            return SessionFlow::Continue;
        }
        self.forward_for(frame).await
    }

    async fn send_tile(&mut self, tokens: &Tokens<'_>) -> SessionFlow {
        let tile = match TileRequest::parse(tokens) {
            Ok(tile) => tile,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return SessionFlow::Continue;
            }
        };
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.lookup_tile(&tile));
        if let Some(data) = cached {
            let mut output = tile.response_header().into_bytes();
            output.extend_from_slice(&data);
            self.send_binary(output);
            return SessionFlow::Continue;
        }
        self.forward_for(Frame::Text(tile.to_command())).await
    }

    /// Serves cached positions directly and forwards one combined
    /// request covering only the misses.
    async fn send_combined_tiles(&mut self, tokens: &Tokens<'_>) -> SessionFlow {
        let combined = match TileCombineRequest::parse(tokens) {
            Ok(combined) => combined,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return SessionFlow::Continue;
            }
        };

        let mut misses = Vec::new();
        for tile in combined.tiles() {
            let cached = self
                .cache
                .as_ref()
                .and_then(|cache| cache.lookup_tile(&tile));
            match cached {
                Some(data) => {
                    let mut output = tile.response_header().into_bytes();
                    output.extend_from_slice(&data);
                    self.send_binary(output);
                }
                None => misses.push((tile.tile_pos_x, tile.tile_pos_y)),
            }
        }

        if misses.is_empty() {
            return SessionFlow::Continue;
        }
        let forward = combined.with_positions(&misses);
        self.forward_for(Frame::Text(forward.to_command())).await
    }

    /// Client-driven invalidation; handled entirely against the cache.
    fn invalidate_tiles(&mut self, tokens: &Tokens<'_>) {
        let parsed = (
            tokens.int(1, "part"),
            tokens.int(2, "tileposx"),
            tokens.int(3, "tileposy"),
            tokens.int(4, "tilewidth"),
            tokens.int(5, "tileheight"),
        );
        let (Some(part), Some(x), Some(y), Some(width), Some(height)) = parsed else {
            self.send_error("invalidatetiles", ErrorKind::Syntax);
            return;
        };
        if let Some(cache) = &self.cache {
            cache.set_editing(true);
            cache.invalidate_tiles(part, x, y, width, height);
        }
    }

    /// Cache miss path shared by the interceptable commands.
    async fn forward_for(&mut self, frame: Frame) -> SessionFlow {
        if !self.ensure_peer().await {
            return SessionFlow::Close;
        }
        self.forward_to_peer(frame);
        SessionFlow::Continue
    }

    fn forward_to_peer(&mut self, frame: Frame) {
        let Some(peer) = &self.peer else {
            warn!(session = %self.id, "no peer to forward to");
            return;
        };
        if frame.len() > SMALL_MESSAGE_SIZE {
            let _ = peer
                .tx
                .send(Frame::Text(nextmessage_prelude(frame.len())));
        }
        if peer.tx.send(frame).is_err() {
            warn!(session = %self.id, "worker half is gone");
            self.shutdown.notify_one();
        }
    }

    fn cached_text(&self, name: &str) -> Option<String> {
        self.cache.as_ref().and_then(|cache| cache.get_text_file(name))
    }

    /// Blocks until the worker publishes a completed save-as URL; the
    /// empty string means the session is going away.
    pub async fn get_save_as(&mut self) -> String {
        self.save_as_rx.recv().await.unwrap_or_default()
    }

    /// Releases anything waiting on this session and says goodbye to the
    /// worker half.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        let _ = self.save_as_tx.send(String::new());
        if let Some(peer) = &self.peer {
            let _ = peer.tx.send(Frame::Text("disconnect".to_string()));
        }
    }

    fn send_text(&self, text: &str) {
        if self.client_tx.send(Frame::Text(text.to_string())).is_err() {
            debug!(session = %self.id, "client channel closed");
        }
    }

    fn send_binary(&self, data: Vec<u8>) {
        let _ = self.client_tx.send(Frame::Binary(data));
    }

    fn send_error(&self, cmd: &str, kind: ErrorKind) {
        self.send_text(&error_frame(cmd, kind));
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Copies the document into the jail so the worker can reach it after
/// chroot. Returns the jail-internal URL, or None when the source is
/// not a local file (the worker then falls back to the public URL).
fn stage_document(url: &str, jail_root: &Path, pid: u32) -> Option<String> {
    let source = url.strip_prefix("file://")?;
    let name = Path::new(source).file_name()?.to_string_lossy().into_owned();
    let docs_dir = jail_root.join("user").join("docs").join(pid.to_string());
    if let Err(err) = fs::create_dir_all(&docs_dir) {
        warn!(dir = %docs_dir.display(), "cannot create jail docs dir: {}", err);
        return None;
    }
    let target = docs_dir.join(&name);
    if !target.exists() {
        if let Err(err) = fs::hard_link(source, &target).or_else(|_| {
            fs::copy(source, &target).map(|_| ())
        }) {
            warn!(source, "cannot stage document into jail: {}", err);
            return None;
        }
    }
    Some(format!("file:///user/docs/{}/{}", pid, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_link::WorkerLink;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NeverBroker;

    #[async_trait]
    impl SessionBroker for NeverBroker {
        async fn request_session(&self, _session_id: &str, _url: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Broker that immediately offers a worker half wired to channels.
    struct InstantBroker {
        matchmaker: Arc<Matchmaker>,
        worker_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    }

    #[async_trait]
    impl SessionBroker for InstantBroker {
        async fn request_session(&self, session_id: &str, _url: &str) -> Result<()> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.worker_rx.lock().unwrap() = Some(rx);
            self.matchmaker.offer(
                session_id,
                WorkerPeer {
                    jail_id: "testjail".into(),
                    pid: 4242,
                    tx,
                    link: WorkerLink::new(),
                },
            );
            Ok(())
        }
    }

    struct Fixture {
        session: ClientSession,
        client_rx: mpsc::UnboundedReceiver<Frame>,
        _dir: tempfile::TempDir,
    }

    fn fixture(broker: Arc<dyn SessionBroker>, matchmaker: Arc<Matchmaker>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RuntimeConfig {
            child_root: dir.path().join("jails"),
            cache_root: dir.path().join("tiles"),
            ..RuntimeConfig::default()
        });
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let session = ClientSession::new(
            "00aa".into(),
            config,
            matchmaker,
            broker,
            client_tx,
            Arc::new(Notify::new()),
        );
        Fixture {
            session,
            client_rx,
            _dir: dir,
        }
    }

    fn next_text(rx: &mut mpsc::UnboundedReceiver<Frame>) -> String {
        match rx.try_recv().expect("expected a frame") {
            Frame::Text(text) => text,
            Frame::Binary(data) => panic!("unexpected binary frame: {} bytes", data.len()),
        }
    }

    #[tokio::test]
    async fn version_mismatch_closes_the_socket() {
        let mut fx = fixture(Arc::new(NeverBroker), Arc::new(Matchmaker::new()));
        let flow = fx
            .session
            .handle_frame(Frame::Text("loolclient 99.0".into()))
            .await;
        assert_eq!(flow, SessionFlow::Close);
        assert_eq!(
            next_text(&mut fx.client_rx),
            "error: cmd=loolclient kind=badversion"
        );
    }

    #[tokio::test]
    async fn handshake_then_commands_are_gated_on_load() {
        let mut fx = fixture(Arc::new(NeverBroker), Arc::new(Matchmaker::new()));
        let flow = fx
            .session
            .handle_frame(Frame::Text("loolclient 1.0".into()))
            .await;
        assert_eq!(flow, SessionFlow::Continue);
        assert!(next_text(&mut fx.client_rx).starts_with("loolserver "));

        fx.session
            .handle_frame(Frame::Text("bogus x=1".into()))
            .await;
        assert_eq!(next_text(&mut fx.client_rx), "error: cmd=bogus kind=unknown");

        fx.session.handle_frame(Frame::Text("status".into())).await;
        assert_eq!(
            next_text(&mut fx.client_rx),
            "error: cmd=status kind=nodocloaded"
        );
    }

    #[tokio::test]
    async fn invalid_uri_is_rejected() {
        let mut fx = fixture(Arc::new(NeverBroker), Arc::new(Matchmaker::new()));
        fx.session
            .handle_frame(Frame::Text("loolclient 1.0".into()))
            .await;
        let _ = next_text(&mut fx.client_rx);
        fx.session
            .handle_frame(Frame::Text("load url=not a uri".into()))
            .await;
        assert_eq!(
            next_text(&mut fx.client_rx),
            "error: cmd=load kind=uriinvalid"
        );
    }

    #[tokio::test]
    async fn second_load_is_rejected_and_first_kept() {
        let matchmaker = Arc::new(Matchmaker::new());
        let broker = Arc::new(InstantBroker {
            matchmaker: matchmaker.clone(),
            worker_rx: std::sync::Mutex::new(None),
        });
        let mut fx = fixture(broker.clone(), matchmaker);
        fx.session
            .handle_frame(Frame::Text("loolclient 1.0".into()))
            .await;
        let _ = next_text(&mut fx.client_rx);

        let flow = fx
            .session
            .handle_frame(Frame::Text("load url=file:///tmp/first.odt".into()))
            .await;
        assert_eq!(flow, SessionFlow::Continue);
        let mut worker_rx = broker.worker_rx.lock().unwrap().take().unwrap();
        let forwarded = worker_rx.try_recv().unwrap();
        assert!(forwarded
            .first_line()
            .starts_with("load url=file:///tmp/first.odt"));

        let flow = fx
            .session
            .handle_frame(Frame::Text("load url=file:///tmp/second.odt".into()))
            .await;
        assert_eq!(flow, SessionFlow::Continue);
        assert_eq!(
            next_text(&mut fx.client_rx),
            "error: cmd=load kind=docalreadyloaded"
        );
        // the worker saw no second load
        assert!(worker_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tile_syntax_and_range_errors() {
        let matchmaker = Arc::new(Matchmaker::new());
        let broker = Arc::new(InstantBroker {
            matchmaker: matchmaker.clone(),
            worker_rx: std::sync::Mutex::new(None),
        });
        let mut fx = fixture(broker, matchmaker);
        fx.session
            .handle_frame(Frame::Text("loolclient 1.0".into()))
            .await;
        let _ = next_text(&mut fx.client_rx);
        fx.session
            .handle_frame(Frame::Text("load url=file:///tmp/doc.odt".into()))
            .await;

        fx.session
            .handle_frame(Frame::Text("tile part=0 width=256".into()))
            .await;
        assert_eq!(next_text(&mut fx.client_rx), "error: cmd=tile kind=syntax");

        fx.session
            .handle_frame(Frame::Text(
                "tile part=0 width=-1 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840"
                    .into(),
            ))
            .await;
        assert_eq!(next_text(&mut fx.client_rx), "error: cmd=tile kind=invalid");
    }

    #[tokio::test]
    async fn mismatched_tilecombine_positions_are_invalid() {
        let matchmaker = Arc::new(Matchmaker::new());
        let broker = Arc::new(InstantBroker {
            matchmaker: matchmaker.clone(),
            worker_rx: std::sync::Mutex::new(None),
        });
        let mut fx = fixture(broker, matchmaker);
        fx.session
            .handle_frame(Frame::Text("loolclient 1.0".into()))
            .await;
        let _ = next_text(&mut fx.client_rx);
        fx.session
            .handle_frame(Frame::Text("load url=file:///tmp/doc.odt".into()))
            .await;

        fx.session
            .handle_frame(Frame::Text(
                "tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840"
                    .into(),
            ))
            .await;
        assert_eq!(
            next_text(&mut fx.client_rx),
            "error: cmd=tilecombine kind=invalid"
        );
    }
}
