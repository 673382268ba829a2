use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use docbridge_engine::EngineDocument;
use docbridge_protocol::{
    abbreviate, error_frame, first_line, nextmessage_prelude, parse_nextmessage, session_index,
    ErrorKind, Frame, LoadCommand, TileCombineRequest, TileRequest, Tokens, SMALL_MESSAGE_SIZE,
};

use crate::document::Document;
use crate::queue::QueuedMessage;

/// Session lifecycle. Transitions are one-way; a session never goes
/// back from draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    New,
    Bound,
    Running,
    Draining,
    Closed,
}

/// The worker half of a client session. Owns the dial-back socket to
/// the gateway; classification of inbound frames happens here, engine
/// work happens on the document's consumer.
pub struct WorkerSession {
    id: String,
    index: u32,
    document: Weak<Document>,
    outbound: mpsc::UnboundedSender<Frame>,
    state: Mutex<SessionState>,
    stop: AtomicBool,
    doc: Mutex<Option<Arc<dyn EngineDocument>>>,
    view_id: Mutex<Option<i32>>,
    current_part: AtomicI32,
}

impl WorkerSession {
    pub fn new(
        id: &str,
        document: Weak<Document>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Self> {
        Arc::new(WorkerSession {
            id: id.to_string(),
            index: session_index(id),
            document,
            outbound,
            state: Mutex::new(SessionState::New),
            stop: AtomicBool::new(false),
            doc: Mutex::new(None),
            view_id: Mutex::new(None),
            current_part: AtomicI32::new(-1),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn advance(&self, to: SessionState) {
        let mut state = self.state.lock().unwrap();
        if *state < to {
            *state = to;
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() < SessionState::Draining && !self.outbound.is_closed()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.advance(SessionState::Draining);
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    pub fn set_view(&self, view_id: i32) {
        *self.view_id.lock().unwrap() = Some(view_id);
    }

    pub fn take_view(&self) -> Option<i32> {
        self.view_id.lock().unwrap().take()
    }

    /// Sends a text frame toward the gateway, preceded by a
    /// `nextmessage:` prelude when it exceeds the small-frame threshold.
    pub fn send_text(&self, text: &str) {
        if text.len() > SMALL_MESSAGE_SIZE {
            let _ = self
                .outbound
                .send(Frame::Text(nextmessage_prelude(text.len())));
        }
        if self.outbound.send(Frame::Text(text.to_string())).is_err() {
            debug!(session = %self.id, "send on closed session");
        }
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        if data.len() > SMALL_MESSAGE_SIZE {
            let _ = self
                .outbound
                .send(Frame::Text(nextmessage_prelude(data.len())));
        }
        let _ = self.outbound.send(Frame::Binary(data));
    }

    fn send_error(&self, cmd: &str, kind: ErrorKind) {
        self.send_text(&error_frame(cmd, kind));
    }

    /// Tells the gateway this session is going away, then stops sending.
    pub fn disconnect(&self, reason: &str) {
        if self.state() < SessionState::Draining {
            let frame = if reason.is_empty() {
                "disconnect".to_string()
            } else {
                format!("disconnect {}", reason)
            };
            let _ = self.outbound.send(Frame::Text(frame));
        }
        self.advance(SessionState::Draining);
    }

    /// The receive loop: classifies frames off the gateway socket and
    /// queues commands for the document consumer. Exits at the next
    /// frame boundary once stopped.
    pub async fn pump(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        self.advance(SessionState::Running);
        debug!(session = %self.id, "session receive loop started");

        while let Some(frame) = inbound.recv().await {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let line = frame.first_line().to_string();
            if line == "eof" {
                info!(session = %self.id, "received eof, finishing");
                break;
            }

            let tokens = Tokens::parse(&line);
            if tokens.name() == "disconnect" {
                info!(
                    session = %self.id,
                    reason = tokens.get(1).unwrap_or("no reason"),
                    "client disconnected"
                );
                break;
            }

            // A prelude announces an oversized follow-up frame; the next
            // frame is the real payload.
            let frame = match parse_nextmessage(&line) {
                Some(size) => match inbound.recv().await {
                    Some(next) => {
                        if next.len() != size {
                            warn!(
                                session = %self.id,
                                expected = size,
                                got = next.len(),
                                "nextmessage size mismatch"
                            );
                        }
                        next
                    }
                    None => break,
                },
                None => frame,
            };

            let first = frame.first_line();
            if first == "canceltiles" {
                if let Some(document) = self.document.upgrade() {
                    document.queue().purge_tile_requests(&self.id);
                }
                continue;
            }

            // Only paste carries a body across lines; everything else is
            // a single line.
            let payload = match frame {
                Frame::Text(text) => text,
                Frame::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            };
            let Some(document) = self.document.upgrade() else {
                break;
            };
            document
                .queue()
                .put(QueuedMessage {
                    session_id: self.id.clone(),
                    payload,
                })
                .await;
        }

        self.advance(SessionState::Draining);
        if let Some(document) = self.document.upgrade() {
            document.queue().purge_session(&self.id);
            document.on_unload(&self);
            document.remove_session(self.index);
        }
        self.disconnect("");
        self.advance(SessionState::Closed);
        debug!(session = %self.id, "session receive loop finished");
    }

    /// Executes one queued command against the engine. Runs on the
    /// document's consumer task, so calls for a document never overlap.
    pub fn handle_command(&self, payload: &str) {
        let line = first_line(payload);
        debug!(session = %self.id, command = %abbreviate(line), "handling");
        let tokens = Tokens::parse(line);

        if tokens.name() == "load" {
            self.load(payload);
            return;
        }

        let doc = self.doc.lock().unwrap().clone();
        let Some(doc) = doc else {
            self.send_error(tokens.name(), ErrorKind::NoDocLoaded);
            return;
        };

        match tokens.name() {
            "status" => self.send_text(&doc.status().to_frame()),
            "tile" => self.send_tile(&doc, &tokens),
            "tilecombine" => self.send_combined_tiles(&doc, &tokens),
            "uno" => self.uno_command(&doc, &tokens),
            "saveas" => self.save_as(&doc, &tokens),
            "downloadas" => self.download_as(&doc, &tokens),
            "getchildid" => {
                self.send_text(&format!("getchildid: id={}", std::process::id()));
            }
            "gettextselection" => {
                let mimetype = tokens.find_string("mimetype").unwrap_or("text/plain");
                let selection = doc.text_selection(mimetype);
                self.send_text(&format!("textselectioncontent: {}", selection));
            }
            "paste" => self.paste(&doc, payload, &tokens),
            "insertfile" => {
                // the engine treats the insertion as an ordinary edit
                doc.uno_command(".uno:InsertGraphic");
            }
            "key" => self.key_event(&doc, &tokens),
            "mouse" => self.mouse_event(&doc, &tokens),
            "selecttext" => self.select_text(&doc, &tokens),
            "selectgraphic" => self.select_graphic(&doc, &tokens),
            "resetselection" => doc.reset_selection(),
            "clientzoom" | "clientvisiblearea" | "setpage" => {
                debug!(session = %self.id, "{} acknowledged", tokens.name());
            }
            "setclientpart" => {
                if let Some(part) = tokens.find_int("part") {
                    doc.set_part(part);
                    self.publish_part(part);
                } else {
                    self.send_error("setclientpart", ErrorKind::Syntax);
                }
            }
            "partpagerectangles" => self.send_text(&doc.part_page_rectangles()),
            "renderfont" => self.render_font(&doc, &tokens),
            "requestloksession" => {}
            "unload" => {
                if let Some(document) = self.document.upgrade() {
                    document.on_unload(self);
                }
            }
            other => {
                // the gateway filters unknown commands; reaching here
                // means the two sides disagree on the table
                error!(session = %self.id, command = other, "unexpected command in worker");
                self.send_error(other, ErrorKind::Unknown);
            }
        }
    }

    fn load(&self, payload: &str) {
        let command = match LoadCommand::parse(first_line(payload)) {
            Ok(command) => command,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return;
            }
        };
        let Some(document) = self.document.upgrade() else {
            return;
        };

        // Prefer the jailed path; fall back to the public URL when the
        // jail copy is not visible (unjailed developer runs).
        let uri = match &command.jail {
            Some(jail) if uri_exists(jail) => jail.clone(),
            _ => command.url.clone(),
        };

        match document.on_load(self, &uri, command.options.as_deref()) {
            Ok(doc) => {
                if let Some(part) = command.part {
                    doc.set_part(part);
                }
                let status = doc.status();
                self.publish_part(status.current_part);
                self.send_text(&status.to_frame());
                *self.doc.lock().unwrap() = Some(doc);
            }
            Err(err) => {
                error!(session = %self.id, url = %command.url, "load failed: {}", err);
                self.send_error("load", ErrorKind::Invalid);
            }
        }
    }

    fn send_tile(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let tile = match TileRequest::parse(tokens) {
            Ok(tile) => tile,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return;
            }
        };
        self.publish_part(tile.part);
        let rendered = doc.render_tile(&tile);
        let mut output = tile.response_header().into_bytes();
        output.extend_from_slice(&rendered);
        self.send_binary(output);
    }

    fn send_combined_tiles(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let combined = match TileCombineRequest::parse(tokens) {
            Ok(combined) => combined,
            Err(err) => {
                self.send_error(err.cmd(), err.kind());
                return;
            }
        };
        self.publish_part(combined.part);
        for tile in combined.tiles() {
            let rendered = doc.render_tile(&tile);
            let mut output = tile.response_header().into_bytes();
            output.extend_from_slice(&rendered);
            self.send_binary(output);
        }
    }

    fn uno_command(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let Some(command) = tokens.get(1) else {
            self.send_error("uno", ErrorKind::Syntax);
            return;
        };
        if command == ".uno:Save" {
            if doc.save() {
                info!(session = %self.id, "document saved");
            } else {
                warn!(session = %self.id, "save failed");
            }
            return;
        }
        if !doc.uno_command(command) {
            warn!(session = %self.id, command, "engine rejected uno command");
        }
    }

    fn save_as(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let Some(url) = tokens.find_string("url") else {
            self.send_error("saveas", ErrorKind::Syntax);
            return;
        };
        let format = tokens.find_string("format");
        let options = tokens.find_string("options");
        if doc.save_as(url, format, options) {
            // Inside the chroot this URL is already jail-relative; the
            // gateway anchors it under the jail root for the client.
            self.send_text(&format!("saveas: url={}", url));
        } else {
            self.send_error("saveas", ErrorKind::Invalid);
        }
    }

    fn download_as(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let Some(name) = tokens.find_string("name") else {
            self.send_error("downloadas", ErrorKind::Syntax);
            return;
        };
        let format = tokens.find_string("format");
        let target = format!(
            "file:///user/docs/{}/{}",
            std::process::id(),
            name
        );
        if doc.save_as(&target, format, None) {
            self.send_text(&format!("downloadas: url={}", target));
        } else {
            self.send_error("downloadas", ErrorKind::Invalid);
        }
    }

    fn paste(&self, doc: &Arc<dyn EngineDocument>, payload: &str, tokens: &Tokens) {
        let Some(mimetype) = tokens.string(1, "mimetype") else {
            self.send_error("paste", ErrorKind::Syntax);
            return;
        };
        let body = match payload.find('\n') {
            Some(pos) => &payload[pos + 1..],
            None => "",
        };
        if !doc.paste(mimetype, body.as_bytes()) {
            self.send_error("paste", ErrorKind::Invalid);
        }
    }

    fn key_event(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let event_type = tokens.string(1, "type");
        let char_code = tokens.find_int("char");
        let key_code = tokens.find_int("key");
        match (event_type, char_code, key_code) {
            (Some(event_type), Some(char_code), Some(key_code)) => {
                doc.key_event(event_type, char_code, key_code)
            }
            _ => self.send_error("key", ErrorKind::Syntax),
        }
    }

    fn mouse_event(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let event_type = tokens.string(1, "type");
        let x = tokens.find_int("x");
        let y = tokens.find_int("y");
        let count = tokens.find_int("count").unwrap_or(1);
        match (event_type, x, y) {
            (Some(event_type), Some(x), Some(y)) => doc.mouse_event(event_type, x, y, count),
            _ => self.send_error("mouse", ErrorKind::Syntax),
        }
    }

    fn select_text(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let select_type = tokens.string(1, "type");
        let x = tokens.find_int("x");
        let y = tokens.find_int("y");
        match (select_type, x, y) {
            (Some(select_type), Some(x), Some(y)) => doc.select_text(select_type, x, y),
            _ => self.send_error("selecttext", ErrorKind::Syntax),
        }
    }

    fn select_graphic(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let select_type = tokens.string(1, "type");
        let x = tokens.find_int("x");
        let y = tokens.find_int("y");
        match (select_type, x, y) {
            (Some(select_type), Some(x), Some(y)) => doc.select_graphic(select_type, x, y),
            _ => self.send_error("selectgraphic", ErrorKind::Syntax),
        }
    }

    fn render_font(&self, doc: &Arc<dyn EngineDocument>, tokens: &Tokens) {
        let Some(font) = tokens.find_string("font") else {
            self.send_error("renderfont", ErrorKind::Syntax);
            return;
        };
        let mut output = format!("renderfont: {}\n", tokens.join_from(1)).into_bytes();
        output.extend_from_slice(&doc.render_font(font));
        self.send_binary(output);
    }

    /// Reports the part the following responses refer to, once per
    /// change, so the gateway invalidates the right cache entries.
    fn publish_part(&self, part: i32) {
        if self.current_part.swap(part, Ordering::SeqCst) != part {
            self.send_text(&format!("curpart: part={}", part));
        }
    }
}


fn uri_exists(uri: &str) -> bool {
    uri.strip_prefix("file://")
        .map(|path| std::path::Path::new(path).exists())
        .unwrap_or(false)
}
