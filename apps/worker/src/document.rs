use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use docbridge_engine::{CallbackEvent, Engine, EngineDocument, EngineError};
use docbridge_protocol::{session_index, Frame};

use crate::net;
use crate::queue::MessageQueue;
use crate::session::{SessionState, WorkerSession};

/// A document container: owns the engine document handle and the
/// sessions viewing it. Commands from every session funnel through one
/// [`MessageQueue`] drained by a single consumer task, so engine calls
/// are strictly serialised without a document-wide lock.
pub struct Document {
    url: String,
    jail_id: String,
    multi_view: bool,
    engine: Arc<dyn Engine>,
    queue: Arc<MessageQueue>,
    doc: Mutex<Option<Arc<dyn EngineDocument>>>,
    sessions: Mutex<HashMap<u32, Arc<WorkerSession>>>,
}

impl Document {
    pub fn new(
        engine: Arc<dyn Engine>,
        jail_id: String,
        url: String,
        multi_view: bool,
    ) -> Arc<Self> {
        info!(url = %url, jail = %jail_id, multi_view, "document created");
        let document = Arc::new(Document {
            url,
            jail_id,
            multi_view,
            engine,
            queue: Arc::new(MessageQueue::new()),
            doc: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        });
        let consumer = document.clone();
        tokio::spawn(async move { consumer.consume().await });
        document
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn jail_id(&self) -> &str {
        &self.jail_id
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Drains the queue, one command at a time, until closure.
    async fn consume(self: Arc<Self>) {
        loop {
            let message = self.queue.get().await;
            if message.is_eof() {
                break;
            }
            let session = self
                .sessions
                .lock()
                .unwrap()
                .get(&session_index(&message.session_id))
                .cloned();
            match session {
                Some(session) => session.handle_command(&message.payload),
                None => debug!(
                    session = %message.session_id,
                    "dropping command for departed session"
                ),
            }
        }
        debug!(url = %self.url, "document consumer finished");
    }

    /// Opens the dial-back socket to the gateway and starts the session's
    /// receive loop. A stale slot left by a dead session is replaced.
    pub async fn create_session(self: &Arc<Self>, session_id: &str, client_port: u16) -> Result<()> {
        let index = session_index(session_id);
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(&index) {
                if existing.is_live() {
                    warn!(session = session_id, "session is already running");
                    return Ok(());
                }
                warn!(session = session_id, "session is not running, restoring");
                sessions.remove(&index);
            }
        }

        let (outbound, inbound) = net::dial_gateway(client_port, session_id).await?;
        let session = self.attach_session(session_id, outbound);
        session.send_text(&format!(
            "child {} {} {}",
            self.jail_id,
            session_id,
            std::process::id()
        ));
        session.advance(SessionState::Bound);

        let runner = session.clone();
        tokio::spawn(async move { runner.pump(inbound).await });
        Ok(())
    }

    /// Registers a session over an already-established transport. The
    /// production path goes through [`Document::create_session`]; tests
    /// wire channels in directly.
    pub fn attach_session(
        self: &Arc<Self>,
        session_id: &str,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<WorkerSession> {
        let session = WorkerSession::new(session_id, Arc::downgrade(self), outbound);
        self.sessions
            .lock()
            .unwrap()
            .insert(session.index(), session.clone());
        debug!(
            session = session_id,
            count = self.sessions.lock().unwrap().len(),
            "session attached"
        );
        session
    }

    /// Loads the document on first use and hands out the engine handle;
    /// later sessions get a view of the same document when the engine is
    /// multi-view. Invalidations from the document-level callback fan out
    /// to every live session.
    pub fn on_load(
        self: &Arc<Self>,
        session: &WorkerSession,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError> {
        let mut guard = self.doc.lock().unwrap();
        let first_load = guard.is_none();
        let doc = match guard.as_ref() {
            Some(doc) => doc.clone(),
            None => {
                info!(url = %self.url, session = session.id(), "loading new document");
                let doc = self.engine.load_document(uri, options)?;
                let weak = Arc::downgrade(self);
                doc.register_callback(Box::new(move |event| {
                    if let Some(document) = weak.upgrade() {
                        document.broadcast(event);
                    }
                }));
                *guard = Some(doc.clone());
                doc
            }
        };

        if self.multi_view {
            let outbound = session.outbound();
            let view_id = doc.create_view(Box::new(move |event| {
                let _ = outbound.send(Frame::Text(event.to_frame()));
            }));
            session.set_view(view_id);
            info!(
                url = %self.url,
                view = view_id,
                session = session.id(),
                "view loaded"
            );
        } else if !first_load {
            debug!(url = %self.url, session = session.id(), "sharing single-view document");
        }

        Ok(doc)
    }

    pub fn on_unload(&self, session: &WorkerSession) {
        if let Some(view_id) = session.take_view() {
            if let Some(doc) = self.doc.lock().unwrap().as_ref() {
                doc.destroy_view(view_id);
            }
        }
    }

    /// Delivers a document-level engine event to every live session.
    fn broadcast(&self, event: &CallbackEvent) {
        let frame = event.to_frame();
        for session in self.sessions.lock().unwrap().values() {
            if session.is_live() {
                session.send_text(&frame);
            }
        }
    }

    pub fn remove_session(&self, index: u32) {
        self.sessions.lock().unwrap().remove(&index);
    }

    /// Drops dead sessions and returns how many clients remain.
    pub fn purge_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, session| session.is_live());
        sessions.len()
    }

    pub fn has_connections(&self) -> bool {
        self.purge_sessions() > 0
    }

    /// A document may be discarded when nobody is viewing it and all
    /// modifications have been saved. The dirty flag always blocks
    /// discard.
    pub fn can_discard(&self) -> bool {
        if self.has_connections() {
            return false;
        }
        let modified = self
            .doc
            .lock()
            .unwrap()
            .as_ref()
            .map(|doc| doc.is_modified())
            .unwrap_or(false);
        !modified
    }

    /// Stops the consumer and tears down the sessions. With `abnormal`
    /// set the sessions are not asked to say goodbye, their sockets are
    /// simply dropped.
    pub fn shutdown(&self, abnormal: bool) {
        self.queue.close();
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if abnormal {
                session.stop();
            } else {
                session.disconnect("");
            }
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.queue.close();
        debug!(url = %self.url, "document dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbridge_engine::StubEngine;
    use std::io::Write;

    fn doc_fixture(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.odt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, format!("file://{}", path.display()))
    }

    #[tokio::test]
    async fn discardable_until_dirty() {
        let (_dir, url) = doc_fixture("hello");
        let document = Document::new(
            Arc::new(StubEngine::new()),
            "jail".into(),
            url.clone(),
            false,
        );
        assert!(document.can_discard());

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = document.attach_session("0001", tx);
        assert!(!document.can_discard());

        let doc = document.on_load(&session, &url, None).unwrap();
        doc.paste("text/plain", b"edit");

        // session departs but the document is dirty, so discard is blocked
        drop(_rx);
        session.stop();
        assert!(!document.can_discard());

        doc.save();
        assert!(document.can_discard());
    }

    #[tokio::test]
    async fn joining_view_is_told_to_paint_in_multi_view() {
        let (_dir, url) = doc_fixture("hello");
        let document = Document::new(
            Arc::new(StubEngine::new()),
            "jail".into(),
            url.clone(),
            true,
        );

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let session_a = document.attach_session("000a", tx_a);
        document.on_load(&session_a, &url, None).unwrap();
        while rx_a.try_recv().is_ok() {}

        // the second collaborator's fresh view must be asked to render
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let session_b = document.attach_session("000b", tx_b);
        document.on_load(&session_b, &url, None).unwrap();

        let frame = rx_b.try_recv().expect("second view got no frames");
        assert!(
            frame.first_line().starts_with("invalidatetiles:"),
            "got {}",
            frame.first_line()
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_all_live_sessions() {
        let (_dir, url) = doc_fixture("hello");
        let document = Document::new(
            Arc::new(StubEngine::new()),
            "jail".into(),
            url.clone(),
            false,
        );
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let session_a = document.attach_session("000a", tx_a);
        let _session_b = document.attach_session("000b", tx_b);

        let doc = document.on_load(&session_a, &url, None).unwrap();
        doc.paste("text/plain", b"x");

        let got_a = rx_a.try_recv().expect("session a frame");
        let frame = got_a.first_line().to_string();
        assert!(frame.starts_with("invalidatetiles:"), "got {}", frame);
        let mut saw = false;
        while let Ok(frame) = rx_b.try_recv() {
            if frame.first_line().starts_with("invalidatetiles:") {
                saw = true;
            }
        }
        assert!(saw, "session b missed the invalidation");
    }
}
