//! Axum WebSocket handlers for both listeners: the public client
//! endpoint and the loopback endpoint workers dial back on.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use docbridge_protocol::{error_frame, ErrorKind, Frame};

use crate::client_session::{ClientSession, SessionFlow};
use crate::state::GatewayState;
use crate::worker_link::{self, run_worker_link, WorkerPeer};

/// Public endpoint: one client editing session per socket.
pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state))
}

async fn handle_client_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let session_id = state.next_session_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let shutdown = Arc::new(Notify::new());

    let writer_id = session_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(session = %writer_id, "client writer finished");
    });

    let mut session = ClientSession::new(
        session_id.clone(),
        state.config.clone(),
        state.matchmaker.clone(),
        state.broker.clone(),
        tx,
        shutdown.clone(),
    );

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!(session = %session_id, "session shut down from the worker side");
                break;
            }
            next = receiver.next() => {
                let Some(Ok(message)) = next else { break };
                let frame = match message {
                    Message::Text(text) => Frame::Text(text),
                    Message::Binary(data) => Frame::Binary(data),
                    Message::Close(_) => break,
                    _ => continue,
                };
                if session.handle_frame(frame).await == SessionFlow::Close {
                    break;
                }
            }
        }
    }

    session.disconnect();
    info!(session = %session_id, "client socket closed");
}

/// Loopback endpoint: a worker dialling back for one session. The first
/// frame must be the `child` hello; the link is then deposited with the
/// matchmaker for the client half to claim.
pub async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, session_id, state))
}

async fn handle_worker_socket(socket: WebSocket, path_id: String, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let hello = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(data))) => {
                break String::from_utf8_lossy(&data).into_owned()
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let Some((jail_id, session_id, pid)) = worker_link::parse_child_hello(&hello) else {
        warn!(hello = %hello, "malformed child hello");
        let _ = tx.send(Frame::Text(error_frame("child", ErrorKind::Syntax)));
        return;
    };
    if session_id != path_id {
        // the frame is authoritative, the path is just routing
        warn!(path = %path_id, frame = %session_id, "child hello id mismatch");
    }
    info!(session = %session_id, jail = %jail_id, pid, "worker dialled in");

    let link = worker_link::WorkerLink::new();
    state.matchmaker.offer(
        &session_id,
        WorkerPeer {
            jail_id,
            pid,
            tx,
            link: link.clone(),
        },
    );

    // pump socket frames into the link's snooping relay
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(next) = receiver.next().await {
            let forwarded = match next {
                Ok(Message::Text(text)) => in_tx.send(Frame::Text(text)),
                Ok(Message::Binary(data)) => in_tx.send(Frame::Binary(data)),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => Ok(()),
            };
            if forwarded.is_err() {
                break;
            }
        }
    });

    run_worker_link(in_rx, link, state.termination.clone()).await;
    if state.termination.is_abnormal() {
        error!(session = %session_id, "worker link ended abnormally");
    }
}
