use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use docbridge_protocol::{wellknown, Frame};

/// Dials the gateway's internal loopback listener for one session and
/// pumps the socket through a pair of channels. The returned sender
/// feeds the socket; the receiver yields inbound frames and ends when
/// the socket closes.
pub async fn dial_gateway(
    client_port: u16,
    session_id: &str,
) -> Result<(mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>)> {
    let url = format!(
        "ws://127.0.0.1:{}{}{}",
        client_port,
        wellknown::CHILD_WS_PATH,
        session_id
    );
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("dialling gateway at {}", url))?;
    let (mut sink, mut source) = stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let id = session_id.to_string();
    tokio::spawn(async move {
        while let Some(next) = source.next().await {
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
        debug!(session = %id, "gateway socket reader finished");
    });

    Ok((out_tx, in_rx))
}
