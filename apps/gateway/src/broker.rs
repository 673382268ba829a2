use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tracing::trace;

/// The gateway's view of the broker: publish a session request and let
/// the worker half arrive through the matchmaker. Tests swap in an
/// in-process implementation.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    async fn request_session(&self, session_id: &str, url: &str) -> Result<()>;
}

/// Production implementation writing `request` lines into the broker's
/// FIFO.
pub struct PipeBroker {
    sender: Mutex<pipe::Sender>,
}

impl PipeBroker {
    /// Opens the write end of the broker request FIFO. The broker
    /// creates the FIFO and holds the read end; during startup both
    /// sides race, so retry for a while.
    pub async fn open(path: &Path) -> Result<Self> {
        for _ in 0..100 {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(sender) => {
                    return Ok(PipeBroker {
                        sender: Mutex::new(sender),
                    })
                }
                Err(err)
                    if err.raw_os_error() == Some(libc::ENXIO)
                        || err.kind() == std::io::ErrorKind::NotFound =>
                {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("opening broker pipe {}", path.display()))
                }
            }
        }
        bail!("broker pipe {} never appeared", path.display());
    }
}

#[async_trait]
impl SessionBroker for PipeBroker {
    async fn request_session(&self, session_id: &str, url: &str) -> Result<()> {
        let message = format!("request {} {}\r\n", session_id, url);
        trace!(to_broker = %message.trim_end(), "publishing session request");
        self.sender
            .lock()
            .await
            .write_all(message.as_bytes())
            .await
            .context("writing broker request pipe")?;
        Ok(())
    }
}
