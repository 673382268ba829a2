use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Sentinel returned by [`MessageQueue::get`] once the queue is closed.
pub const QUEUE_EOF: &str = "eof";

/// Commands queued beyond this block the producer until the consumer
/// catches up.
const QUEUE_CAPACITY: usize = 512;

/// A command taken off a client socket, tagged with the session it
/// belongs to so the document consumer can answer on the right channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub session_id: String,
    pub payload: String,
}

impl QueuedMessage {
    pub fn is_eof(&self) -> bool {
        self.payload == QUEUE_EOF
    }
}

struct Inner {
    items: VecDeque<QueuedMessage>,
    closed: bool,
}

/// The per-document command queue. Producers are the session receive
/// loops; the single consumer drives the engine, so document operations
/// are strictly serialised.
///
/// Redundant tile requests are coalesced on `put`: a queued, unsent
/// request identical to the incoming one is dropped. Together with the
/// capacity bound this is the backpressure valve for clients scrolling
/// faster than the engine renders.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Appends a message, blocking while the queue is full. Puts on a
    /// closed queue are dropped.
    pub async fn put(&self, message: QueuedMessage) {
        loop {
            let wait = self.writable.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return;
                }
                if is_tile_request(&message.payload) {
                    inner.items.retain(|queued| *queued != message);
                }
                if inner.items.len() < QUEUE_CAPACITY {
                    inner.items.push_back(message);
                    self.readable.notify_one();
                    return;
                }
            }
            wait.await;
        }
    }

    /// Blocks until a message is available. A closed queue yields the
    /// `eof` sentinel with an empty session id.
    pub async fn get(&self) -> QueuedMessage {
        loop {
            let wait = self.readable.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(message) = inner.items.pop_front() {
                    self.writable.notify_one();
                    return message;
                }
                if inner.closed {
                    return QueuedMessage {
                        session_id: String::new(),
                        payload: QUEUE_EOF.to_string(),
                    };
                }
            }
            wait.await;
        }
    }

    /// Drops queued tile requests for one session; used by `canceltiles`
    /// when the client scrolled away.
    pub fn purge_tile_requests(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .items
            .retain(|queued| queued.session_id != session_id || !is_tile_request(&queued.payload));
        self.writable.notify_one();
    }

    /// Drops everything queued for one session, at teardown.
    pub fn purge_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.retain(|queued| queued.session_id != session_id);
        self.writable.notify_one();
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        MessageQueue::new()
    }
}

fn is_tile_request(payload: &str) -> bool {
    payload.starts_with("tile ") || payload.starts_with("tilecombine ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(session: &str, payload: &str) -> QueuedMessage {
        QueuedMessage {
            session_id: session.to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let queue = MessageQueue::new();
        queue.put(message("a", "status")).await;
        queue.put(message("a", "uno .uno:Bold")).await;
        assert_eq!(queue.get().await.payload, "status");
        assert_eq!(queue.get().await.payload, "uno .uno:Bold");
    }

    #[tokio::test]
    async fn identical_tile_requests_coalesce() {
        let queue = MessageQueue::new();
        let tile = "tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
        for _ in 0..5 {
            queue.put(message("a", tile)).await;
        }
        assert_eq!(queue.len(), 1);

        // a different key is kept
        queue
            .put(message(
                "a",
                "tile part=0 width=256 height=256 tileposx=3840 tileposy=0 tilewidth=3840 tileheight=3840",
            ))
            .await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn same_tile_for_other_session_is_kept() {
        let queue = MessageQueue::new();
        let tile = "tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
        queue.put(message("a", tile)).await;
        queue.put(message("b", tile)).await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn close_wakes_getter_with_eof() {
        let queue = std::sync::Arc::new(MessageQueue::new());
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        let got = getter.await.unwrap();
        assert!(got.is_eof());

        // puts after close are dropped
        queue.put(message("a", "status")).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_blocks_put_until_get() {
        let queue = std::sync::Arc::new(MessageQueue::new());
        for index in 0..QUEUE_CAPACITY {
            queue.put(message("a", &format!("key type=input char={} key=0", index))).await;
        }
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(message("a", "status")).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        let _ = queue.get().await;
        producer.await.unwrap();
        assert_eq!(queue.len(), QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn purge_drops_only_tile_requests() {
        let queue = MessageQueue::new();
        queue
            .put(message(
                "a",
                "tile part=0 width=1 height=1 tileposx=0 tileposy=0 tilewidth=1 tileheight=1",
            ))
            .await;
        queue.put(message("a", "uno .uno:Bold")).await;
        queue
            .put(message(
                "b",
                "tilecombine part=0 width=1 height=1 tileposx=0 tileposy=0 tilewidth=1 tileheight=1",
            ))
            .await;
        queue.purge_tile_requests("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.payload, "uno .uno:Bold");
    }
}
