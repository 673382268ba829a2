use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::worker_link::WorkerPeer;

enum Slot {
    /// A client session is waiting for its worker half.
    Waiting(oneshot::Sender<WorkerPeer>),
    /// The worker half arrived first.
    Ready(WorkerPeer),
}

/// The rendezvous between the two halves of a session. Each pending
/// session id holds a one-shot promise completed when the worker's
/// dial-back connection arrives; whichever side shows up first parks
/// here.
#[derive(Default)]
pub struct Matchmaker {
    slots: DashMap<String, Slot>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Matchmaker::default()
    }

    /// Deposits a worker half. Completes the waiting claim if there is
    /// one, otherwise parks the peer for the claimant to find.
    pub fn offer(&self, session_id: &str, peer: WorkerPeer) {
        match self.slots.remove(session_id) {
            Some((_, Slot::Waiting(promise))) => {
                debug!(session = session_id, "worker half matched a waiting client");
                if let Err(peer) = promise.send(peer) {
                    // claimant timed out a moment ago; park for a retry
                    self.slots.insert(session_id.to_string(), Slot::Ready(peer));
                }
            }
            Some((_, Slot::Ready(previous))) => {
                warn!(
                    session = session_id,
                    pid = previous.pid,
                    "replacing unclaimed worker half"
                );
                self.slots
                    .insert(session_id.to_string(), Slot::Ready(peer));
            }
            None => {
                debug!(session = session_id, "worker half parked");
                self.slots
                    .insert(session_id.to_string(), Slot::Ready(peer));
            }
        }
    }

    /// One bounded attempt to obtain the worker half. The caller owns
    /// the retry policy (republish the broker request between attempts).
    pub async fn claim(&self, session_id: &str, wait: Duration) -> Option<WorkerPeer> {
        let receiver = {
            match self.slots.remove(session_id) {
                Some((_, Slot::Ready(peer))) => return Some(peer),
                Some((_, Slot::Waiting(_))) => {
                    warn!(session = session_id, "duplicate claim for session");
                    return None;
                }
                None => {
                    let (promise, receiver) = oneshot::channel();
                    self.slots
                        .insert(session_id.to_string(), Slot::Waiting(promise));
                    receiver
                }
            }
        };

        match timeout(wait, receiver).await {
            Ok(Ok(peer)) => Some(peer),
            _ => {
                // leave no stale promise behind
                if let Some((_, Slot::Ready(peer))) = self.slots.remove(session_id) {
                    return Some(peer);
                }
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_link::WorkerLink;
    use tokio::sync::mpsc;

    fn peer(pid: u32) -> WorkerPeer {
        let (tx, _rx) = mpsc::unbounded_channel();
        WorkerPeer {
            jail_id: "jail".into(),
            pid,
            tx,
            link: WorkerLink::new(),
        }
    }

    #[tokio::test]
    async fn offer_then_claim() {
        let matchmaker = Matchmaker::new();
        matchmaker.offer("0001", peer(42));
        let claimed = matchmaker
            .claim("0001", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(claimed.pid, 42);
        assert_eq!(matchmaker.pending(), 0);
    }

    #[tokio::test]
    async fn claim_then_offer() {
        let matchmaker = std::sync::Arc::new(Matchmaker::new());
        let claimer = {
            let matchmaker = matchmaker.clone();
            tokio::spawn(async move { matchmaker.claim("0002", Duration::from_secs(2)).await })
        };
        tokio::task::yield_now().await;
        matchmaker.offer("0002", peer(7));
        let claimed = claimer.await.unwrap().unwrap();
        assert_eq!(claimed.pid, 7);
    }

    #[tokio::test]
    async fn claim_times_out_clean() {
        let matchmaker = Matchmaker::new();
        let missing = matchmaker.claim("0003", Duration::from_millis(20)).await;
        assert!(missing.is_none());
        // a late offer is parked for the retry attempt
        matchmaker.offer("0003", peer(9));
        let retried = matchmaker
            .claim("0003", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(retried.pid, 9);
    }
}
