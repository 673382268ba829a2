use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use docbridge_protocol::encode_session_id;

use crate::broker::SessionBroker;
use crate::config::{RuntimeConfig, TerminationFlag};
use crate::matchmaker::Matchmaker;

/// Everything the WebSocket handlers need, established at startup.
pub struct GatewayState {
    pub config: Arc<RuntimeConfig>,
    pub matchmaker: Arc<Matchmaker>,
    pub broker: Arc<dyn SessionBroker>,
    pub termination: Arc<TerminationFlag>,
    next_session: AtomicU32,
}

impl GatewayState {
    pub fn new(config: RuntimeConfig, broker: Arc<dyn SessionBroker>) -> Arc<Self> {
        Arc::new(GatewayState {
            config: Arc::new(config),
            matchmaker: Arc::new(Matchmaker::new()),
            broker,
            termination: Arc::new(TerminationFlag::default()),
            next_session: AtomicU32::new(1),
        })
    }

    pub fn next_session_id(&self) -> String {
        encode_session_id(self.next_session.fetch_add(1, Ordering::SeqCst))
    }
}
