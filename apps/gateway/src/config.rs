use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide settings, established once at startup and passed to the
/// components that need them. Nothing here mutates after boot; the only
/// runtime observable is [`TerminationFlag`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Public WebSocket port clients connect to.
    pub public_port: u16,
    /// Loopback port the workers dial back on.
    pub internal_port: u16,
    /// Directory the broker builds jails under.
    pub child_root: PathBuf,
    /// Root of the per-document tile caches.
    pub cache_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            public_port: 9980,
            internal_port: 9982,
            child_root: PathBuf::from("/var/cache/docbridge/jails"),
            cache_root: PathBuf::from("/var/cache/docbridge/tiles"),
        }
    }
}

/// How the gateway is going down. Abnormal termination (a worker died
/// under us) makes teardown paths force-shutdown receive sides instead
/// of waiting for goodbyes.
#[derive(Debug, Default)]
pub struct TerminationFlag {
    abnormal: AtomicBool,
}

impl TerminationFlag {
    pub fn set_abnormal(&self) {
        self.abnormal.store(true, Ordering::SeqCst);
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal.load(Ordering::SeqCst)
    }
}
