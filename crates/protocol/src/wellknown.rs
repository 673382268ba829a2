//! Well-known endpoints and filesystem locations shared by the three
//! processes.

/// Gateway path prefix workers dial back on; the session id follows.
pub const CHILD_WS_PATH: &str = "/loolws/child/";

/// Public WebSocket path clients connect to.
pub const CLIENT_WS_PATH: &str = "/loolws";

/// The shared broker reply FIFO, as seen from inside a jail. The broker
/// hard-links the real FIFO to this path in every jail it builds.
pub const BROKER_REPLY_FIFO: &str = "/tmp/docbridge-broker.fifo";

/// Per-worker inbound request pipe, as seen from inside the jail.
pub const WORKER_REQUEST_PIPE: &str = "/pipe";

/// Default location of the gateway-to-broker request FIFO.
pub const BROKER_REQUEST_FIFO: &str = "/tmp/docbridge-request.fifo";

/// Formats a numeric session counter as a session id. The hex suffix
/// keeps ids opaque to clients while letting the worker hash them fast.
pub fn encode_session_id(value: u32) -> String {
    format!("{:04x}", value)
}

/// Recovers a small index from a session id for table keying. Falls back
/// to an FNV hash for ids minted elsewhere.
pub fn session_index(id: &str) -> u32 {
    u32::from_str_radix(id, 16).unwrap_or_else(|_| {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in id.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        assert_eq!(session_index(&encode_session_id(7)), 7);
        assert_eq!(session_index(&encode_session_id(0xbeef)), 0xbeef);
    }

    #[test]
    fn non_hex_ids_still_index() {
        let a = session_index("session-one");
        let b = session_index("session-two");
        assert_ne!(a, b);
    }
}
