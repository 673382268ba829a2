pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;
pub const PROTOCOL_PATCH: u32 = 0;

/// The full version string sent in the `loolserver` reply.
pub fn protocol_version() -> String {
    format!("{}.{}.{}", PROTOCOL_MAJOR, PROTOCOL_MINOR, PROTOCOL_PATCH)
}

/// Parses a `major.minor` version as sent by `loolclient`. A trailing
/// patch component is tolerated and ignored.
pub fn parse_version(text: &str) -> Option<(u32, u32)> {
    let mut parts = text.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// True when the client's advertised version is compatible: major and
/// minor must both match.
pub fn handshake_matches(text: &str) -> bool {
    parse_version(text) == Some((PROTOCOL_MAJOR, PROTOCOL_MINOR))
}
