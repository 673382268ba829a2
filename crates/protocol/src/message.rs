use crate::tokens::{first_line, first_line_bytes, token_int, Tokens};

/// Payloads larger than this are preceded by a `nextmessage:` prelude so
/// the receiver can size its next read.
pub const SMALL_MESSAGE_SIZE: usize = 1024;

/// A single WebSocket payload as it travels between session halves. Text
/// frames carry commands and status lines; binary frames carry an ASCII
/// header line followed by tile bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn first_line(&self) -> &str {
        match self {
            Frame::Text(text) => first_line(text),
            Frame::Binary(data) => first_line_bytes(data),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }
}

/// Builds the out-of-band prelude announcing a large follow-up frame.
pub fn nextmessage_prelude(size: usize) -> String {
    format!("nextmessage: size={}", size)
}

/// Recognises a `nextmessage: size=N` prelude and returns N.
pub fn parse_nextmessage(line: &str) -> Option<usize> {
    let tokens = Tokens::parse(line);
    if tokens.count() == 2 && tokens.name() == "nextmessage:" {
        let size = token_int(tokens.get(1)?, "size")?;
        if size > 0 {
            return Some(size as usize);
        }
    }
    None
}

/// Shortens a message for logging: first line only, truncated.
pub fn abbreviate(text: &str) -> String {
    const MAX: usize = 50;
    let line = first_line(text);
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut end = MAX;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_round_trip() {
        assert_eq!(parse_nextmessage(&nextmessage_prelude(4096)), Some(4096));
        assert_eq!(parse_nextmessage("nextmessage: size=0"), None);
        assert_eq!(parse_nextmessage("nextmessage: size=x"), None);
        assert_eq!(parse_nextmessage("tile part=0"), None);
    }

    #[test]
    fn frame_first_line() {
        let text = Frame::Text("status: type=text\nextra".into());
        assert_eq!(text.first_line(), "status: type=text");

        let mut data = b"tile: part=0 width=256\n".to_vec();
        data.extend_from_slice(&[0x89, b'P', b'N', b'G']);
        let binary = Frame::Binary(data);
        assert_eq!(binary.first_line(), "tile: part=0 width=256");
    }

    #[test]
    fn abbreviate_truncates_long_lines() {
        let long = "paste mimetype=text/plain ".repeat(10);
        let short = abbreviate(&long);
        assert!(short.len() <= 53);
        assert!(short.ends_with("..."));
        assert_eq!(abbreviate("uno .uno:Save"), "uno .uno:Save");
    }
}
