/// Returns the first line of a message, without the trailing newline.
pub fn first_line(text: &str) -> &str {
    match text.find('\n') {
        Some(pos) => &text[..pos],
        None => text,
    }
}

/// First line of a possibly-binary payload. Non-UTF8 bytes end the line
/// early, which is fine for the ASCII headers the protocol uses.
pub fn first_line_bytes(data: &[u8]) -> &str {
    let line = match data.iter().position(|&b| b == b'\n') {
        Some(pos) => &data[..pos],
        None => data,
    };
    match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(err) => std::str::from_utf8(&line[..err.valid_up_to()]).unwrap_or(""),
    }
}

/// Parses a `key=value` token, returning the value when the key matches.
pub fn token_string<'a>(token: &'a str, key: &str) -> Option<&'a str> {
    let rest = token.strip_prefix(key)?;
    rest.strip_prefix('=')
}

/// Parses a `key=value` token into an integer.
pub fn token_int(token: &str, key: &str) -> Option<i32> {
    token_string(token, key)?.parse().ok()
}

/// A whitespace-tokenised command line. Empty tokens are dropped, so
/// repeated separators are harmless.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    items: Vec<&'a str>,
}

impl<'a> Tokens<'a> {
    pub fn parse(line: &'a str) -> Self {
        Self {
            items: line.split_whitespace().collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, idx: usize) -> Option<&'a str> {
        self.items.get(idx).copied()
    }

    /// The command name, i.e. the first token. Empty for a blank line.
    pub fn name(&self) -> &'a str {
        self.items.first().copied().unwrap_or("")
    }

    pub fn int(&self, idx: usize, key: &str) -> Option<i32> {
        token_int(self.get(idx)?, key)
    }

    pub fn string(&self, idx: usize, key: &str) -> Option<&'a str> {
        token_string(self.get(idx)?, key)
    }

    /// Looks a key up in any position. Commands with optional parameters
    /// do not guarantee ordering.
    pub fn find_string(&self, key: &str) -> Option<&'a str> {
        self.items.iter().find_map(|tok| token_string(tok, key))
    }

    pub fn find_int(&self, key: &str) -> Option<i32> {
        self.items.iter().find_map(|tok| token_int(tok, key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.items.iter().copied()
    }

    /// Rebuilds the tail of the line starting at `idx`, single-space
    /// separated.
    pub fn join_from(&self, idx: usize) -> String {
        self.items[idx.min(self.items.len())..].join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_indexes() {
        let tokens = Tokens::parse("tile part=0  width=256 height=256");
        assert_eq!(tokens.count(), 4);
        assert_eq!(tokens.name(), "tile");
        assert_eq!(tokens.int(1, "part"), Some(0));
        assert_eq!(tokens.int(2, "width"), Some(256));
        assert_eq!(tokens.int(2, "height"), None);
    }

    #[test]
    fn key_must_match_exactly() {
        assert_eq!(token_string("url=file:///a.odt", "url"), Some("file:///a.odt"));
        assert_eq!(token_string("xurl=file:///a.odt", "url"), None);
        assert_eq!(token_int("part=abc", "part"), None);
    }

    #[test]
    fn first_line_stops_at_newline() {
        assert_eq!(first_line("status: ok\nrest"), "status: ok");
        assert_eq!(first_line("no newline"), "no newline");
        assert_eq!(first_line_bytes(b"tile: part=0\n\x89PNG"), "tile: part=0");
    }

    #[test]
    fn join_from_rebuilds_tail() {
        let tokens = Tokens::parse("renderfont font=Liberation Serif");
        assert_eq!(tokens.join_from(1), "font=Liberation Serif");
        assert_eq!(tokens.join_from(9), "");
    }
}
