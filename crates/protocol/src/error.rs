use std::fmt;

/// Error kinds surfaced to clients in `error:` frames. The channel stays
/// open for all of them except `BadVersion`, which is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadVersion,
    Syntax,
    Invalid,
    Unknown,
    NoDocLoaded,
    DocAlreadyLoaded,
    UriInvalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadVersion => "badversion",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unknown => "unknown",
            ErrorKind::NoDocLoaded => "nodocloaded",
            ErrorKind::DocAlreadyLoaded => "docalreadyloaded",
            ErrorKind::UriInvalid => "uriinvalid",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats the single text frame reported to clients for a failed command.
pub fn error_frame(cmd: &str, kind: ErrorKind) -> String {
    format!("error: cmd={} kind={}", cmd, kind)
}
