use std::fmt;

/// Crate-wide error type.
///
/// Variants line up with the error taxonomy of the wire protocol: framing
/// and handshake errors are fatal to a connection, resolution/invocation
/// errors are carried in a response `Header.error` string, and timeout/
/// shutdown errors are surfaced to a single pending call.
#[derive(Debug)]
pub enum Error {
    /// The underlying stream failed, or a frame was truncated mid-read.
    Io(std::io::Error),
    /// A value could not be encoded into the wire codec.
    Encode(String),
    /// A value could not be decoded from the wire codec.
    Decode(String),
    /// Option handshake failed: bad magic, unknown codec, malformed JSON.
    Handshake(String),
    /// `service_method` did not resolve to a registered method.
    Resolution(String),
    /// The handler returned an error.
    Invocation(String),
    /// A deadline (connect or handle) was exceeded.
    Timeout(String),
    /// The client is closing, or has already shut down.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Encode(s) => write!(f, "encode error: {}", s),
            Error::Decode(s) => write!(f, "decode error: {}", s),
            Error::Handshake(s) => write!(f, "handshake error: {}", s),
            Error::Resolution(s) => write!(f, "{}", s),
            Error::Invocation(s) => write!(f, "{}", s),
            Error::Timeout(s) => write!(f, "{}", s),
            Error::Shutdown => write!(f, "connection is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Handshake(err.to_string())
    }
}

/// Turns a server-reported error string back into an `Error::Invocation`
/// (or a more specific variant when the message matches a known shape).
/// Used by the client when a response `Header.error` is non-empty.
pub(crate) fn from_response_error(message: String) -> Error {
    if message.contains("timeout") {
        Error::Timeout(message)
    } else if message.contains("can't find") || message.contains("ill-formed") {
        Error::Resolution(message)
    } else {
        Error::Invocation(message)
    }
}
