use std::time::Duration;
use thiserror::Error;

use crate::traits::handler::CloseReason;

/// Main error type for limpet
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unsupported WebSocket URL
    #[error("invalid websocket url: {0}")]
    Url(#[from] UrlError),

    /// Transport-level failure (refused, reset, timed out)
    #[error("connection failed: {0}")]
    Conn(#[from] ConnError),

    /// Server answered the upgrade request with a non-101 status
    #[error("server rejected the upgrade with status {code}")]
    Request {
        code: u16,
        headers: Vec<(String, String)>,
    },

    /// Server answered 101 but the upgrade headers or the
    /// Sec-WebSocket-Accept challenge did not check out
    #[error("upgrade handshake failed (expected challenge {challenge:?})")]
    Handshake { response: String, challenge: String },

    /// Outbound frame violated the codec rules
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Inbound bytes violated the framing rules
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A handler callback replied with something the session cannot act
    /// on, e.g. a frame the codec refuses to encode
    #[error("unusable reply from {callback}: {detail}")]
    BadResponse {
        callback: &'static str,
        detail: String,
    },

    /// A handler callback panicked; the panic payload becomes the
    /// termination reason
    #[error("handler panicked in {callback}: {message}")]
    HandlerPanic {
        callback: &'static str,
        message: String,
    },

    /// The session terminated with a close reason other than a normal
    /// close
    #[error("connection closed: {0}")]
    AbnormalClose(CloseReason),

    /// The session is no longer running
    #[error("session is no longer running")]
    SessionGone,
}

/// URL validation errors
#[derive(Error, Debug)]
pub enum UrlError {
    #[error("unparseable url: {0}")]
    Parse(#[from] url::ParseError),

    #[error("scheme must be \"ws\" or \"wss\", got {0:?}")]
    UnsupportedScheme(String),

    #[error("url has no host")]
    MissingHost,

    #[error("url has no port and the scheme does not imply one")]
    MissingPort,
}

/// Transport errors, carrying the underlying cause
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("host is not a valid tls server name")]
    ServerName,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("socket already closed")]
    Closed,
}

impl ConnError {
    /// Whether this error means the peer is simply gone, as opposed to a
    /// genuine fault. A send failure on a dead socket is reported as a
    /// remote disconnect, not an error.
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            ConnError::Closed => true,
            ConnError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Frame encoding errors, returned synchronously to the caller
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("text payload is not valid utf-8")]
    InvalidUtf8,

    #[error("close code {0} is outside 1000..=4999")]
    InvalidCloseCode(u16),

    #[error("control payload of {0} bytes exceeds the 125-byte limit")]
    PayloadTooLarge(usize),
}

/// Frame parsing errors; each one fail-closes the connection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("reserved bits must be zero")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    BadOpcode(u8),

    #[error("server frames must arrive unmasked")]
    UnmaskedRequired,

    #[error("control frames cannot be fragmented")]
    FragmentedControl,

    #[error("control payload of {0} bytes exceeds the 125-byte limit")]
    ControlPayloadTooLarge(u64),

    #[error("close frame carries a truncated close code")]
    TruncatedCloseCode,

    #[error("frame payload of {len} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { len: u64, limit: u64 },
}

impl ParseError {
    /// The close code sent to the peer when this violation is detected.
    pub(crate) fn close_code(&self) -> u16 {
        match self {
            ParseError::PayloadTooLarge { .. } => 1009,
            _ => 1002,
        }
    }
}

/// Result type for limpet operations
pub type Result<T> = std::result::Result<T, Error>;
