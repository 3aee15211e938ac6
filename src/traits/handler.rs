//! The handler contract: nine lifecycle callbacks with provided defaults.
//!
//! A [`Handler`] owns the per-connection application state. The session
//! drives it single-threadedly: every callback runs on the session task,
//! receives `&mut self`, and answers with a [`Reply`] (or one of the
//! lifecycle decisions) that the session acts on before touching the
//! mailbox again.

use std::fmt;

use async_trait::async_trait;

use crate::core::conn::Conn;
use crate::frame::{CloseFrame, Frame};
use crate::traits::error::{ConnError, Error};

/// A whole data message, delivered to [`Handler::handle_frame`] after any
/// fragments have been reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Get the message as text, if it is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }

    /// Get the message as binary, if it is binary
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Message::Text(_) => None,
            Message::Binary(b) => Some(b),
        }
    }

    /// Check if message is text
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if message is binary
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }
}

/// Which side started the closing handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Why the connection ended, as seen by [`Handler::handle_disconnect`]
#[derive(Debug)]
pub enum CloseReason {
    /// A close without a code, or with code 1000 and no reason text
    Normal(Initiator),

    /// A close carrying a code (and possibly a reason string)
    WithCode {
        initiator: Initiator,
        code: u16,
        reason: String,
    },

    /// The TCP connection went away without a prior CLOSE frame
    Dropped,

    /// The transport failed mid-connection
    Fault(ConnError),
}

impl CloseReason {
    /// Whether the session should report a clean exit for this reason.
    ///
    /// Clean exits are the codeless/1000 closes from either side and the
    /// bare TCP drop; everything else (non-1000 codes, transport faults)
    /// is surfaced through [`SessionHandle::join`](crate::SessionHandle::join)
    /// as an error.
    pub fn is_normal(&self) -> bool {
        match self {
            CloseReason::Normal(_) => true,
            CloseReason::WithCode { code, .. } => *code == 1000,
            CloseReason::Dropped => true,
            CloseReason::Fault(_) => false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal(Initiator::Local) => write!(f, "closed normally (local)"),
            CloseReason::Normal(Initiator::Remote) => write!(f, "closed normally (remote)"),
            CloseReason::WithCode {
                initiator,
                code,
                reason,
            } => {
                let side = match initiator {
                    Initiator::Local => "local",
                    Initiator::Remote => "remote",
                };
                if reason.is_empty() {
                    write!(f, "closed with code {code} ({side})")
                } else {
                    write!(f, "closed with code {code} ({side}): {reason}")
                }
            }
            CloseReason::Dropped => write!(f, "tcp connection dropped without a close frame"),
            CloseReason::Fault(err) => write!(f, "transport fault: {err}"),
        }
    }
}

/// What [`Handler::on_terminate`] is told before the session task exits
#[derive(Debug)]
pub enum TerminateReason {
    /// The connection ran its close handshake (cleanly or not)
    Closed(CloseReason),

    /// The session died on an error: connect gave up, a handler
    /// panicked, or a reply could not be acted on
    Failed(Error),
}

/// One connection attempt that did not produce an open connection,
/// passed to [`Handler::handle_connect_failure`]
#[derive(Debug)]
pub struct ConnectFailure<'a> {
    /// What went wrong
    pub error: &'a Error,
    /// 1-based attempt counter for the current connect cycle
    pub attempt: u32,
    /// The connection the attempt used
    pub conn: &'a Conn,
}

/// Answer from the frame/cast/info/ping/pong callbacks
#[derive(Debug)]
pub enum Reply {
    /// Keep going
    Continue,
    /// Put a frame on the wire before processing anything else
    Send(Frame),
    /// Start the closing handshake; `None` closes without a code
    Close(Option<CloseFrame>),
}

/// Answer from [`Handler::handle_disconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDisconnect {
    /// Terminate the session
    Stop,
    /// Reconnect with the same connection settings
    Reconnect,
}

/// Answer from [`Handler::handle_connect_failure`]
#[derive(Debug)]
pub enum OnConnectFailure {
    /// Give up; the error becomes the termination reason
    Stop,
    /// Try again with the same connection settings
    Retry,
    /// Try again with a replacement connection
    RetryWith(Box<Conn>),
}

/// Per-connection application logic.
///
/// Only [`handle_frame`](Handler::handle_frame) must be written; every
/// other callback has a sensible default. The defaults answer pings with
/// matching pongs, log unexpected info messages, decline to reconnect,
/// and do nothing on termination.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Messages accepted by [`handle_cast`](Handler::handle_cast)
    type Cast: Send + 'static;

    /// Messages accepted by [`handle_info`](Handler::handle_info)
    type Info: Send + fmt::Debug + 'static;

    /// Called once the handshake has completed, before any frame is
    /// dispatched. A `Reply::Send` here is the place for subscription
    /// messages.
    async fn on_connect(&mut self, _conn: &Conn) -> Reply {
        Reply::Continue
    }

    /// Called for every complete text or binary message.
    async fn handle_frame(&mut self, msg: Message) -> Reply;

    /// Called for messages submitted through
    /// [`SessionHandle::cast`](crate::SessionHandle::cast).
    ///
    /// The default panics: sending casts to a handler that does not
    /// implement this is a programming error, and the panic terminates
    /// the session like any other handler panic.
    async fn handle_cast(&mut self, _msg: Self::Cast) -> Reply {
        panic!("received a cast but no handle_cast implementation");
    }

    /// Called for messages submitted through
    /// [`SessionHandle::notify`](crate::SessionHandle::notify).
    async fn handle_info(&mut self, msg: Self::Info) -> Reply {
        tracing::warn!(?msg, "unhandled info message");
        Reply::Continue
    }

    /// Called for every inbound ping. The default replies with a pong
    /// carrying the same payload.
    async fn handle_ping(&mut self, payload: Option<Vec<u8>>) -> Reply {
        Reply::Send(Frame::Pong(payload))
    }

    /// Called for every inbound pong.
    async fn handle_pong(&mut self, _payload: Option<Vec<u8>>) -> Reply {
        Reply::Continue
    }

    /// Called after the connection has closed, before the session
    /// terminates. Returning [`OnDisconnect::Reconnect`] re-enters the
    /// connect cycle with a fresh attempt counter.
    async fn handle_disconnect(&mut self, _reason: &CloseReason) -> OnDisconnect {
        OnDisconnect::Stop
    }

    /// Called when a connection attempt fails. Returning
    /// [`OnConnectFailure::Retry`] (or `RetryWith`) re-attempts with an
    /// incremented attempt counter; the default gives up.
    async fn handle_connect_failure(&mut self, _failure: ConnectFailure<'_>) -> OnConnectFailure {
        OnConnectFailure::Stop
    }

    /// Last callback before the session task exits, on every exit path.
    async fn on_terminate(&mut self, _reason: &TerminateReason) {}
}
