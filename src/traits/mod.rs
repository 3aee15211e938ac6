//! Core traits and types for the limpet WebSocket client.

pub mod error;
pub mod handler;

pub use error::{ConnError, EncodeError, Error, ParseError, Result, UrlError};
pub use handler::{
    CloseReason, ConnectFailure, Handler, Initiator, Message, OnConnectFailure, OnDisconnect,
    Reply, TerminateReason,
};
