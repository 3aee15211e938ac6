//! # limpet
//!
//! A persistent WebSocket client. A limpet clings to its rock: each
//! session negotiates an RFC 6455 connection, feeds every frame and
//! lifecycle event to a user [`Handler`], and — when the handler says so
//! — clings back on after a lost connection or a failed attempt.
//!
//! ## Features
//!
//! - **Own frame codec**: masked client frames, fragmentation,
//!   incremental parsing with a configurable size ceiling
//! - **Handler callbacks**: nine lifecycle callbacks with sensible
//!   defaults; only `handle_frame` must be written
//! - **Reconnection**: `handle_disconnect` / `handle_connect_failure`
//!   decide whether and where to reconnect
//! - **One task per session**: no locks, no shared sockets; casts and
//!   pre-encoded sends flow through the session mailbox
//!
//! ## Example
//!
//! ```rust,ignore
//! use limpet::{start, Handler, Message, Options, Reply};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     type Cast = String;
//!     type Info = ();
//!
//!     async fn handle_frame(&mut self, msg: Message) -> Reply {
//!         println!("received: {msg:?}");
//!         Reply::Continue
//!     }
//!
//!     async fn handle_cast(&mut self, msg: String) -> Reply {
//!         Reply::Send(limpet::Frame::text(msg))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> limpet::Result<()> {
//!     let session = start("wss://echo.example.com/ws", Echo, Options::default()).await?;
//!     session.cast("hello".to_string())?;
//!     session.join().await
//! }
//! ```

pub mod core;
pub mod frame;
pub mod traits;

pub use crate::core::{start, start_link, Conn, Options, SessionHandle};
pub use crate::frame::{CloseFrame, Frame, MessageKind};
pub use crate::traits::{
    CloseReason, ConnError, ConnectFailure, EncodeError, Error, Handler, Initiator, Message,
    OnConnectFailure, OnDisconnect, ParseError, Reply, Result, TerminateReason, UrlError,
};
