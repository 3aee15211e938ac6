//! The per-connection session: state machine plus dispatcher.
//!
//! # Architecture
//!
//! Each session is one tokio task owning the connection, the handler,
//! the inbound buffer and the mailbox. Nothing else touches the socket.
//!
//! ```text
//!              ┌──────────────────────────────────────────────┐
//!              │                Session task                  │
//! socket ────> │ buffer ─> frame parser ─> reassembler ─┐     │
//!              │                                        ▼     │
//! cast ──────> │ mailbox ─────────────────────────> handler   │
//! send_frame ─>│   (pre-encoded bytes)                  │     │
//!              │                                        ▼     │
//! socket <──── │ <──────────────── reply encode ── state step │
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! The lifecycle walks Connecting → Open → Closing → Disconnect →
//! Terminated, re-entering Connecting when the handler elects to
//! reconnect after a lost connection or a failed attempt.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::config::Options;
use crate::core::conn::Conn;
use crate::core::handshake;
use crate::core::reassembly::{self, Reassembler, Violation};
use crate::frame::{self, CloseFrame, Frame, MessageKind};
use crate::traits::error::{ConnError, Error, Result};
use crate::traits::handler::{
    CloseReason, ConnectFailure, Handler, Initiator, Message, OnConnectFailure, OnDisconnect,
    Reply, TerminateReason,
};

/// How long the closing handshake may take before the socket is forced
/// shut.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Start a detached session. The returned handle may be dropped freely;
/// the session keeps running until the connection ends and the handler
/// declines to reconnect.
///
/// Unless [`Options::async_connect`] is set, the first connect cycle is
/// awaited and its failure becomes this function's error.
pub async fn start<H: Handler>(
    url: &str,
    handler: H,
    options: Options,
) -> Result<SessionHandle<H>> {
    spawn_session(url, handler, options, false).await
}

/// Like [`start`], but the handle owns the session: dropping it aborts
/// the task. Use this when the session must not outlive the component
/// that created it.
pub async fn start_link<H: Handler>(
    url: &str,
    handler: H,
    options: Options,
) -> Result<SessionHandle<H>> {
    spawn_session(url, handler, options, true).await
}

async fn spawn_session<H: Handler>(
    url: &str,
    handler: H,
    options: Options,
    linked: bool,
) -> Result<SessionHandle<H>> {
    let conn = Conn::new(url, &options)?;
    let (commands, mailbox) = mpsc::unbounded_channel();

    let (ready_tx, ready_rx) = if options.async_connect {
        (None, None)
    } else {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    };

    let task = SessionTask {
        conn,
        handler,
        mailbox,
        mailbox_open: true,
        buffer: BytesMut::with_capacity(4 * 1024),
        reassembler: Reassembler::default(),
        max_frame_size: options.max_frame_size,
        ready: ready_tx,
    };
    let join = tokio::spawn(task.run());

    if let Some(ready) = ready_rx {
        match ready.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::SessionGone),
        }
    }

    Ok(SessionHandle {
        commands,
        join: Some(join),
        linked,
    })
}

/// What producers can put in a session's mailbox.
enum Command<H: Handler> {
    Cast(H::Cast),
    Info(H::Info),
    SendBytes(Vec<u8>),
    Stop,
}

/// Handle to a running session.
pub struct SessionHandle<H: Handler> {
    commands: mpsc::UnboundedSender<Command<H>>,
    join: Option<JoinHandle<Result<()>>>,
    linked: bool,
}

impl<H: Handler> std::fmt::Debug for SessionHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("linked", &self.linked)
            .finish_non_exhaustive()
    }
}

impl<H: Handler> SessionHandle<H> {
    /// Fire-and-forget message to [`Handler::handle_cast`].
    pub fn cast(&self, message: H::Cast) -> Result<()> {
        self.commands
            .send(Command::Cast(message))
            .map_err(|_| Error::SessionGone)
    }

    /// Encode `frame` here, on the caller, then queue the bytes for the
    /// session to write. Encode errors come back synchronously and never
    /// touch the session.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame::encode(frame)?;
        self.commands
            .send(Command::SendBytes(bytes))
            .map_err(|_| Error::SessionGone)
    }

    /// Out-of-band message to [`Handler::handle_info`].
    pub fn notify(&self, message: H::Info) -> Result<()> {
        self.commands
            .send(Command::Info(message))
            .map_err(|_| Error::SessionGone)
    }

    /// Ask the session to run a normal close handshake and terminate.
    pub fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .map_err(|_| Error::SessionGone)
    }

    /// Whether the session task is still running.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Wait for the session to terminate. `Ok(())` means a normal close
    /// (codeless, code 1000, or a plain TCP drop); anything else is the
    /// termination reason.
    pub async fn join(mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Err(Error::SessionGone);
        };
        match join.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::SessionGone),
        }
    }
}

impl<H: Handler> Drop for SessionHandle<H> {
    fn drop(&mut self) {
        if self.linked {
            if let Some(join) = &self.join {
                join.abort();
            }
        }
    }
}

/// How the open-phase dispatcher ended.
enum LoopExit {
    /// The connection closed; the reason goes to `handle_disconnect`
    Closed(CloseReason),
    /// A handler-level failure; terminates without `handle_disconnect`
    Fatal(Error),
}

/// Continuation of the dispatcher after one piece of work.
enum Flow {
    Continue,
    Exit(LoopExit),
}

enum Event<H: Handler> {
    Read(std::result::Result<usize, ConnError>),
    Command(Option<Command<H>>),
}

struct SessionTask<H: Handler> {
    conn: Conn,
    handler: H,
    mailbox: mpsc::UnboundedReceiver<Command<H>>,
    mailbox_open: bool,
    buffer: BytesMut,
    reassembler: Reassembler,
    max_frame_size: usize,
    /// Pending rendezvous with a synchronous `start` caller
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl<H: Handler> SessionTask<H> {
    async fn run(mut self) -> Result<()> {
        let reason = self.lifecycle().await;
        let _ = protect("on_terminate", self.handler.on_terminate(&reason)).await;

        let result = match reason {
            TerminateReason::Closed(close) if close.is_normal() => {
                info!(%close, "session terminated");
                Ok(())
            }
            TerminateReason::Closed(close) => Err(Error::AbnormalClose(close)),
            TerminateReason::Failed(err) => Err(err),
        };

        match self.ready.take() {
            // a caller is still blocked in start(); the outcome is theirs
            Some(ready) => match ready.send(result) {
                Ok(()) => Ok(()),
                Err(result) => result,
            },
            None => result,
        }
    }

    /// Walk the session states until a termination reason emerges.
    async fn lifecycle(&mut self) -> TerminateReason {
        let mut attempt: u32 = 1;
        loop {
            // Connecting
            if let Err(err) = self.connect().await {
                self.conn.teardown().await;
                warn!(%err, attempt, "connection attempt failed");
                let decision = match protect(
                    "handle_connect_failure",
                    self.handler.handle_connect_failure(ConnectFailure {
                        error: &err,
                        attempt,
                        conn: &self.conn,
                    }),
                )
                .await
                {
                    Ok(decision) => decision,
                    Err(panic_err) => return TerminateReason::Failed(panic_err),
                };
                match decision {
                    OnConnectFailure::Stop => return TerminateReason::Failed(err),
                    OnConnectFailure::Retry => {
                        attempt += 1;
                        continue;
                    }
                    OnConnectFailure::RetryWith(replacement) => {
                        self.conn = *replacement;
                        attempt += 1;
                        continue;
                    }
                }
            }
            attempt = 1;
            info!(url = %self.conn.url(), "connected");
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(Ok(()));
            }

            let init = protect("on_connect", self.handler.on_connect(&self.conn)).await;
            let exit = match self.apply("on_connect", init).await {
                Flow::Continue => self.open_loop().await,
                Flow::Exit(exit) => exit,
            };

            // Disconnect
            match exit {
                LoopExit::Fatal(err) => return TerminateReason::Failed(err),
                LoopExit::Closed(reason) => {
                    debug!(%reason, "disconnected");
                    let decision = match protect(
                        "handle_disconnect",
                        self.handler.handle_disconnect(&reason),
                    )
                    .await
                    {
                        Ok(decision) => decision,
                        Err(panic_err) => return TerminateReason::Failed(panic_err),
                    };
                    match decision {
                        OnDisconnect::Stop => return TerminateReason::Closed(reason),
                        OnDisconnect::Reconnect => {
                            self.conn.teardown().await;
                            self.buffer.clear();
                            self.reassembler.reset();
                            info!("reconnecting");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Open the transport and run the upgrade handshake.
    async fn connect(&mut self) -> Result<()> {
        debug!(url = %self.conn.url(), "opening transport");
        self.conn.open().await?;
        handshake::perform(&mut self.conn, &mut self.buffer).await?;
        Ok(())
    }

    /// The dispatcher. Per iteration: one pending mailbox command, then
    /// at most one buffered frame, and only when neither made progress
    /// an await on socket + mailbox. Alternating this way keeps both
    /// directions moving no matter how busy either side is.
    async fn open_loop(&mut self) -> LoopExit {
        loop {
            if self.mailbox_open {
                match self.mailbox.try_recv() {
                    Ok(command) => {
                        match self.on_command(command).await {
                            Flow::Continue => continue,
                            Flow::Exit(exit) => return exit,
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => self.mailbox_open = false,
                }
            }

            match frame::parse(&self.buffer, self.max_frame_size) {
                Ok(Some((next, consumed))) => {
                    self.buffer.advance(consumed);
                    match self.on_frame(next).await {
                        Flow::Continue => continue,
                        Flow::Exit(exit) => return exit,
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "framing violation");
                    let code = err.close_code();
                    return self
                        .local_close(
                            Some(CloseFrame::new(code, err.to_string())),
                            CloseReason::WithCode {
                                initiator: Initiator::Local,
                                code,
                                reason: err.to_string(),
                            },
                        )
                        .await;
                }
            }

            let event = {
                let conn = &mut self.conn;
                let buffer = &mut self.buffer;
                let mailbox = &mut self.mailbox;
                let mailbox_open = self.mailbox_open;
                tokio::select! {
                    read = conn.recv(buffer) => Event::Read(read),
                    command = mailbox.recv(), if mailbox_open => Event::Command(command),
                }
            };
            match event {
                Event::Read(Ok(0)) => return LoopExit::Closed(CloseReason::Dropped),
                Event::Read(Ok(_)) => {}
                Event::Read(Err(err)) if err.is_disconnect() => {
                    return LoopExit::Closed(CloseReason::Dropped)
                }
                Event::Read(Err(err)) => return LoopExit::Closed(CloseReason::Fault(err)),
                Event::Command(Some(command)) => match self.on_command(command).await {
                    Flow::Continue => {}
                    Flow::Exit(exit) => return exit,
                },
                Event::Command(None) => self.mailbox_open = false,
            }
        }
    }

    async fn on_command(&mut self, command: Command<H>) -> Flow {
        match command {
            Command::SendBytes(bytes) => self.write(&bytes).await,
            Command::Cast(message) => {
                let outcome = protect("handle_cast", self.handler.handle_cast(message)).await;
                self.apply("handle_cast", outcome).await
            }
            Command::Info(message) => {
                let outcome = protect("handle_info", self.handler.handle_info(message)).await;
                self.apply("handle_info", outcome).await
            }
            Command::Stop => {
                debug!("stop requested");
                Flow::Exit(
                    self.local_close(None, CloseReason::Normal(Initiator::Local))
                        .await,
                )
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Text(bytes) => match reassembly::assemble(MessageKind::Text, bytes) {
                Ok(message) => self.deliver(message).await,
                Err(violation) => Flow::Exit(self.violation_close(violation).await),
            },
            Frame::Binary(bytes) => self.deliver(Message::Binary(bytes)).await,
            Frame::Ping(payload) => {
                let outcome = protect("handle_ping", self.handler.handle_ping(payload)).await;
                self.apply("handle_ping", outcome).await
            }
            Frame::Pong(payload) => {
                let outcome = protect("handle_pong", self.handler.handle_pong(payload)).await;
                self.apply("handle_pong", outcome).await
            }
            Frame::Close(body) => Flow::Exit(self.remote_close(body).await),
            Frame::Fragment { kind, payload } => {
                match self.reassembler.fragment(kind, payload) {
                    Ok(()) => Flow::Continue,
                    Err(violation) => Flow::Exit(self.violation_close(violation).await),
                }
            }
            Frame::Continuation(payload) => match self.reassembler.continuation(payload) {
                Ok(()) => Flow::Continue,
                Err(violation) => Flow::Exit(self.violation_close(violation).await),
            },
            Frame::Finish(payload) => match self.reassembler.finish(payload) {
                Ok(message) => self.deliver(message).await,
                Err(violation) => Flow::Exit(self.violation_close(violation).await),
            },
        }
    }

    async fn deliver(&mut self, message: Message) -> Flow {
        let outcome = protect("handle_frame", self.handler.handle_frame(message)).await;
        self.apply("handle_frame", outcome).await
    }

    /// Act on a handler reply. Reply frames go on the wire before the
    /// dispatcher touches anything else; a frame the codec rejects is an
    /// unusable reply and terminates the session.
    async fn apply(
        &mut self,
        callback: &'static str,
        outcome: std::result::Result<Reply, Error>,
    ) -> Flow {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => return Flow::Exit(LoopExit::Fatal(err)),
        };
        match reply {
            Reply::Continue => Flow::Continue,
            Reply::Send(frame) => {
                let bytes = match frame::encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        return Flow::Exit(LoopExit::Fatal(Error::BadResponse {
                            callback,
                            detail: err.to_string(),
                        }))
                    }
                };
                self.write(&bytes).await
            }
            Reply::Close(body) => {
                // encode eagerly: a close body the codec rejects (bad
                // code, oversized reason) is an unusable reply, same as
                // an unencodable Send frame
                let reason = close_reason(Initiator::Local, &body);
                let bytes = match frame::encode(&Frame::Close(body)) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        return Flow::Exit(LoopExit::Fatal(Error::BadResponse {
                            callback,
                            detail: err.to_string(),
                        }))
                    }
                };
                Flow::Exit(self.send_close(bytes, reason).await)
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Flow {
        match self.conn.send(bytes).await {
            Ok(()) => Flow::Continue,
            Err(err) if err.is_disconnect() => {
                Flow::Exit(LoopExit::Closed(CloseReason::Dropped))
            }
            Err(err) => Flow::Exit(LoopExit::Fatal(Error::Conn(err))),
        }
    }

    async fn violation_close(&mut self, violation: Violation) -> LoopExit {
        warn!(
            code = violation.code,
            reason = violation.reason,
            "protocol violation"
        );
        self.local_close(
            Some(CloseFrame::new(violation.code, violation.reason)),
            CloseReason::WithCode {
                initiator: Initiator::Local,
                code: violation.code,
                reason: violation.reason.to_string(),
            },
        )
        .await
    }

    /// This side starts the closing handshake with a session-built
    /// close body (protocol violations, stop requests).
    async fn local_close(&mut self, body: Option<CloseFrame>, reason: CloseReason) -> LoopExit {
        let bytes = match frame::encode(&Frame::Close(body)) {
            Ok(bytes) => bytes,
            Err(err) => return LoopExit::Fatal(Error::Encode(err)),
        };
        self.send_close(bytes, reason).await
    }

    /// Put an already-encoded close frame on the wire and run the
    /// close-loop.
    async fn send_close(&mut self, bytes: Vec<u8>, reason: CloseReason) -> LoopExit {
        match self.conn.send(&bytes).await {
            Ok(()) => self.drain_until_closed(reason).await,
            Err(err) if err.is_disconnect() => {
                // the peer beat us to it
                LoopExit::Closed(CloseReason::Dropped)
            }
            Err(err) => LoopExit::Closed(CloseReason::Fault(err)),
        }
    }

    /// The peer started the closing handshake: echo the code
    /// (best-effort) and wait for the TCP close.
    async fn remote_close(&mut self, body: Option<CloseFrame>) -> LoopExit {
        let reason = close_reason(Initiator::Remote, &body);
        debug!(%reason, "close frame received");

        let echo = body.map(|close| CloseFrame::new(close.code, String::new()));
        match frame::encode(&Frame::Close(echo)) {
            Ok(bytes) => {
                if let Err(err) = self.conn.send(&bytes).await {
                    if err.is_disconnect() {
                        return LoopExit::Closed(reason);
                    }
                    warn!(%err, "failed to answer the close frame");
                }
            }
            Err(err) => warn!(%err, "could not encode close echo"),
        }
        self.drain_until_closed(reason).await
    }

    /// Close-Loop: discard whatever else arrives until the peer closes
    /// TCP or the grace period runs out, then tear the socket down.
    async fn drain_until_closed(&mut self, reason: CloseReason) -> LoopExit {
        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            let conn = &mut self.conn;
            let buffer = &mut self.buffer;
            let done = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("close grace period elapsed, forcing the socket shut");
                    true
                }
                read = conn.recv(buffer) => match read {
                    Ok(0) | Err(_) => true,
                    Ok(_) => {
                        buffer.clear();
                        false
                    }
                }
            };
            if done {
                break;
            }
        }
        self.conn.teardown().await;
        LoopExit::Closed(reason)
    }
}

fn close_reason(initiator: Initiator, body: &Option<CloseFrame>) -> CloseReason {
    match body {
        None => CloseReason::Normal(initiator),
        Some(close) if close.code == 1000 && close.reason.is_empty() => {
            CloseReason::Normal(initiator)
        }
        Some(close) => CloseReason::WithCode {
            initiator,
            code: close.code,
            reason: close.reason.clone(),
        },
    }
}

/// Run one handler callback, converting a panic into the error that
/// becomes the termination reason. The default panic hook has already
/// printed the backtrace by the time the payload reaches us.
async fn protect<T>(
    callback: &'static str,
    fut: impl std::future::Future<Output = T>,
) -> std::result::Result<T, Error> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(callback, %message, "handler panicked");
            Err(Error::HandlerPanic { callback, message })
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
