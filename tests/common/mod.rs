//! Common test utilities: a scripted mock WebSocket server.
//!
//! The server speaks just enough server-side RFC 6455 for the
//! integration tests: it upgrades (or rejects) incoming connections and
//! then follows a per-test [`Script`], recording every client frame it
//! sees so tests can assert on the wire traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

/// What the server does after (or instead of) upgrading.
#[derive(Debug, Clone)]
pub enum Script {
    /// Echo text/binary frames; answer a close frame and shut down
    EchoUntilClose,
    /// Send one ping with this payload right after the upgrade, then
    /// behave like `EchoUntilClose`
    PingThenWait(Vec<u8>),
    /// Close the TCP connection right after the upgrade, no close frame
    DropAfterUpgrade,
    /// Drop TCP after the upgrade on the first connection only; echo on
    /// later connections
    DropFirstThenEcho,
    /// Reject the first `n` upgrades with 404, echo afterwards
    RejectFirst(usize),
    /// Send a fragmented binary message interleaved with a ping, then
    /// behave like `EchoUntilClose`
    FragmentedBinary,
    /// Send a masked frame (a protocol violation for a server), then
    /// record how the client reacts
    MaskedFrame,
    /// Swallow everything: never answer the client's close frame and
    /// never close TCP
    IgnoreClose,
}

/// A frame received from the client, unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection completed the upgrade
    Connected,
    /// A frame arrived from the client
    Frame(ClientFrame),
    /// An upgraded connection ended (close handshake or plain EOF)
    ConnectionClosed,
}

pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    connections: Arc<AtomicUsize>,
}

/// Opt-in tracing output for debugging test runs (TEST_VERBOSE=1).
fn init_tracing() {
    if std::env::var("TEST_VERBOSE").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("limpet=debug")
            .try_init();
    }
}

impl MockWsServer {
    /// Bind an ephemeral port and start serving `script`.
    pub async fn start(script: Script) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let connections = Arc::new(AtomicUsize::new(0));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shutdown_accept = Arc::clone(&shutdown);
        let connections_accept = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_accept.notified() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let index = connections_accept.fetch_add(1, Ordering::SeqCst);
                        let script = script.clone();
                        let events = events_tx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, script, index, events).await;
                        });
                    }
                }
            }
        });

        MockWsServer {
            addr,
            shutdown,
            events: events_rx,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connections accepted so far (including rejected upgrades).
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next recorded event, failing the test after 5 s of silence.
    pub async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a server event")
            .expect("server event channel closed")
    }

    /// Next client frame, skipping `Connected` markers.
    pub async fn next_client_frame(&mut self) -> ClientFrame {
        loop {
            if let ServerEvent::Frame(frame) = self.next_event().await {
                return frame;
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    script: Script,
    index: usize,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let Some(key) = read_upgrade(&mut stream).await else {
        return;
    };

    let reject = matches!(&script, Script::RejectFirst(n) if index < *n);
    if reject {
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_value(&key)
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    let _ = events.send(ServerEvent::Connected);

    match script {
        Script::DropAfterUpgrade => {}
        Script::DropFirstThenEcho if index == 0 => {}
        Script::DropFirstThenEcho | Script::EchoUntilClose | Script::RejectFirst(_) => {
            echo_until_close(&mut stream, &events).await;
        }
        Script::PingThenWait(payload) => {
            let _ = stream.write_all(&server_frame(true, 0x9, &payload)).await;
            echo_until_close(&mut stream, &events).await;
        }
        Script::FragmentedBinary => {
            let _ = stream.write_all(&server_frame(false, 0x2, &[1, 2])).await;
            let _ = stream.write_all(&server_frame(false, 0x0, &[3])).await;
            let _ = stream.write_all(&server_frame(true, 0x9, &[])).await;
            let _ = stream.write_all(&server_frame(true, 0x0, &[4])).await;
            echo_until_close(&mut stream, &events).await;
        }
        Script::MaskedFrame => {
            // servers must not mask; the client has to fail the
            // connection when it sees this
            let masked = [0x81, 0x80 | 1, 1, 2, 3, 4, b'x' ^ 1];
            let _ = stream.write_all(&masked).await;
            echo_until_close(&mut stream, &events).await;
        }
        Script::IgnoreClose => {
            while let Some(frame) = read_client_frame(&mut stream).await {
                let _ = events.send(ServerEvent::Frame(frame));
            }
        }
    }
    let _ = events.send(ServerEvent::ConnectionClosed);
}

/// Record frames, echo data frames, and run the server side of the
/// closing handshake when a close frame arrives.
async fn echo_until_close(stream: &mut TcpStream, events: &mpsc::UnboundedSender<ServerEvent>) {
    while let Some(frame) = read_client_frame(stream).await {
        let _ = events.send(ServerEvent::Frame(frame.clone()));
        match frame {
            ClientFrame::Text(text) => {
                let _ = stream.write_all(&server_frame(true, 0x1, text.as_bytes())).await;
            }
            ClientFrame::Binary(bytes) => {
                let _ = stream.write_all(&server_frame(true, 0x2, &bytes)).await;
            }
            ClientFrame::Ping(payload) => {
                let _ = stream.write_all(&server_frame(true, 0xA, &payload)).await;
            }
            ClientFrame::Pong(_) => {}
            ClientFrame::Close(body) => {
                let payload = body
                    .map(|(code, reason)| close_body(code, &reason))
                    .unwrap_or_default();
                let _ = stream.write_all(&server_frame(true, 0x8, &payload)).await;
                let _ = stream.shutdown().await;
                return;
            }
        }
    }
}

/// Read the upgrade request and pull out the Sec-WebSocket-Key.
async fn read_upgrade(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 || buf.len() > 16 * 1024 {
            return None;
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    let text = String::from_utf8_lossy(&buf);
    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    BASE64.encode(sha1.finalize())
}

/// Build an unmasked server-to-client frame.
pub fn server_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![if fin { 0x80 } else { 0x00 } | opcode];
    match payload.len() {
        n if n <= 125 => out.push(n as u8),
        n if n <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

pub fn close_body(code: u16, reason: &str) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(reason.as_bytes());
    body
}

/// Read and unmask one client frame.
async fn read_client_frame(stream: &mut TcpStream) -> Option<ClientFrame> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.ok()?;
    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;

    let mut len = (head[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.ok()?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.ok()?;
        len = u64::from_be_bytes(ext);
    }

    let mut key = [0u8; 4];
    if masked {
        stream.read_exact(&mut key).await.ok()?;
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    if masked {
        for (idx, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[idx & 3];
        }
    }

    match opcode {
        0x1 => Some(ClientFrame::Text(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        0x2 => Some(ClientFrame::Binary(payload)),
        0x8 => {
            let body = if payload.len() >= 2 {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                Some((code, reason))
            } else {
                None
            };
            Some(ClientFrame::Close(body))
        }
        0x9 => Some(ClientFrame::Ping(payload)),
        0xA => Some(ClientFrame::Pong(payload)),
        _ => None,
    }
}
