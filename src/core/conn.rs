//! Connection facade: URL validation, plain or TLS socket, timed I/O.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::core::config::Options;
use crate::traits::error::{ConnError, UrlError};

/// The underlying stream, mirroring the scheme that produced it.
#[derive(Debug)]
enum Socket {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// One validated connection target and, once opened, its socket.
///
/// A `Conn` is owned exclusively by the session driving it. Handlers see
/// it by reference in `on_connect` and `handle_connect_failure`, and may
/// build a replacement with [`Conn::new`] to steer a reconnect somewhere
/// else.
#[derive(Debug)]
pub struct Conn {
    url: Url,
    secure: bool,
    host: String,
    port: u16,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
    recv_timeout: Duration,
    send_timeout: Duration,
    tls_roots: Option<Arc<RootCertStore>>,
    socket: Option<Socket>,
}

impl Conn {
    /// Validate `url` and capture the connection options.
    ///
    /// The scheme must be `ws` or `wss`, a host must be present, and the
    /// port must be explicit or derivable from the scheme.
    pub fn new(url: &str, options: &Options) -> Result<Conn, UrlError> {
        let url = Url::parse(url)?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(UrlError::MissingHost)?
            .to_string();
        let port = url.port_or_known_default().ok_or(UrlError::MissingPort)?;

        Ok(Conn {
            url,
            secure,
            host,
            port,
            headers: options.headers.clone(),
            connect_timeout: options.connect_timeout,
            recv_timeout: options.recv_timeout,
            send_timeout: options.send_timeout,
            tls_roots: options.tls_roots.clone(),
            socket: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Extra headers carried into the upgrade request.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Request path plus query string, as it appears on the GET line.
    pub(crate) fn request_path(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Host header value: the port is included only when it is not the
    /// scheme default.
    pub(crate) fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Open the TCP (and for `wss`, TLS) stream. Any previous socket is
    /// discarded.
    pub(crate) async fn open(&mut self) -> Result<(), ConnError> {
        self.socket = None;

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let tcp = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ConnError::Timeout(self.connect_timeout))??;
        tcp.set_nodelay(true)?;

        if !self.secure {
            self.socket = Some(Socket::Plain(tcp));
            return Ok(());
        }

        let roots = match &self.tls_roots {
            Some(roots) => RootCertStore::clone(roots),
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name =
            ServerName::try_from(self.host.clone()).map_err(|_| ConnError::ServerName)?;

        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| ConnError::Timeout(self.connect_timeout))??;
        self.socket = Some(Socket::Tls(Box::new(tls)));
        Ok(())
    }

    /// Write `bytes` fully, bounded by the send timeout.
    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        let socket = self.socket.as_mut().ok_or(ConnError::Closed)?;
        let write = async {
            match socket {
                Socket::Plain(stream) => stream.write_all(bytes).await,
                Socket::Tls(stream) => stream.write_all(bytes).await,
            }
        };
        tokio::time::timeout(self.send_timeout, write)
            .await
            .map_err(|_| ConnError::Timeout(self.send_timeout))??;
        Ok(())
    }

    /// Append whatever the socket has to `buf`. `Ok(0)` means the peer
    /// closed the connection. Cancel-safe, so usable inside `select!`.
    pub(crate) async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize, ConnError> {
        let socket = self.socket.as_mut().ok_or(ConnError::Closed)?;
        let read = match socket {
            Socket::Plain(stream) => stream.read_buf(buf).await?,
            Socket::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(read)
    }

    /// [`Conn::recv`] bounded by the recv timeout, for the handshake
    /// phase where a silent server is an error.
    pub(crate) async fn recv_timed(&mut self, buf: &mut BytesMut) -> Result<usize, ConnError> {
        let timeout = self.recv_timeout;
        tokio::time::timeout(timeout, self.recv(buf))
            .await
            .map_err(|_| ConnError::Timeout(timeout))?
    }

    /// Shut the socket down (best-effort) and drop it.
    pub(crate) async fn teardown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let shutdown = match &mut socket {
                Socket::Plain(stream) => stream.shutdown().await,
                Socket::Tls(stream) => stream.shutdown().await,
            };
            if let Err(err) = shutdown {
                tracing::debug!(%err, "socket shutdown failed");
            }
        }
    }
}
