use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;

/// Connection and session options.
///
/// Built with chained setters:
///
/// ```ignore
/// let options = Options::default()
///     .header("Authorization", format!("Bearer {token}"))
///     .connect_timeout(Duration::from_secs(5))
///     .async_connect(true);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) connect_timeout: Duration,
    pub(crate) recv_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) tls_roots: Option<Arc<RootCertStore>>,
    pub(crate) async_connect: bool,
    pub(crate) max_frame_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            tls_roots: None,
            async_connect: false,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl Options {
    /// Add an extra header to the upgrade request. May be called
    /// repeatedly; headers are sent in insertion order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Time allowed for TCP connect plus TLS negotiation (default 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Time allowed for each read while waiting on the upgrade response
    /// (default 5 s). Reads on an open connection are not bounded; idle
    /// connections stay up.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Time allowed for each socket write (default 5 s).
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Trust anchors for `wss://` connections. Defaults to the bundled
    /// webpki roots.
    pub fn tls_roots(mut self, roots: Arc<RootCertStore>) -> Self {
        self.tls_roots = Some(roots);
        self
    }

    /// When true, `start`/`start_link` return as soon as the session
    /// task is spawned and connect failures reach only
    /// [`Handler::handle_connect_failure`](crate::Handler::handle_connect_failure).
    /// Default false: the first connect cycle is awaited and its error
    /// returned to the caller.
    pub fn async_connect(mut self, enabled: bool) -> Self {
        self.async_connect = enabled;
        self
    }

    /// Largest inbound frame payload accepted before the session
    /// fail-closes with code 1009 (default 64 MiB).
    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }
}
