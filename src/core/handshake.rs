//! HTTP upgrade handshake: request build, response parse, challenge
//! verification.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::core::conn::Conn;
use crate::traits::error::Error;

/// The GUID every WebSocket accept challenge is derived from (RFC 6455
/// §1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_RESPONSE_LEN: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug)]
pub(crate) enum Verdict {
    /// Header block not finished yet; read more
    Incomplete,
    /// Response verified; `consumed` bytes belong to the header block
    Complete { consumed: usize },
}

/// Fresh `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub(crate) fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// The `Sec-WebSocket-Accept` value the server must answer with:
/// `base64(sha1(key ++ GUID))`.
pub(crate) fn accept_for(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Build the upgrade request for `conn`, including its extra headers.
pub(crate) fn build_request(conn: &Conn, key: &str) -> Vec<u8> {
    let mut req = Vec::with_capacity(256);
    req.extend_from_slice(format!("GET {} HTTP/1.1\r\n", conn.request_path()).as_bytes());
    req.extend_from_slice(format!("Host: {}\r\n", conn.host_header()).as_bytes());
    req.extend_from_slice(b"Upgrade: websocket\r\n");
    req.extend_from_slice(b"Connection: Upgrade\r\n");
    req.extend_from_slice(format!("Sec-WebSocket-Key: {key}\r\n").as_bytes());
    req.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");
    for (name, value) in conn.headers() {
        req.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    req.extend_from_slice(b"\r\n");
    req
}

/// Run the whole handshake on an open connection. Response bytes that
/// arrive past the header block (a server may pipeline its first frame)
/// are appended to `buffer` for the frame parser.
pub(crate) async fn perform(conn: &mut Conn, buffer: &mut BytesMut) -> Result<(), Error> {
    let key = generate_key();
    let request = build_request(conn, &key);
    conn.send(&request).await?;

    let mut raw = BytesMut::with_capacity(1024);
    loop {
        let read = conn.recv_timed(&mut raw).await?;
        if read == 0 {
            return Err(Error::Conn(crate::traits::error::ConnError::Closed));
        }
        if raw.len() > MAX_RESPONSE_LEN {
            return Err(Error::Handshake {
                response: format!("(response exceeded {MAX_RESPONSE_LEN} bytes)"),
                challenge: accept_for(&key),
            });
        }
        match check_response(&raw, &key)? {
            Verdict::Incomplete => continue,
            Verdict::Complete { consumed } => {
                buffer.extend_from_slice(&raw[consumed..]);
                return Ok(());
            }
        }
    }
}

/// Verify an upgrade response. Success requires status 101, the
/// `Upgrade`/`Connection` headers, and the exact accept challenge.
pub(crate) fn check_response(raw: &[u8], key: &str) -> Result<Verdict, Error> {
    let challenge = accept_for(key);
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response.parse(raw) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(Verdict::Incomplete),
        Err(_) => {
            return Err(Error::Handshake {
                response: String::from_utf8_lossy(raw).into_owned(),
                challenge,
            })
        }
    };

    let code = response.code.unwrap_or(0);
    if code != 101 {
        return Err(Error::Request {
            code,
            headers: response
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
        });
    }

    let verified = has_header_token(response.headers, "upgrade", "websocket")
        && has_header_token(response.headers, "connection", "upgrade")
        && header_value(response.headers, "sec-websocket-accept")
            .is_some_and(|accept| accept.trim() == challenge);
    if !verified {
        return Err(Error::Handshake {
            response: render(&response),
            challenge,
        });
    }

    Ok(Verdict::Complete { consumed })
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// True when `name` is present and its comma-separated value list
/// contains `token` (case-insensitive on both sides).
fn has_header_token(headers: &[httparse::Header<'_>], name: &str, token: &str) -> bool {
    headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case(name)
            && h.value
                .split(|byte| *byte == b',')
                .any(|part| trim_ascii(part).eq_ignore_ascii_case(token.as_bytes()))
    })
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

fn render(response: &httparse::Response<'_, '_>) -> String {
    let mut out = format!("HTTP/1.1 {}", response.code.unwrap_or(0));
    for header in response.headers.iter() {
        out.push_str("\r\n");
        out.push_str(header.name);
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(header.value));
    }
    out
}
