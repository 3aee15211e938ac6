//! RFC 6455 frame codec.
//!
//! [`encode`] turns a [`Frame`] into masked wire bytes (this is a client
//! library; every outbound frame carries a fresh random 32-bit masking
//! key). [`parse`] consumes the shortest prefix of a byte buffer that
//! forms one frame, distinguishing "not enough bytes yet" from a
//! protocol violation.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::traits::error::{EncodeError, ParseError};

const FIN_BIT: u8 = 0b1000_0000;
const RSV_MASK: u8 = 0b0111_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_MASK: u8 = 0b0111_1111;

/// Longest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// How to interpret the payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Opcode> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Payload kind of a fragmented message, fixed by its first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Body of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code, 1000..=4999
    pub code: u16,
    /// Human-readable close reason
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> CloseFrame {
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }
}

/// One wire-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Complete text message; bytes must be valid UTF-8 to encode
    Text(Vec<u8>),
    /// Complete binary message
    Binary(Vec<u8>),
    /// Ping, payload at most 125 bytes
    Ping(Option<Vec<u8>>),
    /// Pong, payload at most 125 bytes
    Pong(Option<Vec<u8>>),
    /// Close, optionally carrying a code and reason
    Close(Option<CloseFrame>),
    /// First piece of a fragmented message
    Fragment {
        kind: MessageKind,
        payload: Vec<u8>,
    },
    /// Middle piece of a fragmented message
    Continuation(Vec<u8>),
    /// Terminal piece of a fragmented message
    Finish(Vec<u8>),
}

impl Frame {
    /// Text frame from anything string-like.
    pub fn text(payload: impl Into<String>) -> Frame {
        Frame::Text(payload.into().into_bytes())
    }

    /// Binary frame from anything byte-like.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Frame {
        Frame::Binary(payload.into())
    }

    /// Close frame with a code and reason.
    pub fn close(code: u16, reason: impl Into<String>) -> Frame {
        Frame::Close(Some(CloseFrame::new(code, reason)))
    }

    fn opcode(&self) -> Opcode {
        match self {
            Frame::Text(_) => Opcode::Text,
            Frame::Binary(_) => Opcode::Binary,
            Frame::Ping(_) => Opcode::Ping,
            Frame::Pong(_) => Opcode::Pong,
            Frame::Close(_) => Opcode::Close,
            Frame::Fragment {
                kind: MessageKind::Text,
                ..
            } => Opcode::Text,
            Frame::Fragment {
                kind: MessageKind::Binary,
                ..
            } => Opcode::Binary,
            Frame::Continuation(_) => Opcode::Continuation,
            Frame::Finish(_) => Opcode::Continuation,
        }
    }

    fn fin(&self) -> bool {
        !matches!(self, Frame::Fragment { .. } | Frame::Continuation(_))
    }
}

/// Encode a frame for the client-to-server direction, masking the
/// payload with a fresh cryptographically random key.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let mut key = [0u8; 4];
    OsRng.fill_bytes(&mut key);
    encode_with_key(frame, key)
}

/// Encode with a caller-chosen masking key. Exists so tests can be
/// deterministic; [`encode`] is the entry point everything else uses.
pub(crate) fn encode_with_key(frame: &Frame, key: [u8; 4]) -> Result<Vec<u8>, EncodeError> {
    let mut payload = wire_payload(frame)?;
    let opcode = frame.opcode();

    if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(payload.len() + 14);
    let fin = if frame.fin() { FIN_BIT } else { 0 };
    out.push(fin | opcode as u8);

    match payload.len() {
        n if n <= 125 => out.push(MASK_BIT | n as u8),
        n if n <= u16::MAX as usize => {
            out.push(MASK_BIT | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(MASK_BIT | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    out.extend_from_slice(&key);
    apply_mask(&mut payload, key);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Payload bytes as they go on the wire, after validating the frame.
fn wire_payload(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    match frame {
        Frame::Text(bytes) => {
            if std::str::from_utf8(bytes).is_err() {
                return Err(EncodeError::InvalidUtf8);
            }
            Ok(bytes.clone())
        }
        Frame::Binary(bytes)
        | Frame::Fragment { payload: bytes, .. }
        | Frame::Continuation(bytes)
        | Frame::Finish(bytes) => Ok(bytes.clone()),
        Frame::Ping(payload) | Frame::Pong(payload) => {
            Ok(payload.clone().unwrap_or_default())
        }
        Frame::Close(None) => Ok(Vec::new()),
        Frame::Close(Some(CloseFrame { code, reason })) => {
            if !(1000..=4999).contains(code) {
                return Err(EncodeError::InvalidCloseCode(*code));
            }
            let mut body = Vec::with_capacity(2 + reason.len());
            body.extend_from_slice(&code.to_be_bytes());
            body.extend_from_slice(reason.as_bytes());
            Ok(body)
        }
    }
}

/// XOR `payload` in place with the 4-byte masking key. Same operation
/// masks and unmasks.
fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (idx, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[idx & 3];
    }
}

/// Parse the first frame out of `src`.
///
/// Returns `Ok(None)` while the buffer holds less than one whole frame,
/// and `Ok(Some((frame, consumed)))` once a frame is complete, where
/// `consumed` is how many leading bytes it occupied. Server frames must
/// arrive unmasked; a payload longer than `max_payload` is rejected
/// rather than buffered.
pub fn parse(src: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, ParseError> {
    let [b0, b1, rest @ ..] = src else {
        return Ok(None);
    };

    if b0 & RSV_MASK != 0 {
        return Err(ParseError::ReservedBits);
    }
    if b1 & MASK_BIT != 0 {
        return Err(ParseError::UnmaskedRequired);
    }

    let fin = b0 & FIN_BIT != 0;
    let bits = b0 & OPCODE_MASK;
    let opcode = Opcode::from_bits(bits).ok_or(ParseError::BadOpcode(bits))?;

    let (len, header_len) = match b1 & LEN_MASK {
        126 => {
            let Some(ext) = rest.get(..2) else {
                return Ok(None);
            };
            (u16::from_be_bytes([ext[0], ext[1]]) as u64, 4)
        }
        127 => {
            let Some(ext) = rest.get(..8) else {
                return Ok(None);
            };
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(ext);
            (u64::from_be_bytes(bytes), 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(ParseError::FragmentedControl);
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ParseError::ControlPayloadTooLarge(len));
        }
    }
    if len > max_payload as u64 {
        return Err(ParseError::PayloadTooLarge {
            len,
            limit: max_payload as u64,
        });
    }

    let total = header_len + len as usize;
    if src.len() < total {
        return Ok(None);
    }
    let payload = src[header_len..total].to_vec();

    let frame = match (fin, opcode) {
        (true, Opcode::Text) => Frame::Text(payload),
        (true, Opcode::Binary) => Frame::Binary(payload),
        (true, Opcode::Ping) => Frame::Ping(nonempty(payload)),
        (true, Opcode::Pong) => Frame::Pong(nonempty(payload)),
        (true, Opcode::Close) => Frame::Close(parse_close_body(&payload)?),
        (true, Opcode::Continuation) => Frame::Finish(payload),
        (false, Opcode::Text) => Frame::Fragment {
            kind: MessageKind::Text,
            payload,
        },
        (false, Opcode::Binary) => Frame::Fragment {
            kind: MessageKind::Binary,
            payload,
        },
        (false, Opcode::Continuation) => Frame::Continuation(payload),
        // control opcodes with fin=0 were rejected above
        (false, _) => return Err(ParseError::FragmentedControl),
    };

    Ok(Some((frame, total)))
}

fn nonempty(payload: Vec<u8>) -> Option<Vec<u8>> {
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

fn parse_close_body(payload: &[u8]) -> Result<Option<CloseFrame>, ParseError> {
    match payload {
        [] => Ok(None),
        [_] => Err(ParseError::TruncatedCloseCode),
        [hi, lo, reason @ ..] => Ok(Some(CloseFrame {
            code: u16::from_be_bytes([*hi, *lo]),
            reason: String::from_utf8_lossy(reason).into_owned(),
        })),
    }
}
