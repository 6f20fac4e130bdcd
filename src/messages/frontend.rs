//! Encoding of the messages a client sends.

use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// The untagged SSLRequest sent before anything else when TLS is wanted.
pub const SSL_REQUEST: &[u8] = &[
    0x00, 0x00, 0x00, 0x08, // length: 8
    0x04, 0xD2, 0x16, 0x2F, // code: 80877103
];

/// Tag of a message this client sends.
///
/// Every frontend message after startup is a tag byte followed by a
/// self-inclusive u32 length and the payload. See
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const BIND: Self = Self(b'B');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const DESCRIBE: Self = Self(b'D');
    pub const EXECUTE: Self = Self(b'E');
    pub const PARSE: Self = Self(b'P');
    /// Shared by PasswordMessage, SASLInitialResponse and SASLResponse.
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    /// Appends a complete message with this tag to `buf`.
    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    fn name(self) -> &'static str {
        match self.0 {
            b'B' => "Bind",
            b'f' => "CopyFail",
            b'D' => "Describe",
            b'E' => "Execute",
            b'P' => "Parse",
            b'p' => "PasswordMessage",
            b'S' => "Sync",
            b'X' => "Terminate",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frontend::MessageCode({})", self.0 as char)
    }
}

/// Writes a u32 length placeholder, runs `payload_fn`, then back-patches the
/// length to cover itself plus the payload.
///
/// Used directly for the untagged startup message.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

/// The object a Describe message refers to.
pub enum TargetKind {
    Portal(String),
    Statement(String),
}

impl TargetKind {
    pub fn new_portal(name: impl Into<String>) -> Self {
        TargetKind::Portal(name.into())
    }

    pub(crate) fn split(&self) -> (u8, &str) {
        match self {
            TargetKind::Portal(name) => (b'P', name),
            TargetKind::Statement(name) => (b'S', name),
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatCode {
    Text = 0,
    Binary = 1,
}

impl From<FormatCode> for u16 {
    fn from(value: FormatCode) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for FormatCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            _ => Err(ProtocolError::Malformed("unknown format code")),
        }
    }
}

/// A statement parameter. The variant decides the wire format: text values
/// are sent with format code 0, raw bytes with format code 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Null,
    Text(String),
    Binary(Bytes),
}

impl Param {
    /// The parameter format code. Each must presently be zero (text) or one (binary).
    pub fn format_code(&self) -> FormatCode {
        match self {
            Param::Binary(_) => FormatCode::Binary,
            Param::Null | Param::Text(_) => FormatCode::Text,
        }
    }

    /// Length-prefixed value, or -1 for NULL.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Param::Null => buf.put_i32(-1),
            Param::Text(s) => raw_prefix(buf, s.as_bytes()),
            Param::Binary(b) => raw_prefix(buf, b),
        }
    }
}

fn raw_prefix(buf: &mut impl BufMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<Bytes> for Param {
    fn from(v: Bytes) -> Self {
        Param::Binary(v)
    }
}

impl From<BytesMut> for Param {
    fn from(v: BytesMut) -> Self {
        Param::Binary(v.freeze())
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Binary(v.into())
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Param::Binary(Bytes::copy_from_slice(v))
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Param::Null,
        }
    }
}
