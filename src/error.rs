use std::{borrow::Cow, sync::Arc};

use bytes::Bytes;

use crate::messages::backend::{MessageCode, PgFrame};

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for every connection, handshake and statement failure.
///
/// Only [`Error::Server`] is recoverable: it is delivered to the statement
/// that caused it and the connection keeps running. Every other variant
/// closes the connection, see [`Error::is_fatal`].
#[derive(Debug, Clone)]
pub enum Error {
    /// The underlying transport failed.
    Io(Arc<std::io::Error>),
    /// The byte stream can no longer be trusted to be frame-aligned.
    Protocol(ProtocolError),
    /// The server refused TLS and the configuration forbids plaintext.
    TlsRequired,
    /// The TLS handshake itself failed.
    TlsNegotiation(String),
    /// The server asked for a password but none was configured.
    PasswordRequired,
    /// The authentication exchange failed on the client side, e.g. the
    /// server's SCRAM signature did not verify.
    Authentication(String),
    /// The server rejected the supplied credentials.
    AuthenticationRejected(PgErrorResponse),
    /// The server requested an authentication method this client does not speak.
    UnsupportedAuthMethod(String),
    /// A structured error response tied to a single statement.
    Server(PgErrorResponse),
    /// The connection closed while the statement was still pending.
    ConnectionClosed,
    /// The client configuration is missing a required value.
    Config(String),
}

impl Error {
    /// Whether this error terminates the connection.
    ///
    /// Server errors are fatal only with `FATAL` or `PANIC` severity, which
    /// the server sends right before disconnecting.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Server(e) => {
                let severity = e.severity().or_else(|| e.local_severity());
                matches!(severity.as_deref(), Some("FATAL" | "PANIC"))
            }
            _ => true,
        }
    }

    /// The server's error payload, when the server produced one.
    pub fn as_server_error(&self) -> Option<&PgErrorResponse> {
        match self {
            Error::Server(e) | Error::AuthenticationRejected(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "encountered I/O error: {e}"),
            Error::Protocol(e) => write!(f, "protocol violation: {e}"),
            Error::TlsRequired => write!(f, "server does not support TLS"),
            Error::TlsNegotiation(e) => write!(f, "TLS negotiation failed: {e}"),
            Error::PasswordRequired => write!(f, "password is required"),
            Error::Authentication(e) => write!(f, "authentication failed: {e}"),
            Error::AuthenticationRejected(e) => write!(f, "authentication rejected: {e}"),
            Error::UnsupportedAuthMethod(m) => {
                write!(f, "unsupported authentication method {m}")
            }
            Error::Server(e) => write!(f, "encountered Postgres error response: {e}"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Config(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        Error::Protocol(value)
    }
}

/// A malformed or misaligned frame. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A length prefix smaller than the length field itself.
    InvalidLength(u32),
    /// A length prefix larger than any frame the server would produce.
    FrameTooLarge(usize),
    /// A tag outside the recognized backend message set.
    UnknownMessage(u8),
    /// A frame that is valid on the wire but not allowed at this point.
    UnexpectedMessage(MessageCode),
    /// A payload that does not match its message layout.
    Malformed(&'static str),
    /// A single-byte response other than the ones the protocol defines.
    UnexpectedResponse(u8),
    /// The stream ended in the middle of a handshake.
    UnexpectedEof,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidLength(len) => write!(f, "invalid frame length {len}"),
            ProtocolError::FrameTooLarge(len) => write!(f, "frame of {len}B exceeds limit"),
            ProtocolError::UnknownMessage(tag) => {
                write!(f, "unknown message tag 0x{tag:02x}")
            }
            ProtocolError::UnexpectedMessage(code) => write!(f, "unexpected message {code}"),
            ProtocolError::Malformed(what) => write!(f, "malformed message: {what}"),
            ProtocolError::UnexpectedResponse(b) => {
                write!(f, "unexpected response byte 0x{b:02x}")
            }
            ProtocolError::UnexpectedEof => write!(f, "unexpected end of stream"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Generates the field table of [`PgErrorResponse`]: one slot per known
/// tag and one accessor per slot.
macro_rules! response_fields {
    ($($(#[$doc:meta])* $idx:literal $tag:literal $accessor:ident,)*) => {
        const FIELD_COUNT: usize = [$($tag),*].len();

        fn field_slot(tag: u8) -> Option<usize> {
            match tag {
                $($tag => Some($idx),)*
                _ => None,
            }
        }

        impl PgErrorResponse {
            $(
                $(#[$doc])*
                pub fn $accessor(&self) -> Option<Cow<'_, str>> {
                    self.field($idx)
                }
            )*
        }
    };
}

response_fields! {
    /// Localized severity, e.g. `ERROR` or `FEHLER`.
    0 b'S' local_severity,
    /// The non-localized severity; only sent by servers 9.6 and newer.
    1 b'V' severity,
    /// The SQLSTATE code.
    2 b'C' code,
    3 b'M' message,
    4 b'D' detail,
    5 b'H' hint,
    /// 1-based character offset into the query text.
    6 b'P' position,
    7 b'p' internal_position,
    8 b'q' internal_query,
    9 b'W' r#where,
    10 b's' schema,
    11 b't' table,
    12 b'c' column,
    13 b'd' datatype,
    14 b'n' constraint,
    15 b'F' file,
    16 b'L' line,
    17 b'R' routine,
}

/// A server ErrorResponse or NoticeResponse.
///
/// Keeps the original payload and only records where each field's value
/// lives in it; accessors decode lazily.
#[derive(Clone)]
pub struct PgErrorResponse {
    body: Bytes,
    spans: [Option<(u32, u32)>; FIELD_COUNT],
}

impl PgErrorResponse {
    /// Indexes the `tag value\0` fields of an error or notice body.
    ///
    /// Unknown tags are skipped, as the protocol reserves the right to add
    /// new ones.
    pub fn new(body: Bytes) -> Self {
        let mut spans = [None; FIELD_COUNT];

        let mut pos = 0;
        while let Some(&tag) = body.get(pos) {
            if tag == 0 {
                break;
            }
            let start = pos + 1;
            let end = body[start..]
                .iter()
                .position(|b| *b == 0)
                .map_or(body.len(), |n| start + n);

            if let Some(slot) = field_slot(tag) {
                spans[slot] = Some((start as u32, end as u32));
            }
            pos = end + 1;
        }

        Self { body, spans }
    }

    /// The raw, undecoded payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    fn field(&self, slot: usize) -> Option<Cow<'_, str>> {
        self.spans[slot].map(|(start, end)| {
            String::from_utf8_lossy(&self.body[start as usize..end as usize])
        })
    }
}

impl std::fmt::Display for PgErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = self.local_severity().unwrap_or(Cow::Borrowed("UNKNOWN"));
        let code = self.code().unwrap_or(Cow::Borrowed("?????"));
        let message = self.message().unwrap_or_default();
        write!(f, "[{severity}] {code}: {message}")
    }
}

impl std::fmt::Debug for PgErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("PgErrorResponse");
        s.field("severity", &self.severity().or_else(|| self.local_severity()))
            .field("code", &self.code())
            .field("message", &self.message());
        for (name, value) in [
            ("detail", self.detail()),
            ("hint", self.hint()),
            ("position", self.position()),
            ("where", self.r#where()),
            ("table", self.table()),
            ("constraint", self.constraint()),
        ] {
            if let Some(value) = value {
                s.field(name, &value);
            }
        }
        s.finish_non_exhaustive()
    }
}

impl TryFrom<PgFrame> for PgErrorResponse {
    type Error = PgFrame;

    fn try_from(frame: PgFrame) -> std::result::Result<Self, Self::Error> {
        match frame.code {
            MessageCode::ERROR_RESPONSE | MessageCode::NOTICE_RESPONSE => {
                Ok(PgErrorResponse::new(frame.body))
            }
            _ => Err(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        Error, PgErrorResponse, ProtocolError,
        messages::backend::{MessageCode, PgFrame},
    };

    #[test]
    fn test_error_response_fields() {
        let body = Bytes::from_static(
            b"SERROR\0VERROR\0C42P01\0Mrelation \"nope\" does not exist\0P15\0Fparse_relation.c\0L1449\0\0",
        );
        let resp = PgErrorResponse::new(body);

        assert_eq!(resp.local_severity().as_deref(), Some("ERROR"));
        assert_eq!(resp.severity().as_deref(), Some("ERROR"));
        assert_eq!(resp.code().as_deref(), Some("42P01"));
        assert_eq!(
            resp.message().as_deref(),
            Some("relation \"nope\" does not exist")
        );
        assert_eq!(resp.position().as_deref(), Some("15"));
        assert_eq!(resp.file().as_deref(), Some("parse_relation.c"));
        assert_eq!(resp.line().as_deref(), Some("1449"));
        assert_eq!(resp.hint(), None);
        assert_eq!(
            resp.to_string(),
            "[ERROR] 42P01: relation \"nope\" does not exist"
        );
    }

    #[test]
    fn test_error_response_skips_unknown_tags() {
        let resp = PgErrorResponse::new(Bytes::from_static(b"Xwhatever\0Mhello\0\0"));
        assert_eq!(resp.message().as_deref(), Some("hello"));
        assert_eq!(resp.code(), None);
    }

    #[test]
    fn test_try_from_frame() {
        let frame = PgFrame::new(MessageCode::NOTICE_RESPONSE, &b"SNOTICE\0Mhi\0\0"[..]);
        let notice = PgErrorResponse::try_from(frame).unwrap();
        assert_eq!(notice.local_severity().as_deref(), Some("NOTICE"));

        let frame = PgFrame::new(MessageCode::READY_FOR_QUERY, &b"I"[..]);
        assert!(PgErrorResponse::try_from(frame).is_err());
    }

    #[test]
    fn test_fatality() {
        let server = Error::Server(PgErrorResponse::new(Bytes::from_static(b"\0")));
        assert!(!server.is_fatal());
        let fatal = Error::Server(PgErrorResponse::new(Bytes::from_static(
            b"SFATAL\0VFATAL\0C3D000\0\0",
        )));
        assert!(fatal.is_fatal());
        assert!(Error::Protocol(ProtocolError::UnknownMessage(b'?')).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::from(std::io::Error::other("boom")).is_fatal());
    }
}
