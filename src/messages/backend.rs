//! Decoding of the messages a server sends.

use bytes::{Buf, Bytes, BytesMut};

use crate::{ProtocolError, messages::frontend::FormatCode};

/// Largest frame body accepted. The server never allocates more than 1 GiB
/// (`MaxAllocSize` in `src/include/utils/memutils.h`).
pub const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// One byte of tag plus four bytes of length.
const HEADER_LEN: usize = 1 + size_of::<u32>();

/// Declares the closed set of backend tags along with their protocol names.
macro_rules! backend_codes {
    ($($(#[$doc:meta])* $konst:ident = $tag:literal => $name:literal,)*) => {
        impl MessageCode {
            $($(#[$doc])* pub const $konst: Self = Self($tag);)*

            /// Whether this code belongs to the closed set of backend messages.
            pub fn is_known(self) -> bool {
                matches!(self.0, $($tag)|*)
            }

            fn name(self) -> &'static str {
                match self.0 {
                    $($tag => $name,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

/// Tag of a message sent by the server.
///
/// Backend messages are a tag byte, a self-inclusive u32 length and the
/// payload. See
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

backend_codes! {
    AUTHENTICATION = b'R' => "Authentication",
    BACKEND_KEY_DATA = b'K' => "BackendKeyData",
    BIND_COMPLETE = b'2' => "BindComplete",
    CLOSE_COMPLETE = b'3' => "CloseComplete",
    COMMAND_COMPLETE = b'C' => "CommandComplete",
    COPY_DATA = b'd' => "CopyData",
    COPY_DONE = b'c' => "CopyDone",
    COPY_IN_RESPONSE = b'G' => "CopyInResponse",
    COPY_OUT_RESPONSE = b'H' => "CopyOutResponse",
    COPY_BOTH_RESPONSE = b'W' => "CopyBothResponse",
    DATA_ROW = b'D' => "DataRow",
    EMPTY_QUERY_RESPONSE = b'I' => "EmptyQueryResponse",
    ERROR_RESPONSE = b'E' => "ErrorResponse",
    FUNCTION_CALL_RESPONSE = b'V' => "FunctionCallResponse",
    /// Sent instead of authentication when a requested minor version or
    /// `_pq_.` option is unsupported.
    NEGOTIATE_PROTOCOL_VERSION = b'v' => "NegotiateProtocolVersion",
    NO_DATA = b'n' => "NoData",
    NOTICE_RESPONSE = b'N' => "NoticeResponse",
    NOTIFICATION_RESPONSE = b'A' => "NotificationResponse",
    PARAMETER_DESCRIPTION = b't' => "ParameterDescription",
    PARAMETER_STATUS = b'S' => "ParameterStatus",
    PARSE_COMPLETE = b'1' => "ParseComplete",
    PORTAL_SUSPENDED = b's' => "PortalSuspended",
    READY_FOR_QUERY = b'Z' => "ReadyForQuery",
    ROW_DESCRIPTION = b'T' => "RowDescription",
}

impl MessageCode {
    pub fn as_byte(self) -> u8 {
        self.0
    }
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend::MessageCode({})", self.0 as char)
    }
}

/// One complete backend message. The body excludes the tag and length.
#[derive(Debug, Clone, PartialEq)]
pub struct PgFrame {
    pub code: MessageCode,
    pub body: Bytes,
}

impl PgFrame {
    pub fn new(code: impl Into<MessageCode>, body: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }
}

impl std::fmt::Display for PgFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.code, self.body)
    }
}

/// Splits an accumulated byte buffer into backend frames.
///
/// The decoder holds no bytes itself: callers append whatever the socket
/// produced to a `BytesMut` and call [`FrameDecoder::decode`] until it
/// returns `Ok(None)`. Partial frames stay in the buffer untouched, so reads
/// may be split at any boundary.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE_BYTES,
        }
    }

    /// Caps the body size of a single frame.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Removes and returns the next complete frame from `src`, if one is
    /// fully buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<PgFrame>, ProtocolError> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        let code = MessageCode::from(tag);
        if !code.is_known() {
            return Err(ProtocolError::UnknownMessage(tag));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if (len as usize) < size_of::<u32>() {
            return Err(ProtocolError::InvalidLength(len));
        }

        let body_len = len as usize - size_of::<u32>();
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }

        let frame_len = 1 + len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);

        Ok(Some(PgFrame::new(code, frame.freeze())))
    }

    /// Decodes every complete frame in `src`, leaving any trailing partial
    /// frame in place.
    pub fn decode_all(&self, src: &mut BytesMut) -> Result<Vec<PgFrame>, ProtocolError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

pub fn read_cstring(bytes: &mut Bytes) -> Result<String, ProtocolError> {
    let Some(end) = bytes.iter().position(|&b| b == 0) else {
        return Err(ProtocolError::Malformed("null terminator missing"));
    };

    let bytes = bytes.split_to(end + 1);
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8"))
}

fn ensure(body: &Bytes, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    if body.remaining() < len {
        return Err(ProtocolError::Malformed(what));
    }
    Ok(())
}

/// Static metadata for one column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    /// Object ID of the owning table, or zero.
    pub table_oid: u32,
    /// Attribute number within the owning table, or zero.
    pub column_id: i16,
    pub type_oid: u32,
    /// Declared length; negative values denote variable-width types.
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl FieldDescriptor {
    /// Whether values in this column arrive as raw binary rather than text.
    pub fn is_binary(&self) -> bool {
        self.format == FormatCode::Binary
    }
}

/// Parses a RowDescription body.
pub fn parse_row_description(mut body: Bytes) -> Result<Vec<FieldDescriptor>, ProtocolError> {
    ensure(&body, 2, "row description truncated")?;
    let count = body.get_u16() as usize;

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstring(&mut body)?;
        ensure(&body, 18, "field description truncated")?;
        let table_oid = body.get_u32();
        let column_id = body.get_i16();
        let type_oid = body.get_u32();
        let type_size = body.get_i16();
        let type_modifier = body.get_i32();
        let format = FormatCode::try_from(body.get_u16())?;
        fields.push(FieldDescriptor {
            name,
            table_oid,
            column_id,
            type_oid,
            type_size,
            type_modifier,
            format,
        });
    }

    Ok(fields)
}

/// Parses a DataRow body into column values without copying them.
///
/// `None` is SQL NULL.
pub fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    ensure(&body, 2, "data row truncated")?;
    let count = body.get_u16() as usize;

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        ensure(&body, 4, "column length truncated")?;
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }

        let len = len as usize;
        ensure(&body, len, "column value truncated")?;
        values.push(Some(body.split_to(len)));
    }

    Ok(values)
}

/// The outcome reported for one successfully executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// Rows affected or returned, when the command tag reports a count.
    pub row_count: u64,
    /// The command word, e.g. `SELECT` or `INSERT`.
    pub command: String,
}

impl CommandComplete {
    /// Parses a command tag such as `SELECT 1`, `INSERT 0 5` or `CREATE TABLE`.
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let tag = read_cstring(&mut body)?;
        Ok(Self::from_tag(&tag))
    }

    pub fn from_tag(tag: &str) -> Self {
        let mut words = tag.split_whitespace();
        let command = words.next().unwrap_or_default().to_string();
        let row_count = words
            .next_back()
            .and_then(|w| w.parse().ok())
            .unwrap_or_default();
        Self { row_count, command }
    }

    /// The completion reported for an empty query string.
    pub fn empty() -> Self {
        Self {
            row_count: 0,
            command: String::new(),
        }
    }
}

/// The backend's transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn parse(body: &Bytes) -> Result<Self, ProtocolError> {
        match body.first() {
            Some(b'I') => Ok(TransactionStatus::Idle),
            Some(b'T') => Ok(TransactionStatus::InTransaction),
            Some(b'E') => Ok(TransactionStatus::Failed),
            _ => Err(ProtocolError::Malformed("unknown transaction status")),
        }
    }
}

/// Parses a ParameterStatus body into its name and value.
pub fn parse_parameter_status(mut body: Bytes) -> Result<(String, String), ProtocolError> {
    let name = read_cstring(&mut body)?;
    let value = read_cstring(&mut body)?;
    Ok((name, value))
}

/// Parses a BackendKeyData body into the process ID and secret key.
pub fn parse_backend_key_data(mut body: Bytes) -> Result<(u32, u32), ProtocolError> {
    ensure(&body, 8, "backend key data truncated")?;
    Ok((body.get_u32(), body.get_u32()))
}

/// An asynchronous `NOTIFY` delivered to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        ensure(&body, 4, "notification truncated")?;
        let process_id = body.get_u32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;
        Ok(Self {
            process_id,
            channel,
            payload,
        })
    }
}
