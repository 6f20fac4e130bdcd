use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    Error, ProtocolError, Result,
    messages::{
        backend::{FrameDecoder, PgFrame},
        frontend::{self, FormatCode, Param, TargetKind, put_cstring},
    },
};

/// Initial read buffer size; grown on demand by the decoder.
const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Requested encoding of result columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResultFormat {
    /// All columns as text (the server default).
    #[default]
    Text,
    /// All columns as raw binary.
    Binary,
    /// One format code per result column.
    Mixed(Vec<FormatCode>),
}

/// A Postgres protocol stream: buffered message construction on the way
/// out, resumable frame decoding on the way in.
///
/// Outgoing messages accumulate in a write buffer until [`PgStream::flush`].
/// Incoming bytes accumulate in a read buffer and are only handed out as
/// complete frames.
pub struct PgStream<S> {
    stream: S,
    write_buf: BytesMut,
    read_buf: BytesMut,
    decoder: FrameDecoder,
}

impl<S> PgStream<S> {
    /// Creates a new Postgres stream from an underlying stream.
    pub fn from_stream(stream: S) -> Self {
        PgStream {
            stream,
            write_buf: BytesMut::new(),
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            decoder: FrameDecoder::new(),
        }
    }

    /// Consumes the stream and returns the underlying stream and any
    /// unflushed outgoing bytes.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.write_buf.to_vec())
    }

    /// Bytes queued but not yet flushed.
    pub fn pending(&self) -> &[u8] {
        &self.write_buf
    }

    pub fn put_bytes(&mut self, src: &[u8]) -> &mut Self {
        self.write_buf.put(src);
        self
    }

    /// Adds a Parse message to the buffer for prepared statement creation.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for the prepared statement (empty for unnamed)
    /// * `stmt` - SQL statement text
    /// * `param_types` - Parameter type OIDs (empty to let the server infer)
    pub fn put_parse(
        &mut self,
        name: impl AsRef<str>,
        stmt: impl AsRef<str>,
        param_types: &[u32],
    ) -> &mut Self {
        frontend::MessageCode::PARSE.frame(&mut self.write_buf, |b| {
            put_cstring(b, name.as_ref().as_bytes());
            put_cstring(b, stmt.as_ref().as_bytes());

            b.put_u16(param_types.len() as u16);
            for param_type in param_types {
                b.put_u32(*param_type);
            }
        });
        self
    }

    /// Adds a Describe message to the buffer.
    pub fn put_describe(&mut self, target: &TargetKind) -> &mut Self {
        let (kind, name) = target.split();
        frontend::MessageCode::DESCRIBE.frame(&mut self.write_buf, |b| {
            b.put_u8(kind);
            put_cstring(b, name.as_bytes());
        });
        self
    }

    /// Adds a Bind message to the buffer for binding parameters to a prepared statement.
    ///
    /// # Arguments
    ///
    /// * `portal_name` - Name for the portal (empty for unnamed)
    /// * `stmt_name` - Name of the prepared statement to bind
    /// * `params` - Parameter values; each one's variant picks its format code
    /// * `result_format` - Desired format for result columns
    pub fn put_bind(
        &mut self,
        portal_name: impl AsRef<str>,
        stmt_name: impl AsRef<str>,
        params: &[Param],
        result_format: &ResultFormat,
    ) -> &mut Self {
        frontend::MessageCode::BIND.frame(&mut self.write_buf, |b| {
            put_cstring(b, portal_name.as_ref().as_bytes());
            put_cstring(b, stmt_name.as_ref().as_bytes());

            // Format codes can be zero to indicate that there are no parameters
            // or that the parameters all use the default format (text); or one,
            // in which case the specified format code is applied to all
            // parameters; or it can equal the actual number of parameters.
            match params {
                [] => b.put_u16(0),
                [first, rest @ ..]
                    if rest.iter().all(|p| p.format_code() == first.format_code()) =>
                {
                    if first.format_code() == FormatCode::Text {
                        b.put_u16(0);
                    } else {
                        b.put_u16(1);
                        b.put_u16(first.format_code().into());
                    }
                }
                _ => {
                    b.put_u16(params.len() as u16);
                    for param in params {
                        b.put_u16(param.format_code().into());
                    }
                }
            };

            b.put_u16(params.len() as u16);
            for param in params {
                param.encode(b);
            }

            match result_format {
                ResultFormat::Text => b.put_u16(0),
                ResultFormat::Binary => {
                    b.put_u16(1);
                    b.put_u16(FormatCode::Binary.into());
                }
                ResultFormat::Mixed(codes) => {
                    b.put_u16(codes.len() as u16);
                    for code in codes {
                        b.put_u16((*code).into());
                    }
                }
            }
        });
        self
    }

    /// Adds an Execute message to the buffer for executing a bound portal.
    ///
    /// `max_rows` of zero means unlimited.
    pub fn put_execute(&mut self, name: impl AsRef<str>, max_rows: u32) -> &mut Self {
        frontend::MessageCode::EXECUTE.frame(&mut self.write_buf, |b| {
            put_cstring(b, name.as_ref().as_bytes());
            b.put_u32(max_rows);
        });
        self
    }

    /// Adds a Sync message to the buffer to end an extended query protocol sequence.
    pub fn put_sync(&mut self) -> &mut Self {
        frontend::MessageCode::SYNC.frame(&mut self.write_buf, |_| {});
        self
    }

    /// Adds a PasswordMessage carrying a cleartext or hashed password.
    pub fn put_password(&mut self, password: &[u8]) -> &mut Self {
        frontend::MessageCode::PASSWORD_MESSAGE.frame(&mut self.write_buf, |b| {
            put_cstring(b, password);
        });
        self
    }

    /// Adds a SASLInitialResponse naming the selected mechanism.
    pub fn put_sasl_initial(&mut self, mechanism: &str, data: &[u8]) -> &mut Self {
        frontend::MessageCode::SASL_RESPONSE.frame(&mut self.write_buf, |b| {
            put_cstring(b, mechanism.as_bytes());
            b.put_u32(data.len() as u32);
            b.put_slice(data);
        });
        self
    }

    /// Adds a SASLResponse for a subsequent round of the exchange.
    pub fn put_sasl_response(&mut self, data: &[u8]) -> &mut Self {
        frontend::MessageCode::SASL_RESPONSE.frame(&mut self.write_buf, |b| {
            b.put_slice(data);
        });
        self
    }

    /// Adds a CopyFail message, aborting a COPY FROM STDIN.
    pub fn put_copy_fail(&mut self, reason: impl AsRef<str>) -> &mut Self {
        frontend::MessageCode::COPY_FAIL.frame(&mut self.write_buf, |b| {
            put_cstring(b, reason.as_ref().as_bytes());
        });
        self
    }

    /// Adds a Terminate message announcing a graceful disconnect.
    pub fn put_terminate(&mut self) -> &mut Self {
        frontend::MessageCode::TERMINATE.frame(&mut self.write_buf, |_| {});
        self
    }
}

impl<S: AsyncWrite + Unpin> PgStream<S> {
    /// Flushes the buffered messages to the stream.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        trace!(bytes = self.write_buf.len(), "flushing");
        self.stream.write_all_buf(&mut self.write_buf).await?;
        self.stream.flush().await
    }

    /// Shuts down the write half of the underlying stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

impl<S: AsyncRead + Unpin> PgStream<S> {
    /// Reads the next complete backend frame.
    ///
    /// Returns `Ok(None)` if the peer closed the stream on a frame boundary.
    /// Only one socket read is ever outstanding, and every byte read is kept
    /// in the read buffer, so this future is cancel-safe: dropping it never
    /// loses data.
    pub async fn read_frame(&mut self) -> Result<Option<PgFrame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                trace!(code = %frame.code, len = frame.body.len(), "received frame");
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(ProtocolError::UnexpectedEof));
            }
        }
    }

    /// Like [`PgStream::read_frame`], but treats end of stream as an error.
    pub async fn expect_frame(&mut self) -> Result<PgFrame> {
        self.read_frame()
            .await?
            .ok_or(Error::Protocol(ProtocolError::UnexpectedEof))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, Bytes};

    use super::*;
    use crate::messages::backend::MessageCode;

    /// Helper macro for asserting a slice or string from the buffer.
    /// Usage: `assert_buf_eq!(buf, b"STMT\0");`
    macro_rules! assert_buf_eq {
        ($buf:expr, $expected:expr) => {{
            let len = $expected.len();
            let got = $buf.copy_to_bytes(len);
            assert_eq!(&$expected[..], &got[..]);
        }};
    }

    fn written(pg_stream: &PgStream<Vec<u8>>) -> Bytes {
        Bytes::copy_from_slice(pg_stream.pending())
    }

    #[test]
    fn test_put_parse() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_parse("STMT", "SELECT 1", &[0]);
        let mut buf = written(&pg_stream);

        assert_eq!(b'P', buf.get_u8());
        assert_eq!(24, buf.get_u32());
        assert_buf_eq!(buf, b"STMT\0");
        assert_buf_eq!(buf, b"SELECT 1\0");
        assert_eq!(1, buf.get_u16());
        assert_eq!(0, buf.get_u32());
    }

    #[test]
    fn test_put_parse_without_types() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_parse("", "SELECT 1", &[]);
        let mut buf = written(&pg_stream);

        assert_eq!(b'P', buf.get_u8());
        assert_eq!(16, buf.get_u32());
        assert_buf_eq!(buf, b"\0");
        assert_buf_eq!(buf, b"SELECT 1\0");
        assert_eq!(0, buf.get_u16());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_describe_portal() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_describe(&TargetKind::new_portal("PORTAL"));
        let mut buf = written(&pg_stream);

        assert_eq!(b'D', buf.get_u8());
        assert_eq!(12, buf.get_u32());
        assert_eq!(b'P', buf.get_u8());
        assert_buf_eq!(buf, b"PORTAL\0");
    }

    #[test]
    fn test_put_bind_mixed_formats() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_bind(
            "",
            "",
            &[Param::from(vec![0u8]), Param::Null, Param::from("ab")],
            &ResultFormat::Text,
        );
        let mut buf = written(&pg_stream);

        assert_eq!(b'B', buf.get_u8());
        assert_eq!(33, buf.get_u32());
        assert_buf_eq!(buf, b"\0");
        assert_buf_eq!(buf, b"\0");

        assert_eq!(3, buf.get_u16());
        assert_eq!(1, buf.get_u16());
        assert_eq!(0, buf.get_u16());
        assert_eq!(0, buf.get_u16());

        assert_eq!(3, buf.get_u16());
        assert_eq!(1, buf.get_u32());
        assert_eq!(0, buf.get_u8());
        assert_eq!(-1, buf.get_i32());
        assert_eq!(2, buf.get_u32());
        assert_buf_eq!(buf, b"ab");

        assert_eq!(0, buf.get_u16());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_bind_all_text_uses_default_format() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_bind("", "", &[Param::from("1")], &ResultFormat::Binary);
        let mut buf = written(&pg_stream);

        assert_eq!(b'B', buf.get_u8());
        assert_eq!(19, buf.get_u32());
        assert_buf_eq!(buf, b"\0\0");
        assert_eq!(0, buf.get_u16());
        assert_eq!(1, buf.get_u16());
        assert_eq!(1, buf.get_u32());
        assert_buf_eq!(buf, b"1");
        assert_eq!(1, buf.get_u16());
        assert_eq!(1, buf.get_u16());
    }

    #[test]
    fn test_put_execute() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_execute("PORTAL", 0);
        let mut buf = written(&pg_stream);

        assert_eq!(b'E', buf.get_u8());
        assert_eq!(15, buf.get_u32());
        assert_buf_eq!(buf, b"PORTAL\0");
        assert_eq!(0, buf.get_u32());
    }

    #[test]
    fn test_put_sync() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_sync();
        let mut buf = written(&pg_stream);

        assert_eq!(b'S', buf.get_u8());
        assert_eq!(4, buf.get_u32());
    }

    #[test]
    fn test_put_sasl_initial() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_sasl_initial("SCRAM-SHA-256", b"n,,n=u,r=abc");
        let mut buf = written(&pg_stream);

        assert_eq!(b'p', buf.get_u8());
        assert_eq!(4 + 14 + 4 + 12, buf.get_u32());
        assert_buf_eq!(buf, b"SCRAM-SHA-256\0");
        assert_eq!(12, buf.get_u32());
        assert_buf_eq!(buf, b"n,,n=u,r=abc");
    }

    #[test]
    fn test_put_password() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_password(b"hunter2");
        let mut buf = written(&pg_stream);

        assert_eq!(b'p', buf.get_u8());
        assert_eq!(12, buf.get_u32());
        assert_buf_eq!(buf, b"hunter2\0");
    }

    #[tokio::test]
    async fn test_flush() {
        let mut pg_stream = PgStream::from_stream(Vec::<u8>::new());
        pg_stream.put_sync().put_terminate();
        pg_stream.flush().await.unwrap();

        let (stream, pending) = pg_stream.into_parts();
        assert!(pending.is_empty());
        assert_eq!(stream, vec![b'S', 0, 0, 0, 4, b'X', 0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn test_read_frame() {
        let stream = vec![b'Z', 0, 0, 0, 5, b'I'];
        let mut pg_stream = PgStream::<&[u8]>::from_stream(stream.as_ref());
        let frame = pg_stream.read_frame().await.unwrap().unwrap();

        assert_eq!(frame.code, MessageCode::READY_FOR_QUERY);
        assert_eq!(frame.body.as_ref(), &[b'I']);
        assert!(pg_stream.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let stream = vec![b'Z', 0, 0, 0, 5];
        let mut pg_stream = PgStream::<&[u8]>::from_stream(stream.as_ref());
        let err = pg_stream.read_frame().await.unwrap_err();

        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_frame_across_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut pg_stream = PgStream::from_stream(client);

        let reader = tokio::spawn(async move {
            let a = pg_stream.expect_frame().await.unwrap();
            let b = pg_stream.expect_frame().await.unwrap();
            (a, b)
        });

        for chunk in [&[b'1', 0][..], &[0, 0, 4, b'C', 0, 0][..], &[0, 6, b'X', 0][..]] {
            server.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }

        let (a, b) = reader.await.unwrap();
        assert_eq!(a.code, MessageCode::PARSE_COMPLETE);
        assert_eq!(b.code, MessageCode::COMMAND_COMPLETE);
        assert_eq!(b.body.as_ref(), b"X\0");
    }
}
