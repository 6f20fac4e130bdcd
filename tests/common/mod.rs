//! A scripted Postgres backend speaking over an in-memory duplex stream.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pg_raw::{Client, Connection, ConnectionBuilder, ConnectionEvent, StartupResponse};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

pub const PROCESS_ID: u32 = 4242;
pub const SECRET_KEY: u32 = 0xDEAD_BEEF;

/// A frontend message as seen by the server.
#[derive(Debug)]
pub struct Message {
    pub code: u8,
    pub body: Bytes,
}

/// The Parse/Bind/Describe/Execute/Sync batch of one statement.
#[derive(Debug)]
pub struct ExtendedQuery {
    pub query: String,
    pub param_formats: Vec<u16>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<u16>,
}

pub struct Stub {
    io: DuplexStream,
}

impl Stub {
    pub fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    pub fn into_inner(self) -> DuplexStream {
        self.io
    }

    pub async fn read_ssl_request(&mut self) {
        let len = self.io.read_u32().await.unwrap();
        let code = self.io.read_u32().await.unwrap();
        assert_eq!((len, code), (8, 80877103));
    }

    /// Reads the untagged startup message: protocol version and parameters.
    pub async fn read_startup(&mut self) -> (u32, Vec<(String, String)>) {
        let len = self.io.read_u32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        let mut body = Bytes::from(body);

        let version = body.get_u32();
        let mut params = Vec::new();
        loop {
            let key = cstring(&mut body);
            if key.is_empty() {
                break;
            }
            params.push((key, cstring(&mut body)));
        }
        (version, params)
    }

    pub async fn read_message(&mut self) -> Message {
        let code = self.io.read_u8().await.unwrap();
        let len = self.io.read_u32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        Message {
            code,
            body: body.into(),
        }
    }

    pub async fn expect_message(&mut self, code: u8) -> Bytes {
        let msg = self.read_message().await;
        assert_eq!(
            msg.code as char, code as char,
            "unexpected frontend message {msg:?}"
        );
        msg.body
    }

    /// Asserts the client sends nothing within a short grace period.
    pub async fn expect_silence(&mut self) {
        let mut byte = [0; 1];
        let res = tokio::time::timeout(Duration::from_millis(50), self.io.read(&mut byte)).await;
        assert!(res.is_err(), "client sent data unexpectedly");
    }

    pub async fn expect_extended_query(&mut self) -> ExtendedQuery {
        let mut parse = self.expect_message(b'P').await;
        assert_eq!(cstring(&mut parse), "", "statement should be unnamed");
        let query = cstring(&mut parse);
        assert_eq!(parse.get_u16(), 0, "no parameter types are declared");

        let mut bind = self.expect_message(b'B').await;
        assert_eq!(cstring(&mut bind), "");
        assert_eq!(cstring(&mut bind), "");
        let param_formats = (0..bind.get_u16()).map(|_| bind.get_u16()).collect();
        let params = (0..bind.get_u16())
            .map(|_| match bind.get_i32() {
                -1 => None,
                len => Some(bind.split_to(len as usize)),
            })
            .collect();
        let result_formats = (0..bind.get_u16()).map(|_| bind.get_u16()).collect();

        let describe = self.expect_message(b'D').await;
        assert_eq!(&describe[..], b"P\0");

        let mut execute = self.expect_message(b'E').await;
        assert_eq!(cstring(&mut execute), "");
        assert_eq!(execute.get_u32(), 0);

        self.expect_message(b'S').await;

        ExtendedQuery {
            query,
            param_formats,
            params,
            result_formats,
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Sends `bytes` one at a time, yielding between writes.
    pub async fn send_trickle(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.io.write_all(&[*b]).await.unwrap();
            tokio::task::yield_now().await;
        }
    }

    /// Answers a startup message for trust authentication.
    pub async fn accept(&mut self) -> Vec<(String, String)> {
        let (version, params) = self.read_startup().await;
        assert_eq!(version, 196608);
        self.send(&auth(0, b"")).await;
        self.finish_startup().await;
        params
    }

    pub async fn finish_startup(&mut self) {
        let mut out = BytesMut::new();
        out.put(parameter_status("server_version", "16.2"));
        out.put(parameter_status("client_encoding", "UTF8"));
        out.put(backend_key_data(PROCESS_ID, SECRET_KEY));
        out.put(ready(b'I'));
        self.send(&out).await;
    }

    /// Answers one statement: fields, rows and the completion tag.
    pub async fn respond_rows(&mut self, columns: &[&str], rows: &[&[Option<&str>]], tag: &str) {
        let mut out = BytesMut::new();
        out.put(frame(b'1', b""));
        out.put(frame(b'2', b""));
        out.put(row_description(columns));
        for row in rows {
            out.put(data_row(row));
        }
        out.put(command_complete(tag));
        out.put(ready(b'I'));
        self.send(&out).await;
    }
}

/// A connection established against a stub that accepted trust auth.
pub struct Harness {
    pub client: Client,
    /// The startup parameters the stub received.
    pub sent_params: Vec<(String, String)>,
    /// Payload of the Connect event.
    pub startup: StartupResponse,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub run: tokio::task::JoinHandle<pg_raw::Result<()>>,
    pub stub: Stub,
}

pub async fn connected(builder: ConnectionBuilder) -> Harness {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let mut stub = Stub::new(server_io);
        let params = stub.accept().await;
        (stub, params)
    });

    let (client, conn): (Client, Connection<DuplexStream>) =
        builder.connect(client_io).await.unwrap();
    let (stub, sent_params) = server.await.unwrap();

    let mut events = client.subscribe();
    let run = tokio::spawn(conn.run());

    let ConnectionEvent::Connect(startup) = next_event(&mut events).await else {
        panic!("first event should be Connect");
    };
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Ready));

    Harness {
        client,
        sent_params,
        startup,
        events,
        run,
        stub,
    }
}

pub fn cstring(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|b| *b == 0).expect("missing NUL");
    let s = String::from_utf8(buf.split_to(end).to_vec()).unwrap();
    buf.advance(1);
    s
}

pub fn frame(code: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u8(code);
    out.put_u32(body.len() as u32 + 4);
    out.put_slice(body);
    out.freeze()
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn auth(code: u32, data: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(code);
    body.put_slice(data);
    frame(b'R', &body)
}

pub fn parameter_status(name: &str, value: &str) -> Bytes {
    let mut body = BytesMut::new();
    put_cstr(&mut body, name);
    put_cstr(&mut body, value);
    frame(b'S', &body)
}

pub fn backend_key_data(process_id: u32, secret_key: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(process_id);
    body.put_u32(secret_key);
    frame(b'K', &body)
}

pub fn ready(status: u8) -> Bytes {
    frame(b'Z', &[status])
}

pub fn row_description(columns: &[&str]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(columns.len() as u16);
    for (i, name) in columns.iter().enumerate() {
        put_cstr(&mut body, name);
        body.put_u32(16384);
        body.put_i16(i as i16 + 1);
        body.put_u32(25);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_u16(0);
    }
    frame(b'T', &body)
}

pub fn data_row(values: &[Option<&str>]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(v) => {
                body.put_u32(v.len() as u32);
                body.put_slice(v.as_bytes());
            }
            None => body.put_i32(-1),
        }
    }
    frame(b'D', &body)
}

pub fn command_complete(tag: &str) -> Bytes {
    let mut body = BytesMut::new();
    put_cstr(&mut body, tag);
    frame(b'C', &body)
}

fn fields(code: u8, severity: &str, sqlstate: &str, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    for (tag, value) in [(b'S', severity), (b'V', severity), (b'C', sqlstate), (b'M', message)] {
        body.put_u8(tag);
        put_cstr(&mut body, value);
    }
    body.put_u8(0);
    frame(code, &body)
}

pub fn error_response(severity: &str, sqlstate: &str, message: &str) -> Bytes {
    fields(b'E', severity, sqlstate, message)
}

pub fn notice_response(message: &str) -> Bytes {
    fields(b'N', "NOTICE", "00000", message)
}

pub fn notification(process_id: u32, channel: &str, payload: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(process_id);
    put_cstr(&mut body, channel);
    put_cstr(&mut body, payload);
    frame(b'A', &body)
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed")
}
