//! Byte transports a connection can run over.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tracing::{debug, warn};

use crate::Result;

/// Where to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    /// Full path to the server's socket file.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Target {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Target::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Socket file inside a Postgres socket directory, e.g.
    /// `/var/run/postgresql/.s.PGSQL.5432`.
    #[cfg(unix)]
    pub fn unix_dir(dir: impl Into<PathBuf>, port: u16) -> Self {
        Target::Unix(dir.into().join(format!(".s.PGSQL.{port}")))
    }

    pub(crate) fn host(&self) -> Option<&str> {
        match self {
            Target::Tcp { host, .. } => Some(host),
            #[cfg(unix)]
            Target::Unix(_) => None,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Target::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// TCP keepalive idle time and interval. `None` leaves the OS defaults untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: Duration,
    pub interval: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(31),
        }
    }
}

/// An open, not yet negotiated, connection to the server.
pub enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Socket {
    pub async fn open(target: &Target, keepalive: Option<Keepalive>) -> Result<Self> {
        debug!(%target, "opening transport");
        match target {
            Target::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                configure_tcp(&stream, keepalive);
                Ok(Socket::Tcp(stream))
            }
            #[cfg(unix)]
            Target::Unix(path) => Ok(Socket::Unix(tokio::net::UnixStream::connect(path).await?)),
        }
    }
}

fn configure_tcp(stream: &TcpStream, keepalive: Option<Keepalive>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    let Some(keepalive) = keepalive else {
        return;
    };

    let params = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&params) {
        warn!("failed to configure TCP keepalive: {e}");
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn test_target_display() {
        assert_eq!(Target::tcp("localhost", 5432).to_string(), "localhost:5432");
        #[cfg(unix)]
        assert_eq!(
            Target::unix_dir("/tmp", 5433),
            Target::Unix(PathBuf::from("/tmp/.s.PGSQL.5433"))
        );
    }

    #[tokio::test]
    async fn test_open_tcp_with_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let mut socket = Socket::open(&Target::tcp("127.0.0.1", port), Some(Keepalive::default()))
            .await
            .unwrap();
        let Socket::Tcp(tcp) = &socket else {
            panic!("expected a TCP socket");
        };
        assert!(tcp.nodelay().unwrap());
        assert!(SockRef::from(tcp).keepalive().unwrap());

        let mut buf = [0; 2];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }
}
