use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, info};

use crate::{
    Error, PgErrorResponse, ProtocolError, Result,
    connection::{Client, Connection, ConnectionState},
    messages::{backend, frontend},
    stream::PgStream,
    transport::{Keepalive, Socket, Target},
};

mod auth;
pub mod tls;

pub use auth::md5_password;
pub use tls::{Negotiated, TlsMode, TlsOptions};

/// The stream type produced by [`ConnectionBuilder::connect_to`].
pub type MaybeTlsSocket = Negotiated<Socket, TlsStream<Socket>>;

/// Credentials offered when the server asks for them.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// No password. Any password request fails with
    /// [`Error::PasswordRequired`].
    Trust,
    /// Used for cleartext, MD5 and SCRAM-SHA-256, whichever the server picks.
    Password(String),
}

impl std::fmt::Debug for AuthenticationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AuthenticationMode::Trust => "Trust",
            AuthenticationMode::Password(_) => "Password(<redacted>)",
        })
    }
}

/// Protocol version announced in the startup message, sent on the wire as
/// `major << 16 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    major: u16,
    minor: u16,
}

const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(3, 0);

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    pub fn code(&self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        CURRENT_VERSION
    }
}

impl From<u32> for ProtocolVersion {
    fn from(code: u32) -> Self {
        Self::new((code >> 16) as u16, code as u16)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the server reported between authentication and its first
/// ReadyForQuery.
#[derive(Debug, Clone, Default)]
pub struct StartupResponse {
    /// Identifies the backend in cancel requests, together with `secret_key`.
    pub process_id: u32,
    pub secret_key: u32,
    /// Run-time parameters such as `server_version` and `client_encoding`.
    pub parameters: HashMap<String, String>,
}

/// Connection settings and the entry points that open a connection.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    user: String,
    /// Falls back to `user` when unset.
    database: Option<String>,
    auth: AuthenticationMode,
    protocol: ProtocolVersion,
    /// Startup parameters other than `user` and `database`, in the order
    /// they are sent.
    options: Vec<(String, String)>,
    tls_mode: TlsMode,
    keepalive: Option<Keepalive>,
}

impl ConnectionBuilder {
    /// Creates a new connection builder with the specified user.
    ///
    /// Defaults to trust authentication, protocol version 3.0, the user name
    /// as database, UTF8 client encoding and no TLS.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();

        let options = vec![
            ("client_encoding".into(), "UTF8".into()),
            ("application_name".into(), env!("CARGO_PKG_NAME").into()),
        ];

        Self {
            user,
            database: None,
            auth: AuthenticationMode::Trust,
            protocol: CURRENT_VERSION,
            options,
            tls_mode: TlsMode::Disable,
            keepalive: Some(Keepalive::default()),
        }
    }

    /// Sets the database name to connect to.
    ///
    /// If not specified, defaults to the username sent at startup.
    pub fn database(mut self, db: impl Into<String>) -> Self {
        self.database = Some(db.into());
        self
    }

    /// Sets the username for authentication.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the authentication mode.
    pub fn auth(mut self, auth: AuthenticationMode) -> Self {
        self.auth = auth;
        self
    }

    /// Shorthand for `auth(AuthenticationMode::Password(..))`.
    pub fn password(self, password: impl Into<String>) -> Self {
        self.auth(AuthenticationMode::Password(password.into()))
    }

    /// Sets the application name.
    pub fn application_name(self, app: impl Into<String>) -> Self {
        self.add_option("application_name", app)
    }

    pub fn client_encoding(self, encoding: impl Into<String>) -> Self {
        self.add_option("client_encoding", encoding)
    }

    /// Sets the Postgres protocol version.
    pub fn protocol(mut self, protocol: impl Into<ProtocolVersion>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// TCP keepalive for [`ConnectionBuilder::connect_to`]; `None` disables it.
    pub fn keepalive(mut self, keepalive: Option<Keepalive>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Adds a startup parameter option, replacing an earlier value for the
    /// same key.
    pub fn add_option(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        let (key, val) = (key.into(), val.into());
        match key.as_str() {
            "user" => {
                self.user = val;
                return self;
            }
            "database" => return self.database(val),
            _ => {}
        }

        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = val,
            None => self.options.push((key, val)),
        }
        self
    }

    /// Startup parameters in the order they are sent, `user` and `database`
    /// first.
    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        let database = self.database.as_deref().unwrap_or(self.user.as_str());
        [("user", self.user.as_str()), ("database", database)]
            .into_iter()
            .chain(self.options.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }

        for (key, val) in self.options() {
            if key.is_empty() {
                return Err(Error::Config("startup parameter names must not be empty".into()));
            }
            if key.contains('\0') || val.contains('\0') {
                return Err(Error::Config(format!(
                    "startup parameter {key:?} contains a NUL byte"
                )));
            }
        }
        Ok(())
    }

    fn as_startup_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        frontend::frame(&mut buf, |buf| {
            buf.put_u32(self.protocol.code());

            for (key, val) in self.options() {
                frontend::put_cstring(buf, key.as_bytes());
                frontend::put_cstring(buf, val.as_bytes());
            }

            buf.put_u8(0);
        });

        buf.freeze()
    }

    /// Opens `target`, negotiates TLS according to the builder's
    /// [`TlsMode`] using rustls, and performs the startup handshake.
    pub async fn connect_to(
        &self,
        target: &Target,
        tls: &TlsOptions,
    ) -> Result<(Client, Connection<MaybeTlsSocket>)> {
        self.validate()?;
        debug!(state = ?ConnectionState::Connecting, %target, "connecting");

        let socket = Socket::open(target, self.keepalive).await?;

        let upgrade = match self.tls_mode {
            TlsMode::Disable => None,
            TlsMode::Prefer | TlsMode::Require => Some((
                TlsConnector::from(tls.client_config()?),
                tls.resolve_server_name(target.host())?,
            )),
        };

        self.connect_with_tls(socket, move |socket| async move {
            let Some((connector, server_name)) = upgrade else {
                return Err(std::io::Error::other("TLS is disabled"));
            };
            connector.connect(server_name, socket).await
        })
        .await
    }

    /// Establishes a Postgres connection with TLS upgrade.
    ///
    /// Sends an SSL request to the server and upgrades the connection using the
    /// provided async upgrade function if the server supports TLS. With
    /// [`TlsMode::Prefer`] a declining server leaves the stream in plaintext.
    pub async fn connect_with_tls<S, T, F, Fut>(
        &self,
        stream: S,
        upgrade_fn: F,
    ) -> Result<(Client, Connection<Negotiated<S, T>>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        self.validate()?;
        debug!(state = ?ConnectionState::TlsHandshake, mode = ?self.tls_mode, "negotiating TLS");

        let stream = tls::negotiate(stream, self.tls_mode, upgrade_fn).await?;
        self.connect(stream).await
    }

    /// Establishes a Postgres connection over the provided stream.
    ///
    /// Performs the startup handshake, handles authentication, and waits for
    /// the server to be ready for queries. The returned [`Connection`] must
    /// be driven with [`Connection::run`].
    pub async fn connect<S>(&self, stream: S) -> Result<(Client, Connection<S>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.validate()?;

        let mut stream = PgStream::from_stream(stream);
        let startup = self.startup(&mut stream).await?;

        info!(
            process_id = startup.process_id,
            server_version = startup.parameters.get("server_version").map(String::as_str),
            "connection established"
        );
        Ok(Connection::new(stream, startup))
    }

    async fn startup<S>(&self, stream: &mut PgStream<S>) -> Result<StartupResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(state = ?ConnectionState::StartupSent, user = %self.user, protocol = %self.protocol, "sending startup message");
        stream.put_bytes(&self.as_startup_message());
        stream.flush().await?;

        debug!(state = ?ConnectionState::Authenticating, "authenticating");
        auth::authenticate(stream, &self.user, &self.auth).await?;

        debug!(state = ?ConnectionState::AwaitingBackendData, "authenticated");
        let mut startup_res = StartupResponse::default();

        loop {
            let frame = stream.expect_frame().await?;
            match frame.code {
                backend::MessageCode::PARAMETER_STATUS => {
                    let (key, val) = backend::parse_parameter_status(frame.body)?;
                    startup_res.parameters.insert(key, val);
                }
                backend::MessageCode::BACKEND_KEY_DATA => {
                    let (process_id, secret_key) = backend::parse_backend_key_data(frame.body)?;
                    startup_res.process_id = process_id;
                    startup_res.secret_key = secret_key;
                }
                backend::MessageCode::NOTICE_RESPONSE => {
                    debug!(notice = %PgErrorResponse::new(frame.body), "notice during startup");
                }
                // e.g. the database does not exist
                backend::MessageCode::ERROR_RESPONSE => {
                    return Err(Error::Server(PgErrorResponse::new(frame.body)));
                }
                backend::MessageCode::READY_FOR_QUERY => {
                    backend::TransactionStatus::parse(&frame.body)?;
                    break;
                }
                code => return Err(ProtocolError::UnexpectedMessage(code).into()),
            }
        }

        Ok(startup_res)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    #[test]
    fn test_protocol_version() {
        let version = ProtocolVersion::default();
        assert_eq!((version.major(), version.minor()), (3, 0));
        assert_eq!(version.code(), 196608);
        assert_eq!(ProtocolVersion::from(196610), ProtocolVersion::new(3, 2));
        assert_eq!(ProtocolVersion::new(3, 2).to_string(), "3.2");
    }

    #[test]
    fn test_startup_message_layout() {
        let builder = ConnectionBuilder::new("alice")
            .database("db")
            .application_name("app")
            .add_option("search_path", "public");
        let mut msg = builder.as_startup_message();

        let len = msg.get_u32() as usize;
        assert_eq!(len, msg.len() + 4);
        assert_eq!(196608, msg.get_u32());
        assert_eq!(
            &msg[..],
            &b"user\0alice\0database\0db\0client_encoding\0UTF8\0\
               application_name\0app\0search_path\0public\0\0"[..]
        );
    }

    #[test]
    fn test_add_option_replaces() {
        let builder = ConnectionBuilder::new("alice")
            .client_encoding("LATIN1")
            .add_option("user", "bob");
        let options: Vec<_> = builder.options().collect();
        assert_eq!(options[0], ("user", "bob"));
        assert_eq!(options[1], ("database", "bob"));
        assert_eq!(options[2], ("client_encoding", "LATIN1"));
        assert_eq!(options.len(), 4);
    }

    #[test]
    fn test_database_follows_final_user() {
        let builder = ConnectionBuilder::new("alice").user("bob");
        let options: Vec<_> = builder.options().collect();
        assert_eq!(options[..2], [("user", "bob"), ("database", "bob")]);

        let builder = ConnectionBuilder::new("alice")
            .add_option("database", "db")
            .user("bob");
        let options: Vec<_> = builder.options().collect();
        assert_eq!(options[..2], [("user", "bob"), ("database", "db")]);
        assert_eq!(options.len(), 4);
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionBuilder::new("alice").validate().is_ok());
        assert!(matches!(
            ConnectionBuilder::new("").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ConnectionBuilder::new("alice")
                .add_option("options", "a\0b")
                .validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_password_not_in_debug() {
        let builder = ConnectionBuilder::new("alice").password("hunter2");
        assert!(!format!("{builder:?}").contains("hunter2"));
    }
}
