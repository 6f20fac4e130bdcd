use bytes::{Buf, Bytes};
use scram::ScramClient;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    Error, PgErrorResponse, ProtocolError, Result,
    messages::backend::{self, PgFrame},
    startup::AuthenticationMode,
    stream::PgStream,
};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

pub(crate) enum AuthMessage {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password([u8; 4]),
    ScmCredential,
    Gss,
    GssContinue,
    Sspi,
    Sasl(Vec<String>),
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

impl std::fmt::Display for AuthMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMessage::Ok => write!(f, "AuthenticationOk"),
            AuthMessage::KerberosV5 => write!(f, "AuthenticationKerberosV5"),
            AuthMessage::CleartextPassword => write!(f, "AuthenticationCleartextPassword"),
            AuthMessage::Md5Password(_salt) => write!(f, "AuthenticationMD5Password"),
            AuthMessage::ScmCredential => write!(f, "AuthenticationSCMCredential"),
            AuthMessage::Gss => write!(f, "AuthenticationGSS"),
            AuthMessage::GssContinue => write!(f, "AuthenticationGSSContinue"),
            AuthMessage::Sspi => write!(f, "AuthenticationSSPI"),
            AuthMessage::Sasl(mechs) => write!(f, "AuthenticationSASL({})", mechs.join(",")),
            AuthMessage::SaslContinue(_) => write!(f, "AuthenticationSASLContinue"),
            AuthMessage::SaslFinal(_) => write!(f, "AuthenticationSASLFinal"),
        }
    }
}

impl TryFrom<PgFrame> for AuthMessage {
    type Error = Error;

    fn try_from(frame: PgFrame) -> Result<Self> {
        if frame.code != backend::MessageCode::AUTHENTICATION {
            return Err(ProtocolError::UnexpectedMessage(frame.code).into());
        }

        let mut body = frame.body;
        if body.remaining() < 4 {
            return Err(ProtocolError::Malformed("authentication request truncated").into());
        }

        let msg = match body.get_u32() {
            0 => AuthMessage::Ok,
            2 => AuthMessage::KerberosV5,
            3 => AuthMessage::CleartextPassword,
            5 => {
                let salt = body[..]
                    .try_into()
                    .map_err(|_| ProtocolError::Malformed("md5 salt must be 4 bytes"))?;
                AuthMessage::Md5Password(salt)
            }
            6 => AuthMessage::ScmCredential,
            7 => AuthMessage::Gss,
            8 => AuthMessage::GssContinue,
            9 => AuthMessage::Sspi,
            10 => {
                let mechs = body
                    .split(|b| *b == 0)
                    .take_while(|m| !m.is_empty())
                    .map(|m| String::from_utf8_lossy(m).into_owned())
                    .collect();
                AuthMessage::Sasl(mechs)
            }
            11 => AuthMessage::SaslContinue(body),
            12 => AuthMessage::SaslFinal(body),
            code => return Err(Error::UnsupportedAuthMethod(format!("code {code}"))),
        };
        Ok(msg)
    }
}

/// Reads frames until an authentication request arrives.
///
/// An ErrorResponse at this stage is the server rejecting the connection,
/// which is never retried.
pub(crate) async fn read_auth_message<S>(stream: &mut PgStream<S>) -> Result<AuthMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = stream.expect_frame().await?;
        match frame.code {
            backend::MessageCode::ERROR_RESPONSE => {
                return Err(Error::AuthenticationRejected(PgErrorResponse::new(frame.body)));
            }
            backend::MessageCode::NOTICE_RESPONSE => {
                debug!(notice = %PgErrorResponse::new(frame.body), "notice during authentication");
            }
            backend::MessageCode::NEGOTIATE_PROTOCOL_VERSION => {
                warn!("server does not support the requested protocol minor version");
            }
            _ => return AuthMessage::try_from(frame),
        }
    }
}

/// Computes the salted-hash response: `"md5" + md5(md5(password + user) + salt)`,
/// with both digests rendered as lowercase hex.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{password}{user}"));

    let mut outer = format!("{inner:x}").into_bytes();
    outer.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(outer))
}

/// Drives the authentication exchange until the server reports success.
///
/// Each server request is answered with exactly one client message. The
/// method is chosen by the server; unsupported methods fail immediately.
pub(crate) async fn authenticate<S>(
    stream: &mut PgStream<S>,
    user: &str,
    auth: &AuthenticationMode,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let password = || match auth {
        AuthenticationMode::Password(pw) => Ok(pw.as_str()),
        AuthenticationMode::Trust => Err(Error::PasswordRequired),
    };

    loop {
        let msg = read_auth_message(stream).await?;
        debug!(request = %msg, "authentication request");

        match msg {
            AuthMessage::Ok => return Ok(()),
            AuthMessage::CleartextPassword => {
                stream.put_password(password()?.as_bytes());
                stream.flush().await?;
            }
            AuthMessage::Md5Password(salt) => {
                let hashed = md5_password(user, password()?, &salt);
                stream.put_password(hashed.as_bytes());
                stream.flush().await?;
            }
            AuthMessage::Sasl(mechs) => {
                if !mechs.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(Error::UnsupportedAuthMethod(format!(
                        "SASL mechanisms [{}]",
                        mechs.join(", ")
                    )));
                }
                scram_exchange(stream, user, password()?).await?;
            }
            msg @ (AuthMessage::SaslContinue(_) | AuthMessage::SaslFinal(_)) => {
                return Err(Error::Authentication(format!(
                    "unexpected {msg} outside of a SASL exchange"
                )));
            }
            msg @ (AuthMessage::KerberosV5
            | AuthMessage::ScmCredential
            | AuthMessage::Gss
            | AuthMessage::GssContinue
            | AuthMessage::Sspi) => {
                return Err(Error::UnsupportedAuthMethod(msg.to_string()));
            }
        }
    }
}

/// Runs SCRAM-SHA-256 through the server's final message.
///
/// The server signature in AuthenticationSASLFinal is verified before
/// returning; the caller still has to see AuthenticationOk.
async fn scram_exchange<S>(stream: &mut PgStream<S>, user: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scram = ScramClient::new(user, password, None);
    let (scram, client_first) = scram.client_first();

    stream.put_sasl_initial(SCRAM_SHA_256, client_first.as_bytes());
    stream.flush().await?;

    let server_first = match read_auth_message(stream).await? {
        AuthMessage::SaslContinue(data) => data,
        other => return Err(unexpected_response(other)),
    };
    let server_first = sasl_text(&server_first)?;

    let scram = scram
        .handle_server_first(server_first)
        .map_err(|e| Error::Authentication(format!("scram handshake failed: {e}")))?;
    let (scram, client_final) = scram.client_final();

    stream.put_sasl_response(client_final.as_bytes());
    stream.flush().await?;

    let server_final = match read_auth_message(stream).await? {
        AuthMessage::SaslFinal(data) => data,
        other => return Err(unexpected_response(other)),
    };

    scram
        .handle_server_final(sasl_text(&server_final)?)
        .map_err(|e| Error::Authentication(format!("server signature rejected: {e}")))
}

fn unexpected_response(msg: AuthMessage) -> Error {
    Error::Authentication(format!("unexpected authentication response {msg}"))
}

fn sasl_text(data: &Bytes) -> Result<&str> {
    std::str::from_utf8(data)
        .map_err(|_| ProtocolError::Malformed("SASL data is not valid UTF-8").into())
}
