//! TLS upgrade negotiation.
//!
//! Postgres upgrades a plaintext connection in-band: the client sends an
//! untagged SSLRequest and the server answers with a single byte, `S` to
//! proceed with a TLS handshake or `N` to continue in plaintext.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls::{
    ClientConfig, RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use crate::{Error, ProtocolError, Result, messages::frontend};

const SSL_SUCCESS: u8 = b'S';
const SSL_FAILURE: u8 = b'N';

/// Whether to ask the server for TLS before the startup message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Never send an SSLRequest.
    #[default]
    Disable,
    /// Upgrade if the server accepts, otherwise continue in plaintext.
    Prefer,
    /// Fail the connection if the server declines.
    Require,
}

/// rustls settings used by [`crate::ConnectionBuilder::connect_to`] when
/// the builder's [`TlsMode`] asks for TLS.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the server certificate chain and host name.
    pub verify_certificates: bool,
    /// Trust anchors added on top of the bundled web PKI roots.
    pub root_certificates: Vec<CertificateDer<'static>>,
    /// Overrides the name presented for SNI and checked against the
    /// certificate. Defaults to the target host.
    pub server_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_certificates: true,
            root_certificates: Vec::new(),
            server_name: None,
        }
    }
}

impl TlsOptions {
    /// Builds the rustls client configuration for these options.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsNegotiation(e.to_string()))?;

        let config = if self.verify_certificates {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for cert in &self.root_certificates {
                roots
                    .add(cert.clone())
                    .map_err(|e| Error::TlsNegotiation(format!("invalid root certificate: {e}")))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
                .with_no_client_auth()
        };

        Ok(Arc::new(config))
    }

    pub(crate) fn resolve_server_name(&self, host: Option<&str>) -> Result<ServerName<'static>> {
        let name = self
            .server_name
            .as_deref()
            .or(host)
            .unwrap_or("localhost")
            .to_string();
        ServerName::try_from(name)
            .map_err(|e| Error::Config(format!("invalid TLS server name: {e}")))
    }
}

/// A stream that is either still plaintext or has been upgraded to TLS.
pub enum Negotiated<S, T> {
    Plain(S),
    Tls(T),
}

impl<S, T> Negotiated<S, T> {
    pub fn is_tls(&self) -> bool {
        matches!(self, Negotiated::Tls(_))
    }
}

impl<S, T> AsyncRead for Negotiated<S, T>
where
    S: AsyncRead + Unpin,
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Negotiated::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S, T> AsyncWrite for Negotiated<S, T>
where
    S: AsyncWrite + Unpin,
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Negotiated::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Negotiated::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(s) => Pin::new(s).poll_flush(cx),
            Negotiated::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Negotiated::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Performs the SSLRequest exchange and, if accepted, hands the stream to
/// `upgrade_fn` for the TLS handshake.
///
/// With [`TlsMode::Disable`] nothing is written and the stream is returned
/// untouched.
pub async fn negotiate<S, T, F, Fut>(
    mut stream: S,
    mode: TlsMode,
    upgrade_fn: F,
) -> Result<Negotiated<S, T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    if mode == TlsMode::Disable {
        return Ok(Negotiated::Plain(stream));
    }

    stream.write_all(frontend::SSL_REQUEST).await?;
    stream.flush().await?;

    let mut buf = [0; 1];
    if stream.read(&mut buf).await? == 0 {
        return Err(ProtocolError::UnexpectedEof.into());
    }

    match buf[0] {
        SSL_SUCCESS => {
            debug!("server accepted TLS, starting handshake");
            let upgraded = upgrade_fn(stream)
                .await
                .map_err(|e| Error::TlsNegotiation(e.to_string()))?;
            Ok(Negotiated::Tls(upgraded))
        }
        SSL_FAILURE if mode == TlsMode::Prefer => {
            debug!("server declined TLS, continuing in plaintext");
            Ok(Negotiated::Plain(stream))
        }
        SSL_FAILURE => Err(Error::TlsRequired),
        res => Err(ProtocolError::UnexpectedResponse(res).into()),
    }
}

/// Accepts any server certificate. Only used when verification is turned
/// off explicitly.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
