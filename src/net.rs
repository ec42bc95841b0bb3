//! Establishing connections to validation targets.
//!
//! All connections made during validation go through this module. Dialing
//! shaves [`DIAL_MARGIN`] off the deadline so that a timeout while
//! connecting can be told apart from a timeout while waiting for a
//! response. TLS connections accept any certificate: the peer does not
//! have a certificate yet, that is the point of validating it.
//!
//! Failures are collected in [`NetError`] which knows how to turn itself
//! into the [`Problem`] handed back to the requester.

use crate::problem::Problem;
use core::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring as ring_provider, verify_tls12_signature, verify_tls13_signature,
    CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, InvalidMessage, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tracing::trace;

//------------ Module Configuration ------------------------------------------

/// How much earlier than the overall deadline dialing gives up.
pub const DIAL_MARGIN: Duration = Duration::from_millis(10);

//------------ connect_tcp ---------------------------------------------------

/// Opens a TCP connection.
///
/// Gives up [`DIAL_MARGIN`] before `deadline` with
/// [`NetError::ConnectTimeout`].
pub async fn connect_tcp(
    addr: SocketAddr,
    deadline: Instant,
) -> Result<TcpStream, NetError> {
    let dial_deadline = deadline.checked_sub(DIAL_MARGIN).unwrap_or(deadline);
    trace!(%addr, "dialing");
    match timeout_at(dial_deadline, TcpStream::connect(addr)).await {
        Ok(Ok(sock)) => Ok(sock),
        Ok(Err(err)) => Err(NetError::Dial(err)),
        Err(_) => Err(NetError::ConnectTimeout),
    }
}

//------------ connect_tls ---------------------------------------------------

/// Performs a TLS handshake over an established connection.
///
/// `server_name` is sent as SNI. The handshake has to complete before
/// `deadline`, otherwise [`NetError::ReadTimeout`] is returned.
pub async fn connect_tls(
    config: Arc<ClientConfig>,
    server_name: &str,
    sock: TcpStream,
    deadline: Instant,
) -> Result<TlsStream<TcpStream>, NetError> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| NetError::InvalidServerName(server_name.into()))?;
    let connector = TlsConnector::from(config);
    match timeout_at(deadline, connector.connect(name, sock)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(NetError::from(err)),
        Err(_) => Err(NetError::ReadTimeout),
    }
}

//------------ insecure_client_config ----------------------------------------

/// Creates a TLS client configuration that accepts any certificate.
///
/// Handshake signatures are still checked, so the peer must possess the
/// private key of the certificate it presents.
pub fn insecure_client_config(
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<ClientConfig>, NetError> {
    let provider = Arc::new(ring_provider::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(NetError::Tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols;
    Ok(Arc::new(config))
}

/// A certificate verifier that accepts every certificate.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

//------------ NetError ------------------------------------------------------

/// Something went wrong talking to a validation target.
#[derive(Debug)]
pub enum NetError {
    /// Establishing the TCP connection failed.
    Dial(io::Error),

    /// The deadline passed while establishing the TCP connection.
    ConnectTimeout,

    /// The deadline passed while reading from an established connection.
    ReadTimeout,

    /// The deadline passed while waiting for an HTTP response.
    ResponseTimeout,

    /// Reading or writing an established connection failed.
    Io(io::Error),

    /// The TLS handshake failed.
    Tls(rustls::Error),

    /// The name to send as SNI is not a valid DNS name.
    InvalidServerName(String),
}

impl NetError {
    /// Returns whether the error happened while dialing.
    ///
    /// Only these errors allow falling back to another address.
    pub fn is_dial(&self) -> bool {
        matches!(*self, NetError::Dial(_) | NetError::ConnectTimeout)
    }

    /// Converts the error into the problem reported to the requester.
    pub fn problem(&self) -> Problem {
        match *self {
            NetError::Dial(ref err) => Problem::connection(io_detail(err, true)),
            NetError::Io(ref err) => Problem::connection(io_detail(err, false)),
            NetError::ConnectTimeout => {
                Problem::connection(CONNECT_TIMEOUT_DETAIL)
            }
            NetError::ReadTimeout => Problem::connection(READ_TIMEOUT_DETAIL),
            NetError::ResponseTimeout => Problem::connection(
                "Timeout after connect (your server may be slow or overloaded)",
            ),
            NetError::Tls(rustls::Error::InvalidMessage(
                InvalidMessage::InvalidContentType,
            )) => Problem::tls("Server only speaks HTTP, not TLS"),
            NetError::Tls(ref err) => {
                Problem::tls(format!("Error during TLS handshake: {}", err))
            }
            NetError::InvalidServerName(ref name) => {
                Problem::malformed(format!("Invalid server name {:?}", name))
            }
        }
    }
}

const CONNECT_TIMEOUT_DETAIL: &str =
    "Timeout during connect (likely firewall problem)";
const READ_TIMEOUT_DETAIL: &str =
    "Timeout during read (your server may be slow or overloaded)";

fn io_detail(err: &io::Error, dialing: bool) -> &'static str {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => "Connection refused",
        io::ErrorKind::ConnectionReset => "Connection reset by peer",
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            "Network unreachable"
        }
        io::ErrorKind::TimedOut if dialing => CONNECT_TIMEOUT_DETAIL,
        io::ErrorKind::TimedOut => READ_TIMEOUT_DETAIL,
        _ => "Error getting validation data",
    }
}

//--- From

impl From<io::Error> for NetError {
    /// Converts an I/O error from an established connection.
    ///
    /// TLS streams report handshake failures as I/O errors wrapping the
    /// rustls error. These are unwrapped into [`NetError::Tls`].
    fn from(err: io::Error) -> Self {
        let is_tls = err
            .get_ref()
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false);
        if is_tls {
            if let Some(inner) = err.into_inner() {
                if let Ok(tls) = inner.downcast::<rustls::Error>() {
                    return NetError::Tls(*tls);
                }
            }
            return NetError::Io(io::Error::other("TLS error"));
        }
        NetError::Io(err)
    }
}

//--- Display and Error

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NetError::Dial(ref err) => write!(f, "dial failed: {}", err),
            NetError::ConnectTimeout => f.write_str("timeout during connect"),
            NetError::ReadTimeout => f.write_str("timeout during read"),
            NetError::ResponseTimeout => {
                f.write_str("timeout waiting for response")
            }
            NetError::Io(ref err) => fmt::Display::fmt(err, f),
            NetError::Tls(ref err) => fmt::Display::fmt(err, f),
            NetError::InvalidServerName(ref name) => {
                write!(f, "invalid server name {:?}", name)
            }
        }
    }
}

impl std::error::Error for NetError {}

//============ Tests =========================================================
