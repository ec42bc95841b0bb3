//! Shared helpers for the integration tests.
//!
//! This provides a deterministic resolver with canned answers for a set
//! of well-known test names, throwaway HTTP and TLS servers on the
//! loopback interface, and a way to set up a validation authority
//! pointed at them.
#![allow(dead_code)]

use acme_va::challenge::key_authorization_digest;
use acme_va::challenge::key_authorization_hash;
use acme_va::resolver::{
    CaaRecord, DnsError, DnsErrorKind, LookupFuture, Resolver, ResolverAddrs,
};
use acme_va::{Challenge, ChallengeType, Config, ValidationAuthority};
use prometheus::Registry;
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair,
};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::rustls::crypto::ring as ring_provider;
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

//------------ Logging -------------------------------------------------------

/// Setup logging of events reported by the validators and the test suite.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to see only the audit log:
///   RUST_LOG=audit=INFO
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

//------------ Challenge Values ----------------------------------------------

pub const TOKEN: &str = "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0";
pub const THUMBPRINT: &str = "9jg46WB3rR_AHD-EBXdN7cBkH1WOu0tA3M9fm21mqTI";

pub const USER_AGENT: &str = "user agent 1.0";
pub const ACCOUNT_PREFIX: &str = "https://example.com/acme/acct/";
pub const ACCOUNT_URI: &str = "https://example.com/acme/acct/ExampleAccount";
pub const ACCOUNT_LABEL: &str = "_ujmmovf2vn55tgye";

/// A port no test server listens on, used as the HTTPS port.
pub const HTTPS_PORT: u16 = 5001;

pub fn key_authorization() -> String {
    format!("{}.{}", TOKEN, THUMBPRINT)
}

pub fn challenge(challenge_type: ChallengeType) -> Challenge {
    Challenge::new(challenge_type, TOKEN, key_authorization())
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

//------------ Validation Authority ------------------------------------------

fn no_reserved(_: IpAddr) -> bool {
    false
}

/// Returns a configuration for talking to test servers on `port`.
pub fn test_config(port: u16) -> Config {
    Config {
        http_port: port,
        https_port: HTTPS_PORT,
        tls_port: port,
        timeout: Duration::from_secs(5),
        dns_account_01_enabled: true,
        account_uri_prefixes: vec![ACCOUNT_PREFIX.into()],
        user_agent: USER_AGENT.into(),
        reserved_ip: no_reserved,
        ..Default::default()
    }
}

/// Creates an authority using the mock resolver and no remotes.
pub fn setup(config: Config) -> ValidationAuthority {
    ValidationAuthority::new(
        config,
        Arc::new(MockResolver),
        Vec::new(),
        &Registry::new(),
    )
    .unwrap()
}

//------------ MockResolver --------------------------------------------------

/// A resolver with canned answers.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockResolver;

fn resolver_addrs() -> ResolverAddrs {
    vec!["MockClient".into()]
}

impl Resolver for MockResolver {
    fn lookup_host<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<IpAddr>, ResolverAddrs)> {
        Box::pin(async move {
            let addrs: Vec<IpAddr> = match hostname {
                "always.invalid" => {
                    return Err(DnsError::new(
                        "A",
                        hostname,
                        DnsErrorKind::Rcode("NXDOMAIN".into()),
                    ))
                }
                "servfail.com" => {
                    return Err(DnsError::new(
                        "A",
                        hostname,
                        DnsErrorKind::Rcode("SERVFAIL".into()),
                    ))
                }
                "no-addresses.com" => vec![],
                "ipv6.localhost" => vec!["::1".parse().unwrap()],
                "ipv4.and.ipv6.localhost" => vec![
                    "::1".parse().unwrap(),
                    "127.0.0.1".parse().unwrap(),
                ],
                _ => vec!["127.0.0.1".parse().unwrap()],
            };
            Ok((addrs, resolver_addrs()))
        })
    }

    fn lookup_txt<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<String>, ResolverAddrs)> {
        Box::pin(async move {
            let name = hostname
                .strip_prefix(ACCOUNT_LABEL)
                .and_then(|name| name.strip_prefix('.'))
                .unwrap_or(hostname);
            let txts = match name {
                "_acme-challenge.servfail.com" => {
                    return Err(DnsError::new(
                        "TXT",
                        hostname,
                        DnsErrorKind::Rcode("SERVFAIL".into()),
                    ))
                }
                "_acme-challenge.good-dns01.com"
                | "_acme-challenge.no-authority-dns01.com" => {
                    vec![key_authorization_digest(&key_authorization())]
                }
                "_acme-challenge.good-among-many-dns01.com" => vec![
                    "a".into(),
                    key_authorization_digest(&key_authorization()),
                    "b".into(),
                ],
                "_acme-challenge.wrong-dns01.com" => vec!["a".into()],
                "_acme-challenge.wrong-many-dns01.com" => {
                    ["a", "b", "c", "d", "e"].map(String::from).to_vec()
                }
                "_acme-challenge.long-dns01.com" => vec!["a".repeat(250)],
                _ => vec![],
            };
            Ok((txts, resolver_addrs()))
        })
    }

    fn lookup_caa<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, Vec<CaaRecord>> {
        Box::pin(async move {
            let records = match hostname.trim_end_matches('.') {
                "caa-timeout.com" => {
                    return Err(DnsError::new(
                        "CAA",
                        hostname,
                        DnsErrorKind::Other("error".into()),
                    ))
                }
                "servfail.com" | "servfail.present.com" => {
                    return Err(DnsError::new(
                        "CAA",
                        hostname,
                        DnsErrorKind::Rcode("SERVFAIL".into()),
                    ))
                }
                "reserved.com" => vec![CaaRecord::new(0, "issue", "ca.com")],
                "critical.com" => vec![CaaRecord::new(1, "issue", "ca.com")],
                "present.com" | "present.servfail.com" => {
                    vec![CaaRecord::new(0, "issue", "letsencrypt.org")]
                }
                "multi-crit-present.com" => vec![
                    CaaRecord::new(1, "issue", "ca.com"),
                    CaaRecord::new(1, "issue", "letsencrypt.org"),
                ],
                "unknown-critical.com" => {
                    vec![CaaRecord::new(128, "foo", "bar")]
                }
                "unknown-critical2.com" => {
                    vec![CaaRecord::new(1, "foo", "bar")]
                }
                "unknown-noncritical.com" => {
                    vec![CaaRecord::new(0x7e, "foo", "bar")]
                }
                "present-with-parameter.com" => vec![CaaRecord::new(
                    0,
                    "issue",
                    "  letsencrypt.org  ;foo=bar;baz=bar",
                )],
                "unsatisfiable.com" => vec![CaaRecord::new(0, "issue", ";")],
                "wildcard-only.com" => vec![
                    CaaRecord::new(0, "issue", "letsencrypt.org"),
                    CaaRecord::new(0, "issuewild", "ca.com"),
                ],
                _ => vec![],
            };
            Ok(records)
        })
    }
}

//------------ TestServer ----------------------------------------------------

/// A server running on the loopback interface.
///
/// The server is shut down when this value is dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `serve` for every connection accepted on a fresh listener.
async fn spawn_server<F, Fut>(serve: F) -> TestServer
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(serve(sock));
        }
    });
    TestServer { addr, handle }
}

/// Returns an address nobody listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

//------------ HTTP Servers --------------------------------------------------

/// The parts of an HTTP request the handlers look at.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub path: String,
    pub host: String,
    pub user_agent: String,
}

/// What an HTTP test server should answer.
#[derive(Clone, Debug)]
pub enum Reply {
    /// A 200 response with this body.
    Body(String),

    /// An empty response with this status code.
    Status(u16),

    /// A 301 redirect to this location.
    Redirect(String),

    /// A 200 response with this body after five seconds.
    Slow(String),

    /// Never respond.
    Hang,
}

impl Reply {
    /// The body of a correct response.
    pub fn good() -> Self {
        Reply::Body(format!("{}\n\r \t", key_authorization()))
    }
}

/// Starts an HTTP server answering every request via `handler`.
pub async fn http_server<F>(handler: F) -> TestServer
where
    F: Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    spawn_server(move |sock| {
        let handler = handler.clone();
        async move {
            let _ = serve_http(sock, &*handler).await;
        }
    })
    .await
}

async fn serve_http<F>(mut sock: TcpStream, handler: &F) -> io::Result<()>
where
    F: Fn(&HttpRequest) -> Reply,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let len = sock.read(&mut chunk).await?;
        if len == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..len]);
    }

    let head = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = head.split("\r\n");
    let mut req = HttpRequest {
        path: lines
            .next()
            .and_then(|line| line.split(' ').nth(1))
            .unwrap_or_default()
            .into(),
        ..Default::default()
    };
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "host" => req.host = value.trim().into(),
                "user-agent" => req.user_agent = value.trim().into(),
                _ => {}
            }
        }
    }

    let (status, location, body) = match handler(&req) {
        Reply::Body(body) => (200, None, body),
        Reply::Status(status) => (status, None, String::new()),
        Reply::Redirect(location) => (301, Some(location), String::new()),
        Reply::Slow(body) => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (200, None, body)
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }
    };
    let mut response = format!("HTTP/1.1 {} Test\r\n", status);
    if let Some(location) = location {
        response.push_str(&format!("Location: {}\r\n", location));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    sock.write_all(response.as_bytes()).await?;
    sock.shutdown().await
}

//------------ TLS Servers ---------------------------------------------------

/// The OID of the acmeIdentifier extension.
const ACME_IDENTIFIER: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// The OID early drafts used for the acmeIdentifier extension.
const ACME_IDENTIFIER_OBSOLETE: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 30, 1];

fn der_octet_string(data: &[u8]) -> Vec<u8> {
    let mut res = vec![0x04, data.len() as u8];
    res.extend_from_slice(data);
    res
}

/// A correct acmeIdentifier extension for the test key authorization.
pub fn acme_extension() -> CustomExtension {
    CustomExtension::new_acme_identifier(&key_authorization_hash(
        &key_authorization(),
    ))
}

/// A correct extension using the obsolete OID.
pub fn obsolete_acme_extension() -> CustomExtension {
    let mut ext = CustomExtension::from_oid_content(
        ACME_IDENTIFIER_OBSOLETE,
        der_octet_string(&key_authorization_hash(&key_authorization())),
    );
    ext.set_criticality(true);
    ext
}

/// An acmeIdentifier extension that is not marked critical.
pub fn non_critical_acme_extension() -> CustomExtension {
    CustomExtension::from_oid_content(
        ACME_IDENTIFIER,
        der_octet_string(&key_authorization_hash(&key_authorization())),
    )
}

/// An acmeIdentifier extension for some other key authorization.
pub fn wrong_acme_extension() -> CustomExtension {
    CustomExtension::new_acme_identifier(&key_authorization_hash("wrong"))
}

/// Creates a self-signed certificate for the given names.
pub fn test_cert(
    names: &[&str],
    common_name: Option<&str>,
    extensions: Vec<CustomExtension>,
) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(
        names.iter().map(|name| name.to_string()).collect::<Vec<_>>(),
    )
    .unwrap();
    params.distinguished_name = DistinguishedName::new();
    if let Some(cn) = common_name {
        params.distinguished_name.push(DnType::CommonName, cn);
    }
    params.custom_extensions = extensions;
    let cert = params.self_signed(&key).unwrap();
    (
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
}

/// Starts a TLS server presenting the given certificate.
///
/// The server only agrees to the ALPN protocols given. If there are none,
/// it ignores ALPN altogether.
pub async fn tls_server(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    alpn_protocols: Vec<Vec<u8>>,
) -> TestServer {
    let provider = Arc::new(ring_provider::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    config.alpn_protocols = alpn_protocols;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    spawn_server(move |sock| {
        let acceptor = acceptor.clone();
        async move {
            if let Ok(mut stream) = acceptor.accept(sock).await {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
            }
        }
    })
    .await
}

/// Starts a TLS-ALPN-01 server presenting the given certificate.
pub async fn tls_alpn_server(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> TestServer {
    tls_server(cert, key, vec![b"acme-tls/1".to_vec()]).await
}

/// Starts a server that answers whatever it receives with `reply`.
pub async fn raw_server(reply: &'static [u8]) -> TestServer {
    spawn_server(move |mut sock| async move {
        let mut buf = [0u8; 1024];
        if sock.read(&mut buf).await.is_ok() {
            let _ = sock.write_all(reply).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
}

/// Starts a server that accepts connections but never says anything.
pub async fn silent_server() -> TestServer {
    spawn_server(|sock| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(sock);
    })
    .await
}
