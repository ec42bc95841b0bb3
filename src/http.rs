//! The HTTP-01 validator.
//!
//! The validator fetches `/.well-known/acme-challenge/<token>` from the
//! host over plain HTTP and compares the body with the key authorization.
//!
//! Redirects are followed by hand rather than by the HTTP client. Each
//! hop is checked against a restrictive policy and its host is resolved
//! afresh, producing a new validation record. Only domain names on the
//! configured HTTP and HTTPS ports are acceptable redirect targets.
//!
//! If the very first connection attempt fails while dialing and the host
//! has both IPv6 and IPv4 addresses, the request is retried once against
//! the IPv4 address.

use crate::challenge::ValidationRecord;
use crate::config::Config;
use crate::identifier::Identifier;
use crate::metrics::Metrics;
use crate::net::{connect_tcp, connect_tls, insecure_client_config, NetError};
use crate::problem::Problem;
use crate::resolver::Resolver;
use crate::target::{resolve_target, ValidationTarget};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{header, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use url::{Host, Url};

//------------ Module Configuration ------------------------------------------

/// The path prefix of the challenge resource.
pub const WELL_KNOWN_PATH: &str = "/.well-known/acme-challenge/";

/// The number of body octets read from a response.
///
/// A body reaching this size is rejected.
pub const MAX_RESPONSE_SIZE: usize = 128;

/// The number of redirects followed before giving up.
pub const MAX_REDIRECT: usize = 10;

//------------ validate_http01 -----------------------------------------------

/// Validates an HTTP-01 challenge.
///
/// The response body with trailing whitespace removed has to be equal to
/// `key_authorization`.
#[allow(clippy::too_many_arguments)]
pub async fn validate_http01(
    resolver: &dyn Resolver,
    config: &Config,
    metrics: &Metrics,
    ident: &Identifier,
    token: &str,
    key_authorization: &str,
    deadline: Instant,
    records: &mut Vec<ValidationRecord>,
) -> Result<(), Problem> {
    if ident.as_dns().is_none() {
        info!(%ident, "Identifier type for HTTP-01 challenge was not DNS");
        return Err(Problem::malformed(
            "Identifier type for HTTP-01 challenge was not DNS",
        ));
    }
    let path = format!("{}{}", WELL_KNOWN_PATH, token);
    let body = fetch_http(
        resolver,
        config,
        metrics,
        &ident.lookup_name(),
        &path,
        deadline,
        records,
    )
    .await?;

    let body = String::from_utf8_lossy(&body);
    let found = body.trim_end_matches([' ', '\t', '\r', '\n']);
    if found != key_authorization {
        return Err(Problem::unauthorized(format!(
            "The key authorization file from the server did not match this \
             challenge {:?} != {:?}",
            key_authorization, found
        )));
    }
    Ok(())
}

//------------ fetch_http ----------------------------------------------------

/// Fetches a resource from a host, following redirects.
///
/// Returns the body of the final response. Every contact with a host
/// appends a record to `records`.
async fn fetch_http(
    resolver: &dyn Resolver,
    config: &Config,
    metrics: &Metrics,
    host: &str,
    path: &str,
    deadline: Instant,
    records: &mut Vec<ValidationRecord>,
) -> Result<Vec<u8>, Problem> {
    let mut request = FetchRequest {
        scheme: Scheme::Http,
        host: host.into(),
        port: config.http_port,
        path: path.into(),
    };
    let mut target = resolve_target(
        resolver,
        config.reserved_ip,
        host,
        request.port,
        path,
        deadline,
    )
    .await?;
    info!(
        target: "audit",
        url = %request.url(),
        "Attempting to validate HTTP-01"
    );

    let mut redirects = 0;
    loop {
        let url = request.url();
        let mut used = target_url(&request, &target);
        records.push(target.record(Some(used.clone())));

        let fetched = match fetch_once(config, &request, &target, deadline).await
        {
            Ok(fetched) => fetched,
            Err(err) if redirects == 0 && err.is_dial() && !target.exhausted() => {
                debug!(url = %used, error = %err, "dial failed, trying fallback address");
                target
                    .advance()
                    .map_err(|err| Problem::connection(err.to_string()))?;
                metrics.http01_fallbacks.inc();
                used = target_url(&request, &target);
                records.push(target.record(Some(used.clone())));
                fetch_once(config, &request, &target, deadline)
                    .await
                    .map_err(|err| fetching(&used, err.problem()))?
            }
            Err(err) => return Err(fetching(&used, err.problem())),
        };

        let (status, body) = match fetched {
            Fetched::Redirect(location) => {
                let next = Url::parse(&url)
                    .and_then(|base| base.join(&location))
                    .map_err(|err| {
                        fetching(
                            &used,
                            Problem::connection(format!(
                                "Invalid redirect location {:?}: {}",
                                location, err
                            )),
                        )
                    })?;
                if redirects > MAX_REDIRECT {
                    return Err(fetching(
                        next.as_str(),
                        Problem::connection("Too many redirects"),
                    ));
                }
                request = redirect_target(config, &next)
                    .map_err(|prob| fetching(next.as_str(), prob))?;
                target = resolve_target(
                    resolver,
                    config.reserved_ip,
                    &request.host,
                    request.port,
                    &request.path,
                    deadline,
                )
                .await
                .map_err(|prob| fetching(next.as_str(), prob))?;
                redirects += 1;
                metrics.http01_redirects.inc();
                info!(
                    target: "audit",
                    from = %url,
                    to = %request.url(),
                    redirects,
                    "following redirect"
                );
                continue;
            }
            Fetched::Final(status, body) => (status, body),
        };

        let addr = display_addr(target.current());
        let body = body.map_err(|err| {
            Problem::unauthorized(format!(
                "Error reading HTTP response body: {}",
                err
            ))
        })?;
        if body.len() >= MAX_RESPONSE_SIZE {
            return Err(Problem::unauthorized(format!(
                "Invalid response from {} [{}]: {:?}",
                used,
                addr,
                String::from_utf8_lossy(&body)
            )));
        }
        if status != StatusCode::OK {
            return Err(Problem::unauthorized(format!(
                "Invalid response from {} [{}]: {}",
                used,
                addr,
                status.as_u16()
            )));
        }
        return Ok(body);
    }
}

/// Checks a redirect location and turns it into the next request.
pub fn redirect_target(
    config: &Config,
    location: &Url,
) -> Result<FetchRequest, Problem> {
    let scheme = match location.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => {
            return Err(Problem::connection(format!(
                "Invalid protocol scheme in redirect target. Only \"http\" \
                 and \"https\" protocol schemes are supported, not {:?}",
                other
            )))
        }
    };
    let port = match location.port() {
        Some(port) if port == config.http_port || port == config.https_port => {
            port
        }
        Some(port) => {
            return Err(Problem::connection(format!(
                "Invalid port in redirect target. Only ports {} and {} are \
                 supported, not {}",
                config.http_port, config.https_port, port
            )))
        }
        None => match scheme {
            Scheme::Http => config.http_port,
            Scheme::Https => config.https_port,
        },
    };
    let host = match location.host() {
        Some(Host::Domain(host)) if !host.is_empty() => host,
        Some(Host::Ipv4(addr)) => return Err(ip_redirect(addr.into())),
        Some(Host::Ipv6(addr)) => return Err(ip_redirect(addr.into())),
        _ => {
            return Err(Problem::connection(
                "Invalid empty hostname in redirect target",
            ))
        }
    };
    let mut path = location.path().to_string();
    if let Some(query) = location.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(FetchRequest {
        scheme,
        host: host.trim_end_matches('.').to_ascii_lowercase(),
        port,
        path,
    })
}

fn ip_redirect(addr: IpAddr) -> Problem {
    Problem::connection(format!(
        "Invalid host in redirect target {:?}. Only domain names are \
         supported, not IP addresses",
        addr.to_string()
    ))
}

//------------ FetchRequest --------------------------------------------------

/// The scheme of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Returns the port implied when a URL has none.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A single request to make.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchRequest {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl FetchRequest {
    /// Returns the URL of the request.
    ///
    /// Relative redirect locations are resolved against this URL.
    pub fn url(&self) -> String {
        build_url(self.scheme, &self.host, self.port, &self.path)
    }

    /// Returns the URL of the request sent to a specific address.
    ///
    /// This is the URL that appears in validation records. The port is
    /// left out if it is 80 or 443, whatever the scheme.
    pub fn addr_url(&self, addr: IpAddr) -> String {
        let host = match addr {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{}]", addr),
        };
        if self.port == 80 || self.port == 443 {
            format!("{}://{}{}", self.scheme.as_str(), host, self.path)
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme.as_str(),
                host,
                self.port,
                self.path
            )
        }
    }

    fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Builds a URL, leaving out the port if it is the default port.
pub fn build_url(scheme: Scheme, host: &str, port: u16, path: &str) -> String {
    if port == scheme.default_port() {
        format!("{}://{}{}", scheme.as_str(), host, path)
    } else {
        format!("{}://{}:{}{}", scheme.as_str(), host, port, path)
    }
}

//------------ Single Requests -----------------------------------------------

/// The outcome of a single request.
enum Fetched {
    /// A redirect to the given location.
    Redirect(String),

    /// A final response with its possibly truncated body.
    Final(StatusCode, Result<Vec<u8>, hyper::Error>),
}

/// Makes a request to the current address of `target`.
async fn fetch_once(
    config: &Config,
    request: &FetchRequest,
    target: &ValidationTarget,
    deadline: Instant,
) -> Result<Fetched, NetError> {
    let ip = match target.current() {
        Some(ip) => ip,
        None => {
            return Err(NetError::Dial(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address to contact",
            )))
        }
    };
    debug!(url = %request.addr_url(ip), host = %request.host, "fetching");
    let sock = connect_tcp(SocketAddr::new(ip, request.port), deadline).await?;
    match request.scheme {
        Scheme::Http => exchange(sock, config, request, deadline).await,
        Scheme::Https => {
            let tls_config =
                insecure_client_config(vec![b"http/1.1".to_vec()])?;
            let stream =
                connect_tls(tls_config, &request.host, sock, deadline).await?;
            exchange(stream, config, request, deadline).await
        }
    }
}

/// Performs the HTTP exchange over an established connection.
async fn exchange<S>(
    stream: S,
    config: &Config,
    request: &FetchRequest,
    deadline: Instant,
) -> Result<Fetched, NetError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let req = Request::builder()
        .uri(request.path.as_str())
        .header(header::HOST, request.host_header())
        .header(header::USER_AGENT, config.user_agent.as_str())
        .header(header::ACCEPT, "*/*")
        .body(Empty::<Bytes>::new())
        .map_err(|err| {
            NetError::Io(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(hyper_error)?;
    let conn = tokio::spawn(conn);
    let res = exchange_on(&mut sender, req, deadline).await;
    conn.abort();
    res
}

async fn exchange_on(
    sender: &mut http1::SendRequest<Empty<Bytes>>,
    req: Request<Empty<Bytes>>,
    deadline: Instant,
) -> Result<Fetched, NetError> {
    let response = match timeout_at(deadline, sender.send_request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Err(hyper_error(err)),
        Err(_) => return Err(NetError::ResponseTimeout),
    };

    let status = response.status();
    if status.is_redirection() {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok());
        if let Some(location) = location {
            return Ok(Fetched::Redirect(location.to_string()));
        }
    }

    let mut body = response.into_body();
    let mut data = Vec::new();
    let read = async {
        while data.len() < MAX_RESPONSE_SIZE {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(chunk) = frame.data_ref() {
                        data.extend_from_slice(chunk);
                    }
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        Ok(())
    };
    let read = timeout_at(deadline, read).await;
    match read {
        Ok(Ok(())) => {
            data.truncate(MAX_RESPONSE_SIZE);
            Ok(Fetched::Final(status, Ok(data)))
        }
        Ok(Err(err)) => Ok(Fetched::Final(status, Err(err))),
        Err(_) => Err(NetError::ReadTimeout),
    }
}

//------------ Helpers -------------------------------------------------------

/// Returns the URL of the request sent to the current address of `target`.
fn target_url(request: &FetchRequest, target: &ValidationTarget) -> String {
    match target.current() {
        Some(ip) => request.addr_url(ip),
        None => request.url(),
    }
}

/// Prefixes the detail of a problem with the URL being fetched.
fn fetching(url: &str, mut problem: Problem) -> Problem {
    problem.detail = format!("Fetching {}: {}", url, problem.detail);
    problem
}

fn display_addr(addr: Option<IpAddr>) -> String {
    addr.map(|addr| addr.to_string()).unwrap_or_default()
}

/// Converts a client error into a network error.
///
/// The kind of an underlying I/O error is kept so it is classified the
/// same as errors from dialing.
fn hyper_error(err: hyper::Error) -> NetError {
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return NetError::Io(io::Error::new(
                io_err.kind(),
                err.to_string(),
            ));
        }
        source = inner.source();
    }
    NetError::Io(io::Error::other(err.to_string()))
}

//============ Tests =========================================================
