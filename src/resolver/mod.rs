//! The DNS resolver used by the validators.
//!
//! Validators never talk to the DNS directly. Instead they use the
//! [`Resolver`] trait defined here which offers exactly the three lookups
//! needed: addresses for a host, TXT records, and CAA records. A real
//! implementation atop the `domain` crate’s stub resolver is available in
//! the [`stub`] module if the `resolv` feature is enabled. Tests supply
//! their own deterministic implementations.
//!
//! The lookups themselves carry no deadline. Callers bound them through
//! [`lookup_with_deadline`] which turns an elapsed deadline into a
//! [`DnsError`] of kind [`DnsErrorKind::Timeout`].

use core::fmt;
use std::boxed::Box;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use tokio::time::{timeout_at, Instant};

#[cfg(feature = "resolv")]
#[cfg_attr(docsrs, doc(cfg(feature = "resolv")))]
pub mod stub;

//------------ Resolver ------------------------------------------------------

/// The addresses of the DNS servers that produced an answer.
pub type ResolverAddrs = Vec<String>;

/// The future returned by the lookup methods of a [`Resolver`].
pub type LookupFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DnsError>> + Send + 'a>>;

/// A client capable of the DNS lookups needed for validation.
///
/// An empty answer (including NXDOMAIN for TXT and CAA lookups) is not an
/// error: it results in an empty list. Errors are reserved for failures
/// to get an answer at all.
pub trait Resolver: Send + Sync {
    /// Looks up all IPv4 and IPv6 addresses for a host.
    fn lookup_host<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<IpAddr>, ResolverAddrs)>;

    /// Looks up the TXT records for a name.
    ///
    /// Each record is returned as the concatenation of its character
    /// strings.
    fn lookup_txt<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<String>, ResolverAddrs)>;

    /// Looks up the CAA records for a name.
    fn lookup_caa<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, Vec<CaaRecord>>;
}

/// Runs a lookup, failing with a timeout error once `deadline` passes.
pub async fn lookup_with_deadline<T, F>(
    deadline: Instant,
    qtype: &'static str,
    hostname: &str,
    lookup: F,
) -> Result<T, DnsError>
where
    F: Future<Output = Result<T, DnsError>>,
{
    match timeout_at(deadline, lookup).await {
        Ok(res) => res,
        Err(_) => Err(DnsError::new(qtype, hostname, DnsErrorKind::Timeout)),
    }
}

//------------ CaaRecord -----------------------------------------------------

/// The data of a CAA record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CaaRecord {
    pub flags: u8,
    pub tag: String,
    pub value: String,
}

impl CaaRecord {
    pub fn new(
        flags: u8,
        tag: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        CaaRecord {
            flags,
            tag: tag.into(),
            value: value.into(),
        }
    }
}

//------------ DnsError ------------------------------------------------------

/// A DNS lookup failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DnsError {
    qtype: &'static str,
    hostname: String,
    kind: DnsErrorKind,
}

impl DnsError {
    pub fn new(
        qtype: &'static str,
        hostname: impl Into<String>,
        kind: DnsErrorKind,
    ) -> Self {
        DnsError {
            qtype,
            hostname: hostname.into(),
            kind,
        }
    }

    pub fn qtype(&self) -> &'static str {
        self.qtype
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn kind(&self) -> &DnsErrorKind {
        &self.kind
    }

    /// Returns whether the lookup was abandoned because time ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, DnsErrorKind::Timeout)
    }
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            DnsErrorKind::Timeout => write!(
                f,
                "DNS problem: query timed out looking up {} for {}",
                self.qtype, self.hostname
            ),
            DnsErrorKind::Network => write!(
                f,
                "DNS problem: networking error looking up {} for {}",
                self.qtype, self.hostname
            ),
            DnsErrorKind::Rcode(ref rcode) if rcode == "NXDOMAIN" => write!(
                f,
                "DNS problem: NXDOMAIN looking up {} for {} - check that \
                 a DNS record exists for this domain",
                self.qtype, self.hostname
            ),
            DnsErrorKind::Rcode(ref rcode) => write!(
                f,
                "DNS problem: {} looking up {} for {}",
                rcode, self.qtype, self.hostname
            ),
            DnsErrorKind::Other(ref msg) => write!(
                f,
                "DNS problem: {} looking up {} for {}",
                msg, self.qtype, self.hostname
            ),
        }
    }
}

impl std::error::Error for DnsError {}

//------------ DnsErrorKind --------------------------------------------------

/// The reason a DNS lookup failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DnsErrorKind {
    /// No answer arrived in time.
    Timeout,

    /// The servers could not be reached.
    Network,

    /// The server answered with an error response code.
    Rcode(String),

    /// Anything else, described by the message.
    Other(String),
}

//============ Tests =========================================================
