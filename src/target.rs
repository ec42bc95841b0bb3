//! Turning a hostname into the addresses to contact.
//!
//! A [`ValidationTarget`] is a cursor over the addresses a host resolved
//! to. It holds at most two candidates: the first IPv6 address and, as a
//! fallback, the first IPv4 address. If only one address family is
//! available, there is no fallback.
//!
//! The cursor is created already advanced, so [`ValidationTarget::current`]
//! names the address to contact first. Moving on to the fallback happens
//! via [`ValidationTarget::advance`] which fails once the candidates are
//! used up.

use crate::challenge::ValidationRecord;
use crate::config::ReservedPredicate;
use crate::problem::Problem;
use crate::resolver::{lookup_with_deadline, Resolver, ResolverAddrs};
use core::fmt;
use std::collections::VecDeque;
use std::net::IpAddr;
use tokio::time::Instant;
use tracing::debug;

//------------ ValidationTarget ----------------------------------------------

/// The addresses of a host and which of them have been tried.
#[derive(Clone, Debug)]
pub struct ValidationTarget {
    /// The hostname being validated.
    host: String,

    /// The port to contact.
    port: u16,

    /// The path to request, if any.
    path: String,

    /// All usable addresses the host resolved to.
    available: Vec<IpAddr>,

    /// Addresses cycled out of `current` by `advance`.
    tried: Vec<IpAddr>,

    /// Addresses still to be used by `advance`.
    next: VecDeque<IpAddr>,

    /// The address currently in use.
    current: Option<IpAddr>,

    /// The DNS servers that answered the address lookup.
    resolver_addrs: ResolverAddrs,
}

impl ValidationTarget {
    /// Creates a target from already resolved addresses.
    ///
    /// The target is advanced once, so that `current` is populated.
    pub fn from_addrs(
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        addrs: Vec<IpAddr>,
        resolver_addrs: ResolverAddrs,
    ) -> Result<Self, TargetError> {
        let host = host.into();
        let (v4, v6) = available_addresses(&addrs);
        let next: VecDeque<IpAddr> = match (v6.first(), v4.first()) {
            (Some(&v6), Some(&v4)) => [v6, v4].into(),
            (Some(&v6), None) => [v6].into(),
            (None, Some(&v4)) => [v4].into(),
            (None, None) => return Err(TargetError::NoAddresses(host)),
        };
        let mut res = ValidationTarget {
            host,
            port,
            path: path.into(),
            available: addrs,
            tried: Vec::new(),
            next,
            current: None,
            resolver_addrs,
        };
        res.advance()?;
        Ok(res)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn available(&self) -> &[IpAddr] {
        &self.available
    }

    pub fn tried(&self) -> &[IpAddr] {
        &self.tried
    }

    /// Returns the addresses not yet moved into `current`.
    pub fn remaining(&self) -> &VecDeque<IpAddr> {
        &self.next
    }

    /// Returns the address to contact.
    pub fn current(&self) -> Option<IpAddr> {
        self.current
    }

    /// Returns whether there is no further address to advance to.
    pub fn exhausted(&self) -> bool {
        self.next.is_empty()
    }

    /// Moves on to the next address.
    ///
    /// The previous current address, if any, is added to the tried
    /// addresses. Returns the new current address or an error if there
    /// are no addresses left. In the latter case the target remains
    /// unchanged.
    pub fn advance(&mut self) -> Result<IpAddr, TargetError> {
        let addr = match self.next.pop_front() {
            Some(addr) => addr,
            None => return Err(TargetError::Exhausted(self.host.clone())),
        };
        if let Some(prev) = self.current.replace(addr) {
            self.tried.push(prev);
        }
        Ok(addr)
    }

    /// Creates a validation record for contacting the current address.
    pub fn record(&self, url: Option<String>) -> ValidationRecord {
        ValidationRecord {
            hostname: self.host.clone(),
            port: Some(self.port),
            url,
            addresses_resolved: self.available.clone(),
            address_used: self.current,
            addresses_tried: self.tried.clone(),
            resolver_addrs: self.resolver_addrs.clone(),
        }
    }
}

//------------ resolve_target ------------------------------------------------

/// Resolves a host and creates a target for it.
///
/// Addresses for which `reserved` returns true are dropped. Failing to
/// resolve the host or ending up without any usable address results in a
/// connection problem.
pub async fn resolve_target(
    resolver: &dyn Resolver,
    reserved: ReservedPredicate,
    host: &str,
    port: u16,
    path: &str,
    deadline: Instant,
) -> Result<ValidationTarget, Problem> {
    let (addrs, resolver_addrs) = lookup_with_deadline(
        deadline,
        "A",
        host,
        resolver.lookup_host(host),
    )
    .await
    .map_err(|err| Problem::connection(err.to_string()))?;
    let addrs: Vec<IpAddr> =
        addrs.into_iter().filter(|addr| !reserved(*addr)).collect();
    if addrs.is_empty() {
        return Err(Problem::connection(format!(
            "No valid IP addresses found for {}",
            host
        )));
    }
    debug!(%host, ?addrs, "Resolved addresses");
    ValidationTarget::from_addrs(host, port, path, addrs, resolver_addrs)
        .map_err(|err| Problem::connection(err.to_string()))
}

/// Splits addresses into IPv4 and IPv6 addresses, keeping their order.
pub fn available_addresses(addrs: &[IpAddr]) -> (Vec<IpAddr>, Vec<IpAddr>) {
    addrs.iter().partition(|addr| addr.is_ipv4())
}

//------------ TargetError ---------------------------------------------------

/// A target could not provide an address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetError {
    /// The host did not have any addresses at all.
    NoAddresses(String),

    /// All addresses of the host have been used.
    Exhausted(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TargetError::NoAddresses(ref host) => {
                write!(f, "host {:?} has no IPv4 or IPv6 addresses", host)
            }
            TargetError::Exhausted(ref host) => write!(
                f,
                "host {:?} has no IP addresses remaining to use",
                host
            ),
        }
    }
}

impl std::error::Error for TargetError {}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::is_reserved_ip;
    use crate::problem::ProblemType;
    use crate::resolver::{CaaRecord, DnsError, DnsErrorKind, LookupFuture};
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn split_addresses() {
        let v6a = ip("::1");
        let v6b = ip("2001:db8::2:1");
        let v4a = ip("127.0.0.1");
        let v4b = ip("192.0.2.1");
        assert_eq!(available_addresses(&[]), (vec![], vec![]));
        assert_eq!(available_addresses(&[v4a]), (vec![v4a], vec![]));
        assert_eq!(available_addresses(&[v6a, v4a]), (vec![v4a], vec![v6a]));
        assert_eq!(
            available_addresses(&[v6a, v6b]),
            (vec![], vec![v6a, v6b])
        );
        assert_eq!(
            available_addresses(&[v6a, v4a, v6b, v4b]),
            (vec![v4a, v4b], vec![v6a, v6b])
        );
    }

    #[test]
    fn dual_stack_prefers_v6() {
        let addrs = vec![ip("127.0.0.1"), ip("::1"), ip("10.0.0.1")];
        let mut target =
            ValidationTarget::from_addrs("example.com", 80, "/", addrs, vec![])
                .unwrap();
        assert_eq!(target.current(), Some(ip("::1")));
        assert_eq!(target.remaining(), &[ip("127.0.0.1")]);
        assert!(!target.exhausted());

        assert_eq!(target.advance(), Ok(ip("127.0.0.1")));
        assert_eq!(target.tried(), &[ip("::1")]);
        assert!(target.exhausted());

        assert_eq!(
            target.advance(),
            Err(TargetError::Exhausted("example.com".into()))
        );
        assert_eq!(target.current(), Some(ip("127.0.0.1")));
        assert_eq!(target.tried(), &[ip("::1")]);
    }

    #[test]
    fn single_family_has_no_fallback() {
        let mut target = ValidationTarget::from_addrs(
            "example.com",
            80,
            "/",
            vec![ip("127.0.0.1"), ip("127.0.0.2")],
            vec![],
        )
        .unwrap();
        assert_eq!(target.current(), Some(ip("127.0.0.1")));
        assert!(target.exhausted());
        assert!(target.advance().is_err());

        let target = ValidationTarget::from_addrs(
            "example.com",
            80,
            "/",
            vec![ip("::1"), ip("::2")],
            vec![],
        )
        .unwrap();
        assert_eq!(target.current(), Some(ip("::1")));
        assert!(target.exhausted());
    }

    #[test]
    fn no_addresses() {
        assert_eq!(
            ValidationTarget::from_addrs("x.com", 80, "/", vec![], vec![])
                .unwrap_err()
                .to_string(),
            "host \"x.com\" has no IPv4 or IPv6 addresses"
        );
    }

    #[test]
    fn record() {
        let target = ValidationTarget::from_addrs(
            "example.com",
            5002,
            "/",
            vec![ip("::1"), ip("127.0.0.1")],
            vec!["MockClient".into()],
        )
        .unwrap();
        let record = target.record(Some("http://example.com/".into()));
        assert_eq!(record.hostname, "example.com");
        assert_eq!(record.port, Some(5002));
        assert_eq!(record.address_used, Some(ip("::1")));
        assert!(record.addresses_tried.is_empty());
        assert_eq!(record.resolver_addrs, vec!["MockClient".to_string()]);
    }

    struct FixedResolver(Vec<IpAddr>);

    impl Resolver for FixedResolver {
        fn lookup_host<'a>(
            &'a self,
            hostname: &'a str,
        ) -> LookupFuture<'a, (Vec<IpAddr>, ResolverAddrs)> {
            Box::pin(async move {
                if hostname == "servfail.com" {
                    return Err(DnsError::new(
                        "A",
                        hostname,
                        DnsErrorKind::Rcode("SERVFAIL".into()),
                    ));
                }
                Ok((self.0.clone(), vec!["FixedResolver".into()]))
            })
        }

        fn lookup_txt<'a>(
            &'a self,
            _hostname: &'a str,
        ) -> LookupFuture<'a, (Vec<String>, ResolverAddrs)> {
            Box::pin(async { Ok((vec![], vec![])) })
        }

        fn lookup_caa<'a>(
            &'a self,
            _hostname: &'a str,
        ) -> LookupFuture<'a, Vec<CaaRecord>> {
            Box::pin(async { Ok(vec![]) })
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn resolve_filters_reserved() {
        let resolver = FixedResolver(vec![ip("10.0.0.1"), ip("8.8.8.8")]);
        let target = resolve_target(
            &resolver,
            is_reserved_ip,
            "example.com",
            80,
            "/",
            deadline(),
        )
        .await
        .unwrap();
        assert_eq!(target.available(), &[ip("8.8.8.8")]);
        assert_eq!(target.current(), Some(ip("8.8.8.8")));

        let resolver = FixedResolver(vec![ip("10.0.0.1")]);
        let err = resolve_target(
            &resolver,
            is_reserved_ip,
            "example.com",
            80,
            "/",
            deadline(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.problem_type, ProblemType::Connection);
        assert_eq!(err.detail, "No valid IP addresses found for example.com");
    }

    #[tokio::test]
    async fn resolve_error_is_connection_problem() {
        let resolver = FixedResolver(vec![]);
        let err = resolve_target(
            &resolver,
            |_| false,
            "servfail.com",
            80,
            "/",
            deadline(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.problem_type, ProblemType::Connection);
        assert_eq!(
            err.detail,
            "DNS problem: SERVFAIL looking up A for servfail.com"
        );
    }
}
