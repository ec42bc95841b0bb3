//! Validation authority configuration.
//!
//! All behaviour that can be tuned is collected in [`Config`] which is
//! handed to [`ValidationAuthority::new`] once. Nothing is read from
//! global state later on.
//!
//! [`ValidationAuthority::new`]: crate::va::ValidationAuthority::new

use core::fmt;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

//------------ ReservedPredicate ---------------------------------------------

/// Decides whether an address must not be used as a validation target.
pub type ReservedPredicate = fn(IpAddr) -> bool;

//------------ Config --------------------------------------------------------

/// Configuration for a validation authority.
///
/// The type follows the same pattern as a resolver configuration: create
/// one via `Config::default()` and then change whichever fields you need.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// The port HTTP-01 requests are made to.
    ///
    /// Redirects to an explicit port are only followed if it is this port
    /// or `https_port`.
    pub http_port: u16,

    /// The port for HTTPS requests after a redirect to an `https` URL.
    pub https_port: u16,

    /// The port TLS-ALPN-01 handshakes are made to.
    pub tls_port: u16,

    /// The time a single validation attempt may take.
    pub timeout: Duration,

    /// The time a single remote perspective may take.
    pub remote_timeout: Duration,

    /// The number of remote perspectives allowed to fail.
    pub max_remote_failures: usize,

    /// Whether the DNS-ACCOUNT-01 challenge is accepted.
    pub dns_account_01_enabled: bool,

    /// Account URI prefixes accepted for DNS-ACCOUNT-01.
    pub account_uri_prefixes: Vec<String>,

    /// The domain identifying this CA in CAA `issue` records.
    pub issuer_domain: String,

    /// The user agent sent with HTTP-01 requests.
    pub user_agent: String,

    /// The name of this perspective used in logs.
    pub perspective: String,

    /// Addresses for which this returns true are never contacted.
    #[serde(skip)]
    pub reserved_ip: ReservedPredicate,
}

impl Config {
    /// Checks that the configuration is usable.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.dns_account_01_enabled && self.account_uri_prefixes.is_empty()
        {
            return Err(ConfigError::NoAccountUriPrefixes);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Checks that the given number of remote perspectives can outvote
    /// the tolerated failures.
    ///
    /// Without remote perspectives there is nothing to outvote.
    pub fn check_remotes(&self, remotes: usize) -> Result<(), ConfigError> {
        if remotes > 0 && self.max_remote_failures >= remotes {
            return Err(ConfigError::TooManyRemoteFailures {
                max_remote_failures: self.max_remote_failures,
                remotes,
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_port: 80,
            https_port: 443,
            tls_port: 443,
            timeout: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(10),
            max_remote_failures: 0,
            dns_account_01_enabled: false,
            account_uri_prefixes: Vec::new(),
            issuer_domain: "letsencrypt.org".into(),
            user_agent: "acme-va".into(),
            perspective: "primary".into(),
            reserved_ip: is_reserved_ip,
        }
    }
}

//------------ is_reserved_ip ------------------------------------------------

/// Returns whether an address is in a private or otherwise reserved range.
pub fn is_reserved_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => is_reserved_v4(addr),
        IpAddr::V6(addr) => is_reserved_v6(addr),
    }
}

fn is_reserved_v4(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    addr.is_unspecified()
        || addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_multicast()
        || a == 0
        // Shared address space, RFC 6598.
        || (a == 100 && (b & 0xc0) == 64)
        // IETF protocol assignments.
        || (a == 192 && b == 0 && c == 0)
        // Benchmarking, RFC 2544.
        || (a == 198 && (b & 0xfe) == 18)
        // Reserved for future use.
        || a >= 240
}

fn is_reserved_v6(addr: Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_reserved_v4(v4);
    }
    let segments = addr.segments();
    addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        // Unique local, RFC 4193.
        || (segments[0] & 0xfe00) == 0xfc00
        // Link local.
        || (segments[0] & 0xffc0) == 0xfe80
        // Documentation, RFC 3849.
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

//------------ ConfigError ---------------------------------------------------

/// A configuration is unusable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    NoAccountUriPrefixes,
    ZeroTimeout,

    /// Every remote perspective could fail without failing validation.
    TooManyRemoteFailures {
        max_remote_failures: usize,
        remotes: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::NoAccountUriPrefixes => {
                f.write_str("no account URI prefixes configured")
            }
            ConfigError::ZeroTimeout => {
                f.write_str("validation timeout must not be zero")
            }
            ConfigError::TooManyRemoteFailures {
                max_remote_failures,
                remotes,
            } => write!(
                f,
                "{} tolerated remote failures with only {} remote \
                 perspectives",
                max_remote_failures, remotes
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

//============ Tests =========================================================
