//! Identifiers to be validated.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

//------------ Identifier ----------------------------------------------------

/// The name a certificate is requested for.
///
/// An identifier is either a DNS name or a literal IP address. DNS names
/// may be wildcards (`*.example.com`). Wildcards are kept as given so
/// that audit records show what was actually requested; network lookups
/// use [`lookup_name`][Self::lookup_name] which strips the `*.` label.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Identifier {
    Dns(String),
    Ip(IpAddr),
}

impl Identifier {
    /// Creates a DNS identifier.
    pub fn dns(name: impl Into<String>) -> Self {
        Identifier::Dns(name.into())
    }

    /// Creates an identifier from a string, recognizing IP literals.
    pub fn from_name(name: &str) -> Self {
        match IpAddr::from_str(name) {
            Ok(addr) => Identifier::Ip(addr),
            Err(_) => Identifier::Dns(name.into()),
        }
    }

    /// Returns the DNS name if this is a DNS identifier.
    pub fn as_dns(&self) -> Option<&str> {
        match *self {
            Identifier::Dns(ref name) => Some(name),
            Identifier::Ip(_) => None,
        }
    }

    /// Returns whether this is a wildcard DNS name.
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Identifier::Dns(ref name) if name.starts_with("*."))
    }

    /// Returns the name to use for network lookups.
    ///
    /// For wildcard names this is the name with the leading `*.` removed.
    pub fn lookup_name(&self) -> String {
        match *self {
            Identifier::Dns(ref name) => {
                name.strip_prefix("*.").unwrap_or(name).to_string()
            }
            Identifier::Ip(addr) => addr.to_string(),
        }
    }

    /// Returns the identifier with any wildcard label removed.
    pub fn normalized(&self) -> Self {
        match *self {
            Identifier::Dns(_) => Identifier::Dns(self.lookup_name()),
            Identifier::Ip(addr) => Identifier::Ip(addr),
        }
    }

    /// Returns the identifier type as used on the wire.
    pub fn type_str(&self) -> &'static str {
        match *self {
            Identifier::Dns(_) => "dns",
            Identifier::Ip(_) => "ip",
        }
    }
}

//--- Display

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Identifier::Dns(ref name) => f.write_str(name),
            Identifier::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

//============ Tests =========================================================
