//! Challenges and the records their validation produces.

use core::fmt;
use core::str::FromStr;
use data_encoding::BASE64URL_NOPAD;
use ring::digest;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

//------------ Module Configuration ------------------------------------------

/// The length of a token or account key thumbprint in base64url.
///
/// Both are 32 octets of entropy or SHA-256 output, which encode to 43
/// characters without padding.
const ENCODED_LEN: usize = 43;

//------------ ChallengeType -------------------------------------------------

/// The kind of challenge to perform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,

    #[serde(rename = "dns-01")]
    Dns01,

    #[serde(rename = "dns-account-01")]
    DnsAccount01,

    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::DnsAccount01 => "dns-account-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

//--- FromStr and Display

impl FromStr for ChallengeType {
    type Err = UnknownChallengeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            "dns-account-01" => Ok(ChallengeType::DnsAccount01),
            "tls-alpn-01" => Ok(ChallengeType::TlsAlpn01),
            _ => Err(UnknownChallengeType(s.into())),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ Status --------------------------------------------------------

/// The state of a challenge.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Valid,
    Invalid,
}

//------------ Challenge -----------------------------------------------------

/// A challenge to be validated.
///
/// This is the immutable input to a validation attempt. The status is
/// carried so that the value can travel through the persistence layer;
/// validation itself never looks at it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,

    pub token: String,

    /// The key authorization, `<token>.<account key thumbprint>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_authorization: String,

    #[serde(default)]
    pub status: Status,
}

impl Challenge {
    pub fn new(
        challenge_type: ChallengeType,
        token: impl Into<String>,
        key_authorization: impl Into<String>,
    ) -> Self {
        Challenge {
            challenge_type,
            token: token.into(),
            key_authorization: key_authorization.into(),
            status: Status::Pending,
        }
    }

    /// Checks that token and key authorization are well-formed.
    ///
    /// The token must be 43 characters of unpadded base64url. The key
    /// authorization must be this token followed by a dot and another 43
    /// characters of unpadded base64url.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        if !looks_like_b64_value(&self.token) {
            return Err(ConsistencyError::MalformedToken);
        }
        let (token, thumbprint) = self
            .key_authorization
            .split_once('.')
            .ok_or(ConsistencyError::MalformedKeyAuthorization)?;
        if token != self.token {
            return Err(ConsistencyError::TokenMismatch);
        }
        if !looks_like_b64_value(thumbprint) {
            return Err(ConsistencyError::MalformedKeyAuthorization);
        }
        Ok(())
    }

    /// Checks that a set of records is fit to be handed to persistence.
    pub fn records_sane(&self, records: &[ValidationRecord]) -> bool {
        if records.is_empty() {
            return false;
        }
        match self.challenge_type {
            ChallengeType::Http01 => records.iter().all(|rec| {
                rec.url.is_some()
                    && !rec.hostname.is_empty()
                    && rec.port.is_some()
                    && rec.address_used.is_some()
                    && !rec.addresses_resolved.is_empty()
            }),
            ChallengeType::TlsAlpn01 => {
                records.len() == 1
                    && records[0].url.is_none()
                    && !records[0].hostname.is_empty()
                    && records[0].port.is_some()
                    && records[0].address_used.is_some()
                    && !records[0].addresses_resolved.is_empty()
            }
            ChallengeType::Dns01 | ChallengeType::DnsAccount01 => {
                records.len() == 1 && !records[0].hostname.is_empty()
            }
        }
    }
}

fn looks_like_b64_value(s: &str) -> bool {
    s.len() == ENCODED_LEN
        && s.bytes().all(|ch| {
            ch.is_ascii_alphanumeric() || ch == b'-' || ch == b'_'
        })
}

//------------ AuthorizationContext ------------------------------------------

/// What is known about the authorization a challenge belongs to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationContext {
    /// The URI of the account requesting the authorization.
    ///
    /// Only DNS-ACCOUNT-01 makes use of this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_uri: Option<String>,
}

impl AuthorizationContext {
    pub fn with_account(account_uri: impl Into<String>) -> Self {
        AuthorizationContext {
            account_uri: Some(account_uri.into()),
        }
    }
}

//------------ ValidationRecord ----------------------------------------------

/// An audit entry for a single network contact.
///
/// A validation attempt produces one record for every host contacted:
/// the initial target, each redirect target, and each fallback retry.
/// Records are kept in the order the contacts were made.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    /// The hostname contacted or looked up.
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// The URL requested. HTTP-01 only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// All addresses the hostname resolved to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses_resolved: Vec<IpAddr>,

    /// The address the final attempt was made to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_used: Option<IpAddr>,

    /// Addresses that were attempted before `address_used`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses_tried: Vec<IpAddr>,

    /// The DNS servers that answered the lookups for this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolver_addrs: Vec<String>,
}

//------------ Digests -------------------------------------------------------

/// Returns the SHA-256 digest of the key authorization.
pub fn key_authorization_hash(key_authorization: &str) -> [u8; 32] {
    let mut res = [0u8; 32];
    res.copy_from_slice(
        digest::digest(&digest::SHA256, key_authorization.as_bytes()).as_ref(),
    );
    res
}

/// Returns the base64url encoded SHA-256 digest of the key authorization.
///
/// This is the value expected in DNS-01 and DNS-ACCOUNT-01 TXT records.
pub fn key_authorization_digest(key_authorization: &str) -> String {
    BASE64URL_NOPAD.encode(&key_authorization_hash(key_authorization))
}

//============ Error Types ===================================================

//------------ UnknownChallengeType ------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownChallengeType(String);

impl fmt::Display for UnknownChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown challenge type {:?}", self.0)
    }
}

impl std::error::Error for UnknownChallengeType {}

//------------ ConsistencyError ----------------------------------------------

/// A challenge failed the consistency check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsistencyError {
    MalformedToken,
    MalformedKeyAuthorization,
    TokenMismatch,
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            ConsistencyError::MalformedToken => "malformed token",
            ConsistencyError::MalformedKeyAuthorization => {
                "malformed key authorization"
            }
            ConsistencyError::TokenMismatch => {
                "key authorization does not match token"
            }
        })
    }
}

impl std::error::Error for ConsistencyError {}

//============ Tests =========================================================
