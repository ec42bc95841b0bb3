//! The DNS-01 and DNS-ACCOUNT-01 validators.
//!
//! Both challenges expect a TXT record containing the base64url encoded
//! SHA-256 digest of the key authorization. DNS-01 looks for it at
//! `_acme-challenge.<name>`. DNS-ACCOUNT-01 binds the record to an
//! account by placing it at `<label>._acme-challenge.<name>` where the
//! label is derived from the account URI via [`account_label`].
//!
//! Wildcard names are validated via the records of the name without the
//! wildcard label. The validation record still carries the name as given.

use crate::challenge::{key_authorization_digest, ValidationRecord};
use crate::config::Config;
use crate::identifier::Identifier;
use crate::problem::Problem;
use crate::resolver::{lookup_with_deadline, Resolver};
use data_encoding::BASE32;
use ring::digest;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

//------------ Module Configuration ------------------------------------------

/// The label prepended to the name being validated.
pub const DNS_PREFIX: &str = "_acme-challenge";

/// The number of characters of a mismatched TXT record shown in problems.
const MAX_SHOWN_TXT_LEN: usize = 100;

/// The number of digest octets used for the account label.
const ACCOUNT_LABEL_OCTETS: usize = 10;

//------------ validate_dns01 ------------------------------------------------

/// Validates a DNS-01 challenge.
pub async fn validate_dns01(
    resolver: &dyn Resolver,
    ident: &Identifier,
    key_authorization: &str,
    deadline: Instant,
    records: &mut Vec<ValidationRecord>,
) -> Result<(), Problem> {
    let name = match dns_name(ident) {
        Some(name) => name,
        None => {
            info!(%ident, "Identifier type for DNS challenge was not DNS");
            return Err(Problem::malformed(
                "Identifier type for DNS challenge was not DNS",
            ));
        }
    };
    let challenge_name = format!("{}.{}", DNS_PREFIX, name);
    let record =
        check_txt(resolver, ident, &challenge_name, key_authorization, deadline)
            .await?;
    records.push(record);
    Ok(())
}

//------------ validate_dns_account01 ----------------------------------------

/// Validates a DNS-ACCOUNT-01 challenge.
///
/// The challenge has to be enabled in `config` and the account URI has
/// to start with one of the configured prefixes.
pub async fn validate_dns_account01(
    resolver: &dyn Resolver,
    config: &Config,
    ident: &Identifier,
    key_authorization: &str,
    account_uri: Option<&str>,
    deadline: Instant,
    records: &mut Vec<ValidationRecord>,
) -> Result<(), Problem> {
    if !config.dns_account_01_enabled {
        info!("Got a dns-account-01 validation request but it is disabled");
        return Err(Problem::unauthorized(
            "dns-account-01 challenge type disabled",
        ));
    }
    let name = match dns_name(ident) {
        Some(name) => name,
        None => {
            info!(
                %ident,
                "Identifier type for DNS-ACCOUNT-01 challenge was not DNS"
            );
            return Err(Problem::malformed(
                "Identifier type for DNS-ACCOUNT-01 challenge was not DNS",
            ));
        }
    };
    let account_uri = account_uri.unwrap_or_default();
    check_account_uri(account_uri, &config.account_uri_prefixes)?;
    let challenge_name = format!(
        "{}.{}.{}",
        account_label(account_uri),
        DNS_PREFIX,
        name
    );
    let record =
        check_txt(resolver, ident, &challenge_name, key_authorization, deadline)
            .await
            .map_err(|mut prob| {
                prob.detail =
                    format!("{} (account: {})", prob.detail, account_uri);
                prob
            })?;
    records.push(record);
    Ok(())
}

/// Checks that an account URI is acceptable for DNS-ACCOUNT-01.
///
/// The URI must be present, be a valid URL, and start with one of
/// `prefixes`.
pub fn check_account_uri(
    account_uri: &str,
    prefixes: &[String],
) -> Result<(), Problem> {
    if account_uri.is_empty() {
        return Err(Problem::malformed(
            "dns-account-01 challenge requires an account URI",
        ));
    }
    if let Err(err) = Url::parse(account_uri) {
        return Err(Problem::malformed(format!(
            "Invalid Account URI syntax {:?}: {}",
            account_uri, err
        )));
    }
    if !prefixes.iter().any(|prefix| account_uri.starts_with(prefix.as_str()))
    {
        return Err(Problem::unauthorized(format!(
            "Invalid Account URI prefix: {}",
            account_uri
        )));
    }
    Ok(())
}

/// Returns the DNS-ACCOUNT-01 label for an account URI.
///
/// This is an underscore followed by the lowercased base32 encoding of
/// the first ten octets of the SHA-256 digest of the URI.
pub fn account_label(account_uri: &str) -> String {
    let hash = digest::digest(&digest::SHA256, account_uri.as_bytes());
    let encoded = BASE32.encode(&hash.as_ref()[..ACCOUNT_LABEL_OCTETS]);
    format!("_{}", encoded.to_ascii_lowercase())
}

//------------ Helpers -------------------------------------------------------

/// Returns the name to look up for a DNS identifier.
fn dns_name(ident: &Identifier) -> Option<String> {
    ident.as_dns().map(|_| ident.lookup_name())
}

/// Looks for the key authorization digest among the TXT records at a name.
///
/// Returns the record of the successful lookup.
async fn check_txt(
    resolver: &dyn Resolver,
    ident: &Identifier,
    challenge_name: &str,
    key_authorization: &str,
    deadline: Instant,
) -> Result<ValidationRecord, Problem> {
    let expected = key_authorization_digest(key_authorization);
    let (txts, resolver_addrs) = lookup_with_deadline(
        deadline,
        "TXT",
        challenge_name,
        resolver.lookup_txt(challenge_name),
    )
    .await
    .map_err(|err| Problem::dns(err.to_string()))?;

    if txts.is_empty() {
        return Err(Problem::unauthorized(format!(
            "No TXT record found at {}",
            challenge_name
        )));
    }

    for txt in &txts {
        if bool::from(txt.as_bytes().ct_eq(expected.as_bytes())) {
            debug!(%challenge_name, "found matching TXT record");
            return Ok(ValidationRecord {
                hostname: ident.to_string(),
                resolver_addrs,
                ..Default::default()
            });
        }
    }

    let mut shown: String = txts[0].chars().take(MAX_SHOWN_TXT_LEN).collect();
    if shown.len() < txts[0].len() {
        shown.push_str("...");
    }
    let and_more = if txts.len() > 1 {
        format!(" (and {} more)", txts.len() - 1)
    } else {
        String::new()
    };
    Err(Problem::unauthorized(format!(
        "Incorrect TXT record {}{} found at {}",
        quote(&shown),
        and_more,
        challenge_name
    )))
}

/// Quotes a string for a problem detail.
///
/// Printable characters are kept, everything else is escaped the same way
/// as by Go’s `%q` verb.
fn quote(s: &str) -> String {
    let mut res = String::with_capacity(s.len() + 2);
    res.push('"');
    for ch in s.chars() {
        match ch {
            '"' => res.push_str("\\\""),
            '\\' => res.push_str("\\\\"),
            '\u{7}' => res.push_str("\\a"),
            '\u{8}' => res.push_str("\\b"),
            '\u{c}' => res.push_str("\\f"),
            '\n' => res.push_str("\\n"),
            '\r' => res.push_str("\\r"),
            '\t' => res.push_str("\\t"),
            '\u{b}' => res.push_str("\\v"),
            ' ' => res.push(' '),
            ch if !ch.is_control() && !ch.is_whitespace() => res.push(ch),
            ch if u32::from(ch) < 0x80 => {
                res.push_str(&format!("\\x{:02x}", u32::from(ch)))
            }
            ch if u32::from(ch) < 0x10000 => {
                res.push_str(&format!("\\u{:04x}", u32::from(ch)))
            }
            ch => res.push_str(&format!("\\U{:08x}", u32::from(ch))),
        }
    }
    res.push('"');
    res
}

//============ Tests =========================================================
