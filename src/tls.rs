//! The TLS-ALPN-01 validator.
//!
//! The validator connects to the host on the TLS port, offering only the
//! `acme-tls/1` ALPN protocol, and inspects the certificate presented.
//! This certificate has to be for exactly the name being validated and
//! carry a critical acmeIdentifier extension whose value is the SHA-256
//! digest of the key authorization.
//!
//! Any certificate chain is accepted. There is nothing to chain up to.

use crate::challenge::{key_authorization_hash, ValidationRecord};
use crate::config::Config;
use crate::identifier::Identifier;
use crate::metrics::Metrics;
use crate::net::{connect_tcp, connect_tls, insecure_client_config};
use crate::problem::Problem;
use crate::resolver::Resolver;
use crate::target::resolve_target;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::{debug, info};
use x509_parser::der_parser::asn1_rs::{Any, Class, FromDer, Tag};
use x509_parser::der_parser::der::parse_der_octetstring;
use x509_parser::prelude::*;

//------------ Module Configuration ------------------------------------------

/// The ALPN protocol identifying a TLS-ALPN-01 validation.
pub const ACME_TLS_1_PROTOCOL: &str = "acme-tls/1";

/// The OID of the acmeIdentifier extension.
pub const ID_PE_ACME_IDENTIFIER: &str = "1.3.6.1.5.5.7.1.31";

/// The OID used by early drafts for the acmeIdentifier extension.
pub const ID_PE_ACME_IDENTIFIER_V1_OBSOLETE: &str = "1.3.6.1.5.5.7.1.30.1";

const INCORRECT_CERT: &str =
    "Incorrect validation certificate for tls-alpn-01 challenge.";

//------------ validate_tls_alpn01 -------------------------------------------

/// Validates a TLS-ALPN-01 challenge.
pub async fn validate_tls_alpn01(
    resolver: &dyn Resolver,
    config: &Config,
    metrics: &Metrics,
    ident: &Identifier,
    key_authorization: &str,
    deadline: Instant,
    records: &mut Vec<ValidationRecord>,
) -> Result<(), Problem> {
    if ident.as_dns().is_none() {
        info!(%ident, "Identifier type for TLS-ALPN-01 was not DNS");
        return Err(Problem::malformed(
            "Identifier type for TLS-ALPN-01 was not DNS",
        ));
    }
    let host = ident.lookup_name();
    let target = resolve_target(
        resolver,
        config.reserved_ip,
        &host,
        config.tls_port,
        "",
        deadline,
    )
    .await?;
    records.push(target.record(None));
    let addr = match target.current() {
        Some(addr) => SocketAddr::new(addr, config.tls_port),
        None => {
            return Err(Problem::connection(format!(
                "host {:?} has no IP addresses remaining to use",
                host
            )))
        }
    };

    let tls_config =
        insecure_client_config(vec![ACME_TLS_1_PROTOCOL.as_bytes().to_vec()])
            .map_err(|err| Problem::server_internal(err.to_string()))?;
    let sock = connect_tcp(addr, deadline).await.map_err(|err| {
        debug!(%host, %addr, error = %err, "TLS-ALPN-01 connect failed");
        err.problem()
    })?;
    let stream =
        connect_tls(tls_config, &host, sock, deadline)
            .await
            .map_err(|err| {
                info!(%host, %addr, error = %err, "TLS-ALPN-01 handshake failed");
                err.problem()
            })?;
    let (_, conn) = stream.get_ref();

    if conn.alpn_protocol() != Some(ACME_TLS_1_PROTOCOL.as_bytes()) {
        return Err(Problem::unauthorized(format!(
            "Cannot negotiate ALPN protocol {:?} for tls-alpn-01 challenge",
            ACME_TLS_1_PROTOCOL
        )));
    }

    let certs = match conn.peer_certificates() {
        Some(certs) if !certs.is_empty() => certs,
        _ => {
            return Err(Problem::unauthorized(
                "No certs presented for tls-alpn-01 challenge",
            ))
        }
    };
    let (_, leaf) = parse_x509_certificate(certs[0].as_ref()).map_err(|err| {
        Problem::tls(format!("Failed to parse leaf certificate: {}", err))
    })?;

    check_names(&leaf, &host, addr, certs.len())?;
    check_acme_extension(&leaf, metrics, key_authorization)
}

//------------ Certificate Checks --------------------------------------------

/// Checks that the certificate is for exactly the name being validated.
fn check_names(
    cert: &X509Certificate,
    host: &str,
    addr: SocketAddr,
    cert_count: usize,
) -> Result<(), Problem> {
    let sans = dns_sans(cert);
    if sans.len() == 1 && sans[0].eq_ignore_ascii_case(host) {
        return Ok(());
    }
    Err(Problem::unauthorized(format!(
        "{} Requested {} from {}. Received {} certificate(s), \
         first certificate had names {:?}",
        INCORRECT_CERT,
        host,
        addr,
        cert_count,
        cert_names(cert).join(", ")
    )))
}

/// Checks the acmeIdentifier extension against the key authorization.
fn check_acme_extension(
    cert: &X509Certificate,
    metrics: &Metrics,
    key_authorization: &str,
) -> Result<(), Problem> {
    let expected = key_authorization_hash(key_authorization);
    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        if oid != ID_PE_ACME_IDENTIFIER
            && oid != ID_PE_ACME_IDENTIFIER_V1_OBSOLETE
        {
            continue;
        }
        metrics
            .tls_alpn_oid_counter
            .with_label_values(&[oid.as_str()])
            .inc();
        if !ext.critical {
            return Err(Problem::unauthorized(format!(
                "{} acmeValidationV1 extension not critical.",
                INCORRECT_CERT
            )));
        }
        let value = match parse_der_octetstring(ext.value) {
            Ok((rest, obj)) if rest.is_empty() => obj.as_slice().ok(),
            _ => None,
        };
        let value = match value {
            Some(value) => value,
            None => {
                return Err(Problem::unauthorized(format!(
                    "{} Malformed acmeValidationV1 extension value.",
                    INCORRECT_CERT
                )))
            }
        };
        if bool::from(value.ct_eq(&expected[..])) {
            return Ok(());
        }
        return Err(Problem::unauthorized(format!(
            "{} Invalid acmeValidationV1 extension value.",
            INCORRECT_CERT
        )));
    }
    Err(Problem::unauthorized(format!(
        "{} Missing acmeValidationV1 extension.",
        INCORRECT_CERT
    )))
}

//------------ Certificate Names ---------------------------------------------

/// Returns the sorted, deduplicated subject names of a certificate.
///
/// This includes the common names of the subject and the DNS names of the
/// subject alternative names. Invalid UTF-8 is replaced.
pub fn cert_names(cert: &X509Certificate) -> Vec<String> {
    let mut names: Vec<String> = cert
        .subject()
        .iter_common_name()
        .map(|cn| String::from_utf8_lossy(cn.attr_value().data).into_owned())
        .collect();
    names.extend(dns_sans(cert));
    names.sort();
    names.dedup();
    names
}

/// Returns the DNS names of the subject alternative name extension.
fn dns_sans(cert: &X509Certificate) -> Vec<String> {
    let ext = cert.extensions().iter().find(|ext| {
        ext.oid == x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME
    });
    let ext = match ext {
        Some(ext) => ext,
        None => return Vec::new(),
    };
    match ext.parsed_extension() {
        ParsedExtension::SubjectAlternativeName(san) => san
            .general_names
            .iter()
            .filter_map(|name| match *name {
                GeneralName::DNSName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect(),
        // Names that are not valid UTF-8 fail the parser. Fall back to
        // picking the names from the raw value.
        _ => raw_dns_sans(ext.value),
    }
}

/// Extracts dNSName entries from a raw GeneralNames sequence.
fn raw_dns_sans(value: &[u8]) -> Vec<String> {
    const DNS_NAME: Tag = Tag(2);

    let mut res = Vec::new();
    let mut content = match Any::from_der(value) {
        Ok((_, seq)) if seq.header.tag() == Tag::Sequence => seq.data,
        _ => return res,
    };
    while let Ok((rest, name)) = Any::from_der(content) {
        if name.header.class() == Class::ContextSpecific
            && name.header.tag() == DNS_NAME
        {
            res.push(String::from_utf8_lossy(name.data).into_owned());
        }
        content = rest;
    }
    res
}

//============ Tests =========================================================
