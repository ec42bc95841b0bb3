//! A resolver atop the `domain` crate’s stub resolver.
//!
//! This relays all queries to the recursive resolvers configured for the
//! system (or in a given [`ResolvConf`]), which do the actual work.

use super::{
    CaaRecord, DnsError, DnsErrorKind, LookupFuture, Resolver, ResolverAddrs,
};
use bytes::Bytes;
use domain::base::iana::{Rcode, Rtype};
use domain::base::message::RecordSection;
use domain::base::{Message, Name};
use domain::rdata::{Caa, Txt};
use domain::resolv::stub::conf::ResolvConf;
use domain::resolv::stub::Answer;
use domain::resolv::StubResolver;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::string::String;
use std::vec::Vec;
use tracing::{debug, trace};

//------------ StubClient ----------------------------------------------------

/// A [`Resolver`] relaying to the configured recursive resolvers.
#[derive(Clone, Debug)]
pub struct StubClient {
    resolver: StubResolver,

    /// The configured server addresses, reported with every answer.
    servers: ResolverAddrs,
}

impl StubClient {
    /// Creates a client using the system’s resolver configuration.
    pub fn new() -> Self {
        Self::from_conf(ResolvConf::default())
    }

    /// Creates a client using the given resolver configuration.
    pub fn from_conf(conf: ResolvConf) -> Self {
        let servers = conf
            .servers
            .iter()
            .map(|server| server.addr.to_string())
            .collect();
        StubClient {
            resolver: StubResolver::from_conf(conf),
            servers,
        }
    }

    /// Queries for `rtype` records and returns the response.
    async fn query(
        &self,
        qtype: &'static str,
        hostname: &str,
        rtype: Rtype,
    ) -> Result<Message<Bytes>, DnsError> {
        let name = parse_name(qtype, hostname)?;
        self.resolver
            .query((name, rtype))
            .await
            .map(Answer::into_message)
            .map_err(|err| io_error(qtype, hostname, err))
    }
}

impl Default for StubClient {
    fn default() -> Self {
        Self::new()
    }
}

//--- Resolver

impl Resolver for StubClient {
    fn lookup_host<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<IpAddr>, ResolverAddrs)> {
        Box::pin(async move {
            let name = parse_name("A", hostname)?;
            let found = self
                .resolver
                .lookup_host(&name)
                .await
                .map_err(|err| io_error("A", hostname, err))?;
            let addrs: Vec<IpAddr> = found.iter().collect();
            trace!(%hostname, ?addrs, "resolved host");
            Ok((addrs, self.servers.clone()))
        })
    }

    fn lookup_txt<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, (Vec<String>, ResolverAddrs)> {
        Box::pin(async move {
            let message = self.query("TXT", hostname, Rtype::TXT).await?;
            Ok((txt_strings(hostname, &message)?, self.servers.clone()))
        })
    }

    fn lookup_caa<'a>(
        &'a self,
        hostname: &'a str,
    ) -> LookupFuture<'a, Vec<CaaRecord>> {
        Box::pin(async move {
            let message = self.query("CAA", hostname, Rtype::CAA).await?;
            caa_records(hostname, &message)
        })
    }
}

//------------ Answer Processing ---------------------------------------------

/// Returns the answer section of a response.
///
/// NXDOMAIN results in `None`. Other error response codes are returned as
/// errors.
fn answer_section<'a>(
    qtype: &'static str,
    hostname: &str,
    message: &'a Message<Bytes>,
) -> Result<Option<RecordSection<'a, Bytes>>, DnsError> {
    let rcode = message.header().rcode();
    if rcode == Rcode::NXDOMAIN {
        trace!(%hostname, qtype, "NXDOMAIN");
        return Ok(None);
    }
    if rcode != Rcode::NOERROR {
        debug!(%hostname, qtype, %rcode, "error response code");
        return Err(DnsError::new(
            qtype,
            hostname,
            DnsErrorKind::Rcode(rcode.to_string()),
        ));
    }
    message
        .answer()
        .map(Some)
        .map_err(|_| malformed(qtype, hostname, "malformed response"))
}

/// Collects the text of all TXT records in a response.
fn txt_strings(
    hostname: &str,
    message: &Message<Bytes>,
) -> Result<Vec<String>, DnsError> {
    let section = match answer_section("TXT", hostname, message)? {
        Some(section) => section,
        None => return Ok(Vec::new()),
    };
    let mut res = Vec::new();
    for record in section.limit_to::<Txt<_>>() {
        let record = record
            .map_err(|_| malformed("TXT", hostname, "malformed TXT record"))?;
        res.push(txt_string(record.data()));
    }
    Ok(res)
}

/// Concatenates the character strings of TXT record data.
fn txt_string(txt: &Txt<Bytes>) -> String {
    String::from_utf8_lossy(&txt.text::<Vec<u8>>()).into_owned()
}

/// Collects all CAA records in a response.
fn caa_records(
    hostname: &str,
    message: &Message<Bytes>,
) -> Result<Vec<CaaRecord>, DnsError> {
    let section = match answer_section("CAA", hostname, message)? {
        Some(section) => section,
        None => return Ok(Vec::new()),
    };
    let mut res = Vec::new();
    for record in section.limit_to::<Caa<_>>() {
        let record = record
            .map_err(|_| malformed("CAA", hostname, "malformed CAA record"))?;
        res.push(caa_record(record.data()));
    }
    Ok(res)
}

fn caa_record(caa: &Caa<Bytes>) -> CaaRecord {
    CaaRecord::new(
        caa.flags(),
        String::from_utf8_lossy(caa.tag().as_slice()),
        String::from_utf8_lossy(caa.value().as_ref()),
    )
}

//------------ Helpers -------------------------------------------------------

fn parse_name(
    qtype: &'static str,
    hostname: &str,
) -> Result<Name<Vec<u8>>, DnsError> {
    Name::from_str(hostname).map_err(|_| {
        DnsError::new(
            qtype,
            hostname,
            DnsErrorKind::Other("invalid domain name".into()),
        )
    })
}

fn io_error(qtype: &'static str, hostname: &str, err: io::Error) -> DnsError {
    let kind = match err.kind() {
        io::ErrorKind::TimedOut => DnsErrorKind::Timeout,
        _ => DnsErrorKind::Network,
    };
    debug!(%hostname, qtype, error = %err, "DNS query failed");
    DnsError::new(qtype, hostname, kind)
}

fn malformed(qtype: &'static str, hostname: &str, what: &str) -> DnsError {
    DnsError::new(qtype, hostname, DnsErrorKind::Other(what.into()))
}

//============ Tests =========================================================
