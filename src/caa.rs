//! The CAA policy checker.
//!
//! Before issuing for a name, the CAA records relevant for it decide
//! whether this CA may do so. The relevant records are those of the
//! closest name when walking up the tree from the name itself towards the
//! root which has any CAA records at all. All candidate names are looked
//! up at once and the results are then considered in tree order.
//!
//! A lookup error for a name closer to the leaf than the first name with
//! records fails the whole check. We cannot know whether that name would
//! have had records.

use crate::identifier::Identifier;
use crate::metrics::Metrics;
use crate::problem::Problem;
use crate::resolver::{lookup_with_deadline, CaaRecord, DnsError, Resolver};
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info};

//------------ Module Configuration ------------------------------------------

/// The issuer critical flag.
const CRITICAL_FLAG: u8 = 0x80;

/// Bit 0 of the flags which early CAA implementations used as the
/// critical flag and is treated the same.
const LEGACY_CRITICAL_FLAG: u8 = 0x01;

//------------ CaaSet --------------------------------------------------------

/// The CAA records of a name sorted by tag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CaaSet {
    pub issue: Vec<CaaRecord>,
    pub issuewild: Vec<CaaRecord>,
    pub iodef: Vec<CaaRecord>,
    pub unknown: Vec<CaaRecord>,
}

impl CaaSet {
    /// Sorts records into a set.
    ///
    /// Tags are compared case-insensitively.
    pub fn from_records(records: Vec<CaaRecord>) -> Self {
        let mut res = CaaSet::default();
        for record in records {
            let tag = record.tag.to_ascii_lowercase();
            match tag.as_str() {
                "issue" => res.issue.push(record),
                "issuewild" => res.issuewild.push(record),
                "iodef" => res.iodef.push(record),
                _ => res.unknown.push(record),
            }
        }
        res
    }

    /// Returns whether there is a record with a critical unknown tag.
    pub fn critical_unknown(&self) -> bool {
        self.unknown.iter().any(|record| {
            record.flags & (CRITICAL_FLAG | LEGACY_CRITICAL_FLAG) != 0
        })
    }

    /// Returns whether the set allows `issuer_domain` to issue.
    ///
    /// For wildcard names, `issuewild` records take precedence over
    /// `issue` records if there are any.
    pub fn permits(&self, issuer_domain: &str, wildcard: bool) -> bool {
        if self.critical_unknown() {
            return false;
        }
        let records = if wildcard && !self.issuewild.is_empty() {
            &self.issuewild
        } else {
            &self.issue
        };
        if records.is_empty() {
            return true;
        }
        records.iter().any(|record| {
            extract_issuer(&record.value).eq_ignore_ascii_case(issuer_domain)
        })
    }
}

/// Returns the issuer domain of an `issue` or `issuewild` value.
///
/// Parameters following a semicolon are dropped. A value that is just a
/// semicolon yields an empty domain which never matches.
pub fn extract_issuer(value: &str) -> &str {
    let domain = match value.split_once(';') {
        Some((domain, _)) => domain,
        None => value,
    };
    domain.trim_matches([' ', '\t'])
}

//------------ Tree Walk -----------------------------------------------------

/// Returns the names considered for a name, starting with the name itself.
pub fn tree_names(name: &str) -> Vec<String> {
    let name = name.trim_end_matches('.');
    let mut res = Vec::new();
    let mut rest = name;
    while !rest.is_empty() {
        res.push(rest.to_string());
        rest = match rest.split_once('.') {
            Some((_, parent)) => parent,
            None => "",
        };
    }
    res
}

/// Picks the relevant set from per-name lookup results in tree order.
///
/// Returns `Ok(None)` if no name has any records.
pub fn parse_results(
    results: Vec<Result<Vec<CaaRecord>, DnsError>>,
) -> Result<Option<CaaSet>, DnsError> {
    for res in results {
        let records = res?;
        if !records.is_empty() {
            return Ok(Some(CaaSet::from_records(records)));
        }
    }
    Ok(None)
}

/// Looks up the relevant CAA set for a name.
pub async fn lookup_caa_set(
    resolver: &dyn Resolver,
    name: &str,
    deadline: Instant,
) -> Result<Option<CaaSet>, DnsError> {
    let names = tree_names(name);
    let results = join_all(names.iter().map(|name| {
        lookup_with_deadline(deadline, "CAA", name, resolver.lookup_caa(name))
    }))
    .await;
    parse_results(results)
}

//------------ Checking ------------------------------------------------------

/// Checks whether CAA records permit issuing for an identifier.
///
/// Returns whether records are present and whether they permit issuing.
/// If there are no records, issuing is permitted. IP identifiers are not
/// subject to CAA.
pub async fn check_caa_records(
    resolver: &dyn Resolver,
    issuer_domain: &str,
    ident: &Identifier,
    deadline: Instant,
) -> Result<(bool, bool), DnsError> {
    if ident.as_dns().is_none() {
        return Ok((false, true));
    }
    let name = ident.lookup_name();
    let set = match lookup_caa_set(resolver, &name, deadline).await? {
        Some(set) => set,
        None => {
            debug!(%name, "no CAA records");
            return Ok((false, true));
        }
    };
    let valid = set.permits(issuer_domain, ident.is_wildcard());
    debug!(%name, ?set, valid, "CAA records found");
    Ok((true, valid))
}

/// Checks CAA records and turns a negative outcome into a problem.
pub async fn check_caa(
    resolver: &dyn Resolver,
    issuer_domain: &str,
    metrics: &Metrics,
    ident: &Identifier,
    deadline: Instant,
) -> Result<(), Problem> {
    let res = check_caa_records(resolver, issuer_domain, ident, deadline).await;
    let (present, valid) = match res {
        Ok(res) => res,
        Err(err) => {
            metrics.caa_checks.with_label_values(&["error"]).inc();
            return Err(Problem::dns(format!(
                "While processing CAA for {}: {}",
                ident, err
            )));
        }
    };
    info!(%ident, present, valid, "Checked CAA records");
    if !valid {
        metrics.caa_checks.with_label_values(&["unauthorized"]).inc();
        return Err(Problem::caa(format!(
            "CAA record for {} prevents issuance",
            ident
        )));
    }
    metrics.caa_checks.with_label_values(&["authorized"]).inc();
    Ok(())
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolver::DnsErrorKind;
    use rstest::rstest;

    #[test]
    fn names() {
        assert_eq!(
            tree_names("nx.critical.com."),
            vec!["nx.critical.com", "critical.com", "com"]
        );
        assert_eq!(tree_names("com"), vec!["com"]);
        assert!(tree_names("").is_empty());
    }

    #[rstest]
    #[case("letsencrypt.org", "letsencrypt.org")]
    #[case("  letsencrypt.org  ;foo=bar;baz=bar", "letsencrypt.org")]
    #[case("letsencrypt.org; validationmethods=dns-01", "letsencrypt.org")]
    #[case(";", "")]
    #[case("", "")]
    fn issuer(#[case] value: &str, #[case] expected: &str) {
        assert_eq!(extract_issuer(value), expected);
    }

    #[rstest]
    #[case(vec![CaaRecord::new(0, "issue", "ca.com")], false)]
    #[case(vec![CaaRecord::new(0, "ISSUE", "letsencrypt.org")], true)]
    #[case(vec![CaaRecord::new(0, "issue", ";")], false)]
    #[case(vec![CaaRecord::new(0x7e, "foo", "bar")], true)]
    #[case(vec![CaaRecord::new(128, "foo", "bar")], false)]
    #[case(vec![CaaRecord::new(1, "foo", "bar")], false)]
    #[case(
        vec![
            CaaRecord::new(128, "foo", "bar"),
            CaaRecord::new(0, "issue", "letsencrypt.org"),
        ],
        false
    )]
    #[case(vec![CaaRecord::new(0, "iodef", "mailto:a@b.c")], true)]
    #[case(vec![CaaRecord::new(0, "issuewild", ";")], true)]
    fn permits(#[case] records: Vec<CaaRecord>, #[case] expected: bool) {
        let set = CaaSet::from_records(records);
        assert_eq!(set.permits("letsencrypt.org", false), expected);
    }

    #[test]
    fn issuewild_precedence() {
        let set = CaaSet::from_records(vec![
            CaaRecord::new(0, "issue", "letsencrypt.org"),
            CaaRecord::new(0, "issuewild", ";"),
        ]);
        assert!(set.permits("letsencrypt.org", false));
        assert!(!set.permits("letsencrypt.org", true));

        let set = CaaSet::from_records(vec![CaaRecord::new(
            0,
            "issue",
            "letsencrypt.org",
        )]);
        assert!(set.permits("letsencrypt.org", true));
    }

    #[test]
    fn results_in_order() {
        assert_eq!(parse_results(vec![]), Ok(None));

        let err = DnsError::new("CAA", "a.com", DnsErrorKind::Other("".into()));
        let res = parse_results(vec![
            Err(err.clone()),
            Ok(vec![CaaRecord::new(0, "", "test")]),
        ]);
        assert_eq!(res, Err(err.clone()));

        let expected = CaaRecord::new(0, "", "other-test");
        let res = parse_results(vec![
            Ok(vec![]),
            Ok(vec![expected.clone()]),
            Err(err),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(res.unknown, vec![expected]);
    }
}
