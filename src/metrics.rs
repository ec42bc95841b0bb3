//! Process-wide validation metrics.
//!
//! Provides Prometheus metrics for:
//! - Time taken per validation, by challenge type and outcome
//! - Validations failed because of remote perspectives
//! - HTTP-01 address fallbacks and followed redirects
//! - The acmeIdentifier OID variant seen in TLS-ALPN-01 certificates
//! - CAA check outcomes

use crate::problem::Problem;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, HistogramVec, IntCounter,
    IntCounterVec, Registry,
};
use std::time::Duration;

//------------ Metrics -------------------------------------------------------

/// The metrics of a validation authority.
///
/// All metrics are registered with the registry given to [`Metrics::new`].
/// Collectors are internally reference counted, so clones share values.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Time taken to validate a challenge.
    /// Labels: type, result, problem_type
    pub validation_time: HistogramVec,

    /// Validations failed because too many remote perspectives failed.
    pub remote_validation_failures: IntCounter,

    /// HTTP-01 retries against the IPv4 fallback address.
    pub http01_fallbacks: IntCounter,

    /// HTTP-01 redirects followed.
    pub http01_redirects: IntCounter,

    /// TLS-ALPN-01 certificates seen per acmeIdentifier OID.
    /// Labels: oid
    pub tls_alpn_oid_counter: IntCounterVec,

    /// CAA checks performed.
    /// Labels: result
    pub caa_checks: IntCounterVec,
}

impl Metrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let validation_time = register_histogram_vec_with_registry!(
            "validation_time",
            "Time taken to validate a challenge",
            &["type", "result", "problem_type"],
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 7.5, 10.0, 15.0, 30.0, 45.0],
            registry
        )?;
        let remote_validation_failures = register_int_counter_with_registry!(
            "remote_validation_failures",
            "Number of validations failed due to remote VAs returning failure",
            registry
        )?;
        let http01_fallbacks = register_int_counter_with_registry!(
            "http01_fallbacks",
            "Number of IPv6 to IPv4 HTTP-01 fallback requests made",
            registry
        )?;
        let http01_redirects = register_int_counter_with_registry!(
            "http01_redirects",
            "Number of HTTP-01 redirects followed",
            registry
        )?;
        let tls_alpn_oid_counter = register_int_counter_vec_with_registry!(
            "tls_alpn_oid_counter",
            "Number of TLS ALPN validations with either of the two OIDs",
            &["oid"],
            registry
        )?;
        let caa_checks = register_int_counter_vec_with_registry!(
            "caa_checks",
            "Number of CAA checks by result",
            &["result"],
            registry
        )?;
        Ok(Metrics {
            validation_time,
            remote_validation_failures,
            http01_fallbacks,
            http01_redirects,
            tls_alpn_oid_counter,
            caa_checks,
        })
    }

    /// Records the time a validation took.
    pub fn observe_validation(
        &self,
        challenge_type: &str,
        problem: Option<&Problem>,
        elapsed: Duration,
    ) {
        let (result, problem_type) = match problem {
            Some(prob) => ("invalid", prob.problem_type.as_str()),
            None => ("valid", ""),
        };
        self.validation_time
            .with_label_values(&[challenge_type, result, problem_type])
            .observe(elapsed.as_secs_f64());
    }
}

//============ Tests =========================================================
