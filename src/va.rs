//! The validation authority.
//!
//! [`ValidationAuthority`] is the entry point for validating challenges.
//! It picks the validator for the challenge type, runs it locally while
//! the remote perspectives repeat the validation, and combines the
//! outcomes. Every validation ends with an audit log line carrying the
//! records and the problem, if any.
//!
//! The authority also answers whether CAA records permit issuing for a
//! name. This is a separate check made when issuing, not part of
//! validating a challenge.

use crate::caa;
use crate::challenge::{
    AuthorizationContext, Challenge, ChallengeType, Status, ValidationRecord,
};
use crate::config::{Config, ConfigError};
use crate::dns::{validate_dns01, validate_dns_account01};
use crate::http::validate_http01;
use crate::identifier::Identifier;
use crate::metrics::Metrics;
use crate::problem::Problem;
use crate::remote::{
    corroborate, RemoteError, RemoteFuture, RemotePerspective, RemoteVa,
};
use crate::resolver::{DnsError, Resolver};
use crate::tls::validate_tls_alpn01;
use core::fmt;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

//------------ ValidationAuthority -------------------------------------------

/// Validates challenges and checks CAA records.
pub struct ValidationAuthority {
    config: Config,
    resolver: Arc<dyn Resolver>,
    remotes: Vec<RemotePerspective>,
    metrics: Metrics,
}

impl ValidationAuthority {
    /// Creates a new authority.
    ///
    /// The metrics are registered with `registry`. This fails if the
    /// registry already has them, so every authority needs a registry
    /// of its own.
    pub fn new(
        config: Config,
        resolver: Arc<dyn Resolver>,
        remotes: Vec<RemotePerspective>,
        registry: &prometheus::Registry,
    ) -> Result<Self, VaError> {
        config.check()?;
        config.check_remotes(remotes.len())?;
        let metrics = Metrics::new(registry)?;
        Ok(ValidationAuthority {
            config,
            resolver,
            remotes,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn remotes(&self) -> &[RemotePerspective] {
        &self.remotes
    }

    /// Validates a challenge for an identifier.
    ///
    /// The challenge is validated locally and by all remote perspectives
    /// at the same time. A local failure is returned right away. Otherwise
    /// the outcome is that of the remote perspectives.
    pub async fn perform_validation(
        &self,
        ident: &Identifier,
        challenge: &Challenge,
        authz: &AuthorizationContext,
    ) -> ValidationResult {
        let start = Instant::now();
        let (records, problem) =
            self.validate_and_corroborate(ident, challenge, authz, start).await;
        let status = if problem.is_some() {
            Status::Invalid
        } else {
            Status::Valid
        };

        self.metrics.observe_validation(
            challenge.challenge_type.as_str(),
            problem.as_ref(),
            start.elapsed(),
        );
        let log = ValidationLog {
            identifier: ident,
            challenge_type: challenge.challenge_type,
            status,
            perspective: &self.config.perspective,
            records: &records,
            problem: problem.as_ref(),
            latency: start.elapsed().as_secs_f64(),
        };
        match serde_json::to_string(&log) {
            Ok(json) => {
                info!(target: "audit", "Validation result JSON={}", json)
            }
            Err(err) => {
                warn!(target: "audit", %ident, error = %err, "Validation result")
            }
        }

        ValidationResult {
            records,
            problem,
            status,
        }
    }

    async fn validate_and_corroborate(
        &self,
        ident: &Identifier,
        challenge: &Challenge,
        authz: &AuthorizationContext,
        start: Instant,
    ) -> (Vec<ValidationRecord>, Option<Problem>) {
        if let Err(err) = challenge.check_consistency() {
            return (
                Vec::new(),
                Some(Problem::malformed(format!(
                    "Challenge failed consistency check: {}",
                    err
                ))),
            );
        }

        let deadline = start + self.config.timeout;
        let local = self.validate_challenge(ident, challenge, authz, deadline);
        let remote = corroborate(
            &self.remotes,
            self.config.max_remote_failures,
            self.config.remote_timeout,
            ident,
            challenge,
            authz,
        );
        tokio::pin!(local);
        tokio::pin!(remote);

        let mut remote_res = None;
        let (records, local_res) = loop {
            tokio::select! {
                res = &mut local => break res,
                res = &mut remote, if remote_res.is_none() => {
                    remote_res = Some(res);
                }
            }
        };
        if let Err(problem) = local_res {
            return (records, Some(problem));
        }
        if !challenge.records_sane(&records) {
            return (
                records,
                Some(Problem::server_internal(
                    "Records for validation failed sanity check",
                )),
            );
        }
        let remote_res = match remote_res {
            Some(res) => res,
            None => remote.await,
        };
        if let Err(problem) = remote_res {
            self.metrics.remote_validation_failures.inc();
            info!(
                target: "audit",
                %ident,
                challenge_type = %challenge.challenge_type,
                problem = %problem,
                "Validation failed due to remote failures"
            );
            return (records, Some(problem));
        }
        (records, None)
    }

    /// Validates a challenge from this perspective only.
    ///
    /// Returns the records collected even if validation fails.
    pub async fn validate_challenge(
        &self,
        ident: &Identifier,
        challenge: &Challenge,
        authz: &AuthorizationContext,
        deadline: Instant,
    ) -> (Vec<ValidationRecord>, Result<(), Problem>) {
        let resolver = &*self.resolver;
        let key_authz = challenge.key_authorization.as_str();
        let mut records = Vec::new();
        let res = match challenge.challenge_type {
            ChallengeType::Http01 => {
                validate_http01(
                    resolver,
                    &self.config,
                    &self.metrics,
                    ident,
                    &challenge.token,
                    key_authz,
                    deadline,
                    &mut records,
                )
                .await
            }
            ChallengeType::Dns01 => {
                validate_dns01(resolver, ident, key_authz, deadline, &mut records)
                    .await
            }
            ChallengeType::DnsAccount01 => {
                validate_dns_account01(
                    resolver,
                    &self.config,
                    ident,
                    key_authz,
                    authz.account_uri.as_deref(),
                    deadline,
                    &mut records,
                )
                .await
            }
            ChallengeType::TlsAlpn01 => {
                validate_tls_alpn01(
                    resolver,
                    &self.config,
                    &self.metrics,
                    ident,
                    key_authz,
                    deadline,
                    &mut records,
                )
                .await
            }
        };
        (records, res)
    }

    /// Returns whether CAA records are present and permit issuing.
    pub async fn check_caa_records(
        &self,
        ident: &Identifier,
    ) -> Result<(bool, bool), DnsError> {
        caa::check_caa_records(
            &*self.resolver,
            &self.config.issuer_domain,
            ident,
            Instant::now() + self.config.timeout,
        )
        .await
    }

    /// Checks whether CAA records permit issuing for a domain.
    ///
    /// Returns the problem if they don’t or if they couldn’t be checked.
    pub async fn is_caa_valid(&self, domain: &str) -> Option<Problem> {
        caa::check_caa(
            &*self.resolver,
            &self.config.issuer_domain,
            &self.metrics,
            &Identifier::dns(domain),
            Instant::now() + self.config.timeout,
        )
        .await
        .err()
    }
}

//--- RemoteVa

impl RemoteVa for ValidationAuthority {
    fn perform_validation<'a>(
        &'a self,
        ident: &'a Identifier,
        challenge: &'a Challenge,
        authz: &'a AuthorizationContext,
    ) -> RemoteFuture<'a> {
        Box::pin(async move {
            let res = ValidationAuthority::perform_validation(
                self, ident, challenge, authz,
            )
            .await;
            match res.problem {
                None => Ok(res.records),
                Some(problem) => Err(RemoteError::Problem(problem)),
            }
        })
    }
}

impl fmt::Debug for ValidationAuthority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValidationAuthority")
            .field("config", &self.config)
            .field("remotes", &self.remotes)
            .finish()
    }
}

//------------ ValidationResult ----------------------------------------------

/// The outcome of validating a challenge.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub records: Vec<ValidationRecord>,
    pub problem: Option<Problem>,
    pub status: Status,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }
}

/// The audit log entry of a validation.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationLog<'a> {
    identifier: &'a Identifier,
    challenge_type: ChallengeType,
    status: Status,
    perspective: &'a str,
    records: &'a [ValidationRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    problem: Option<&'a Problem>,
    latency: f64,
}

//------------ VaError -------------------------------------------------------

/// A validation authority could not be created.
#[derive(Debug)]
pub enum VaError {
    Config(ConfigError),
    Metrics(prometheus::Error),
}

impl From<ConfigError> for VaError {
    fn from(err: ConfigError) -> Self {
        VaError::Config(err)
    }
}

impl From<prometheus::Error> for VaError {
    fn from(err: prometheus::Error) -> Self {
        VaError::Metrics(err)
    }
}

impl fmt::Display for VaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VaError::Config(ref err) => {
                write!(f, "invalid configuration: {}", err)
            }
            VaError::Metrics(ref err) => {
                write!(f, "failed to register metrics: {}", err)
            }
        }
    }
}

impl std::error::Error for VaError {}

//============ Tests =========================================================
