//! Validation problems.
//!
//! Every failure that leaves this crate is a [`Problem`]: a coarse
//! [`ProblemType`] plus a human readable detail string that is handed back
//! to the requester. Raw transport or parse errors never cross the public
//! API; they are classified into one of the types below first.

use core::fmt;
use serde::{Deserialize, Serialize};

//------------ ProblemType ---------------------------------------------------

/// The category of a validation failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProblemType {
    /// The request itself was bad, e.g., an IP identifier for DNS-01.
    Malformed,

    /// The evidence was fetched but did not prove control.
    Unauthorized,

    /// The validation target could not be reached.
    Connection,

    /// DNS resolution failed.
    Dns,

    /// The TLS handshake failed.
    Tls,

    /// CAA records forbid issuance.
    Caa,

    /// Something went wrong on our side.
    ServerInternal,
}

impl ProblemType {
    /// Returns the short name used in logs, metrics, and `Display`.
    pub fn as_str(self) -> &'static str {
        match self {
            ProblemType::Malformed => "malformed",
            ProblemType::Unauthorized => "unauthorized",
            ProblemType::Connection => "connection",
            ProblemType::Dns => "dns",
            ProblemType::Tls => "tls",
            ProblemType::Caa => "caa",
            ProblemType::ServerInternal => "serverInternal",
        }
    }

    /// Returns the ACME error URN for this problem type.
    pub fn urn(self) -> String {
        format!("urn:ietf:params:acme:error:{}", self.as_str())
    }
}

//--- Display

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ Problem -------------------------------------------------------

/// A typed validation failure.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// The category of the failure.
    #[serde(rename = "type")]
    pub problem_type: ProblemType,

    /// What went wrong, in words the requester can act upon.
    pub detail: String,
}

impl Problem {
    pub fn new(problem_type: ProblemType, detail: impl Into<String>) -> Self {
        Problem {
            problem_type,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Malformed, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Unauthorized, detail)
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Connection, detail)
    }

    pub fn dns(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Dns, detail)
    }

    pub fn tls(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Tls, detail)
    }

    pub fn caa(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Caa, detail)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::ServerInternal, detail)
    }
}

//--- Display and Error

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} :: {}", self.problem_type, self.detail)
    }
}

impl std::error::Error for Problem {}

//============ Tests =========================================================
