//! An ACME domain control validation engine.
//!
//! Before a certificate authority issues a certificate for a name, the
//! requester has to prove control over that name. ACME does this through
//! challenges: the requester places a value derived from its account key
//! somewhere only the owner of the name can place it, and the CA fetches
//! it from there. This crate implements fetching and checking that value
//! for the HTTP-01, DNS-01, DNS-ACCOUNT-01, and TLS-ALPN-01 challenges as
//! well as checking CAA records.
//!
//! Since a single network vantage point can be misled, validations can be
//! corroborated by any number of remote perspectives of which only a
//! configurable number may disagree.
//!
//! # Modules
//!
//! The entry point is [`ValidationAuthority`][va::ValidationAuthority] in
//! the [va] module. It dispatches challenges to the validators:
//!
//! * [http] for HTTP-01,
//! * [dns] for DNS-01 and DNS-ACCOUNT-01, and
//! * [tls] for TLS-ALPN-01.
//!
//! CAA records are checked by the [caa] module and remote perspectives
//! are consulted via the [remote] module.
//!
//! Validators use the DNS through the [`Resolver`][resolver::Resolver]
//! trait. An implementation based on the stub resolver of the
//! [domain](https://github.com/NLnetLabs/domain) crate is available in
#![cfg_attr(feature = "resolv", doc = "  [resolver::stub].")]
#![cfg_attr(not(feature = "resolv"), doc = "  resolver::stub.")]
//!
//! # Reference of Feature Flags
//!
//! * `resolv`: Enables the DNS client based on the stub resolver of the
//!   `domain` crate. This feature is enabled by default.

#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod caa;
pub mod challenge;
pub mod config;
pub mod dns;
pub mod http;
pub mod identifier;
pub mod metrics;
pub mod net;
pub mod problem;
pub mod remote;
pub mod resolver;
pub mod target;
pub mod tls;
pub mod va;

pub use self::challenge::{
    AuthorizationContext, Challenge, ChallengeType, Status, ValidationRecord,
};
pub use self::config::Config;
pub use self::identifier::Identifier;
pub use self::problem::{Problem, ProblemType};
pub use self::va::{ValidationAuthority, ValidationResult};
