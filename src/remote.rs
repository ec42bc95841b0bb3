//! Corroborating validations from remote perspectives.
//!
//! A single network vantage point can be fooled by a hijacked route or a
//! poisoned resolver. Validations are therefore repeated by a number of
//! independently operated remote perspectives and a limited number of
//! them is allowed to disagree.
//!
//! Each remote perspective is dispatched in its own task with its own
//! timeout. Results are collected through a channel with room for every
//! dispatch. Collection stops as soon as the outcome can no longer
//! change, at which point dispatches still outstanding are aborted.
//!
//! A dispatch that was cancelled or timed out has no say in the outcome.
//! It counts neither as a success nor as a failure.

use crate::challenge::{AuthorizationContext, Challenge, ValidationRecord};
use crate::identifier::Identifier;
use crate::problem::Problem;
use core::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};

//------------ RemoteVa ------------------------------------------------------

/// The future returned by [`RemoteVa::perform_validation`].
pub type RemoteFuture<'a> = Pin<
    Box<
        dyn Future<Output = Result<Vec<ValidationRecord>, RemoteError>>
            + Send
            + 'a,
    >,
>;

/// A validation authority that can be asked to validate a challenge.
///
/// This may be an authority in the same process or a proxy talking to one
/// elsewhere.
pub trait RemoteVa: Send + Sync {
    /// Validates a challenge for an identifier.
    ///
    /// A failed validation is reported as [`RemoteError::Problem`].
    fn perform_validation<'a>(
        &'a self,
        ident: &'a Identifier,
        challenge: &'a Challenge,
        authz: &'a AuthorizationContext,
    ) -> RemoteFuture<'a>;
}

//------------ RemotePerspective ---------------------------------------------

/// A remote validation authority and the name it is known by.
///
/// The name is only used in logs.
#[derive(Clone)]
pub struct RemotePerspective {
    pub handle: Arc<dyn RemoteVa>,
    pub name: String,
}

impl RemotePerspective {
    pub fn new(handle: Arc<dyn RemoteVa>, name: impl Into<String>) -> Self {
        RemotePerspective {
            handle,
            name: name.into(),
        }
    }
}

impl fmt::Debug for RemotePerspective {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemotePerspective")
            .field("name", &self.name)
            .finish()
    }
}

//------------ corroborate ---------------------------------------------------

/// Dispatches a validation to all remote perspectives and tallies the votes.
///
/// Fails once more than `max_failures` perspectives reported a failure.
/// Succeeds as soon as this can no longer happen.
pub async fn corroborate(
    remotes: &[RemotePerspective],
    max_failures: usize,
    remote_timeout: Duration,
    ident: &Identifier,
    challenge: &Challenge,
    authz: &AuthorizationContext,
) -> Result<(), Problem> {
    if remotes.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel(remotes.len());
    let mut dispatches = Dispatches(Vec::with_capacity(remotes.len()));
    for remote in remotes {
        let tx = tx.clone();
        let remote = remote.clone();
        let ident = ident.clone();
        let challenge = challenge.clone();
        let authz = authz.clone();
        dispatches.0.push(tokio::spawn(async move {
            let res = match timeout(
                remote_timeout,
                remote.handle.perform_validation(&ident, &challenge, &authz),
            )
            .await
            {
                Ok(res) => res.map(|_| ()),
                Err(_) => Err(RemoteError::Cancelled),
            };
            // The receiver is gone once the outcome is decided.
            let _ = tx.send((remote.name, res)).await;
        }));
    }
    drop(tx);

    let mut tally = Tally::new(remotes.len(), max_failures);
    while let Some((name, res)) = rx.recv().await {
        debug!(remote = %name, ?res, "remote validation result");
        if let Err(RemoteError::Internal(ref err)) = res {
            error!(
                target: "audit",
                "Remote VA {:?}.PerformValidation failed: {}",
                name,
                err
            );
        }
        tally.add(res);
        if let Some(res) = tally.outcome() {
            return res;
        }
    }

    // Only reachable if a task died without reporting. These are non-votes.
    Ok(())
}

/// Aborts all dispatches still running when dropped.
struct Dispatches(Vec<JoinHandle<()>>);

impl Drop for Dispatches {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

//------------ Tally ---------------------------------------------------------

/// The votes of the remote perspectives received so far.
#[derive(Clone, Debug)]
pub struct Tally {
    /// The number of dispatches.
    total: usize,

    /// The number of failures that can be tolerated.
    max_failures: usize,

    received: usize,
    good: usize,
    bad: usize,

    /// The number of failures caused by the remote itself.
    internal: usize,

    /// The first validation problem reported.
    first_problem: Option<Problem>,
}

impl Tally {
    pub fn new(total: usize, max_failures: usize) -> Self {
        Tally {
            total,
            max_failures,
            received: 0,
            good: 0,
            bad: 0,
            internal: 0,
            first_problem: None,
        }
    }

    /// Adds the result of a single dispatch.
    pub fn add(&mut self, res: Result<(), RemoteError>) {
        self.received += 1;
        match res {
            Ok(()) => self.good += 1,
            Err(RemoteError::Cancelled) => {}
            Err(RemoteError::Problem(problem)) => {
                self.bad += 1;
                if self.first_problem.is_none() {
                    self.first_problem = Some(problem);
                }
            }
            Err(RemoteError::Internal(_)) => {
                self.bad += 1;
                self.internal += 1;
            }
        }
    }

    pub fn good(&self) -> usize {
        self.good
    }

    pub fn bad(&self) -> usize {
        self.bad
    }

    /// Returns the outcome if it is determined.
    ///
    /// A failure caused only by remotes failing themselves, rather than
    /// the validation failing, is a server internal problem.
    pub fn outcome(&self) -> Option<Result<(), Problem>> {
        if self.bad > self.max_failures {
            if self.internal == self.bad {
                return Some(Err(Problem::server_internal(
                    "Remote PerformValidation RPCs failed",
                )));
            }
            let problem = self.first_problem.clone().map(|mut problem| {
                problem.detail =
                    format!("During secondary validation: {}", problem.detail);
                problem
            });
            return Some(Err(problem.unwrap_or_else(|| {
                Problem::server_internal("Remote PerformValidation RPCs failed")
            })));
        }
        let outstanding = self.total.saturating_sub(self.received);
        if self.bad + outstanding <= self.max_failures {
            return Some(Ok(()));
        }
        None
    }
}

//------------ RemoteError ---------------------------------------------------

/// A remote perspective did not confirm a validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteError {
    /// The validation failed.
    Problem(Problem),

    /// The request was cancelled before the remote answered.
    Cancelled,

    /// The remote could not be asked.
    Internal(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RemoteError::Problem(ref problem) => {
                fmt::Display::fmt(problem, f)
            }
            RemoteError::Cancelled => f.write_str("cancelled"),
            RemoteError::Internal(ref err) => f.write_str(err),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<Problem> for RemoteError {
    fn from(problem: Problem) -> Self {
        RemoteError::Problem(problem)
    }
}

//============ Tests =========================================================
