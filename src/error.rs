//! Error taxonomy for the broker core.
//!
//! Every fallible path in the store, exchanger, and orchestrator resolves to
//! one of these variants so the HTTP layer can map them to status codes
//! without string matching.

use thiserror::Error;

/// Result alias used throughout the broker core.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Typed failures produced by the store, exchanger, and orchestrator.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Bad caller input (e.g., missing code/state). Surfaced immediately,
    /// never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown `state` or identity. Row untouched.
    #[error("no flow found for state {0:?}")]
    NotFound(String),

    /// A flow with this `state` already exists; the caller must regenerate.
    #[error("a flow with state {0:?} already exists")]
    Conflict(String),

    /// Non-2xx from the provider's token endpoint. Carries the provider's
    /// status and body for diagnostics.
    #[error("token exchange failed with status {status}: {body}")]
    ExchangeFailed { status: u16, body: String },

    /// The provider did not return a stable identity for this flow.
    /// Fatal to the callback; the row stays token-bound for inspection.
    #[error("no stable external identity: {0}")]
    NoExternalId(String),

    /// The provider signalled maintenance. Transient; does not count
    /// against the refresh-failure budget.
    #[error("identity provider is under maintenance")]
    ProviderMaintenance,

    /// Transport-level failure talking to the provider.
    #[error("connection error: {0}")]
    Connection(String),

    /// A refresh attempt failed; `reason` says whether the row survived.
    #[error("refresh failed for state {state:?}: {reason}")]
    RefreshFailed {
        state: String,
        reason: RefreshFailReason,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Why a refresh attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailReason {
    /// No row for the given `state`.
    NoSuchState,
    /// Provider maintenance; tolerated, counters untouched.
    ProviderMaintenance,
    /// Retryable failure; the failure counter was incremented.
    TryLater,
    /// The failure budget was exhausted and the row was deleted.
    RemovedByFailureBudget,
}

impl std::fmt::Display for RefreshFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshFailReason::NoSuchState => write!(f, "no such state"),
            RefreshFailReason::ProviderMaintenance => write!(f, "provider maintenance"),
            RefreshFailReason::TryLater => write!(f, "refresh failed, try later"),
            RefreshFailReason::RemovedByFailureBudget => {
                write!(f, "removed due to refresh rate limiting")
            }
        }
    }
}
