//! Durable per-flow authorization storage.
//!
//! One row per authorization flow attempt, keyed by the opaque `state`
//! string. The store owns the uniqueness invariant on `external_id` and the
//! transactional identity-merge that resolves conflicts when a user restarts
//! a flow for an identity that already has a row.

use chrono::{DateTime, Utc};
use serde::Serialize;

mod sqlite;

pub use sqlite::TokenStore;

/// One authorization flow attempt.
///
/// Lifecycle: created (state + verifier only) → code-bound → token-bound
/// (failure counter reset) → identity-bound → mutated in place on every
/// refresh → deleted on revocation or when the refresh-failure budget is
/// exhausted.
#[derive(Clone, Debug, Serialize)]
pub struct AuthorizationRecord {
    /// PKCE secret, write-once at creation
    pub code_verifier: String,

    /// Opaque flow identifier and primary lookup key. Mutable only by the
    /// identity-merge, which reassigns the surviving row to the newest key.
    pub state: String,

    /// When the flow was created
    pub created_at: DateTime<Utc>,

    /// Provider-issued authorization code, set once after the redirect
    pub code: Option<String>,

    pub access_token: Option<String>,
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds, as stated by the provider
    pub expires_in: Option<i64>,

    /// Unix timestamp the access token's lifetime is measured from
    pub token_issued_at: Option<i64>,

    /// Display identity; cosmetic, never part of identity uniqueness
    pub nickname: Option<String>,

    /// Stable provider-assigned identity. Unique across all rows when
    /// non-null; the durable anchor a regenerated flow is merged onto.
    pub external_id: Option<String>,

    /// Consecutive refresh failures, reset to 0 on success
    pub refresh_failures: i64,

    /// How many times the stored tokens were read for serving
    pub usage_count: i64,
}

/// Outcome of binding an external identity to a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityBinding {
    /// The identity was not known; this flow's row now owns it.
    Created,
    /// A row for this identity already existed. The pre-existing row
    /// absorbed the new flow: it now answers to the new `state` and carries
    /// the freshly obtained tokens, but keeps its own history (creation
    /// time, usage count).
    Merged,
}
