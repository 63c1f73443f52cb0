//! Authorization orchestrator.
//!
//! The state machine sequencing exchanger and store calls:
//! INIT → CODE_RECEIVED → TOKENS_BOUND → IDENTITY_BOUND, with rows deleted
//! only on explicit revocation or an exhausted refresh-failure budget.
//! Holds no state of its own beyond references to the store and exchanger,
//! so both can be substituted in tests.

mod pkce;


use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::error::{BrokerError, BrokerResult, RefreshFailReason};
use crate::exchange::TokenExchanger;
use crate::store::{AuthorizationRecord, IdentityBinding, TokenStore};

/// Refresh this many seconds before the provider's stated expiry rather
/// than racing it.
pub const SAFETY_MARGIN_SECS: i64 = 400;

/// Consecutive refresh failures tolerated before a row is purged
/// (when the caller opted out of failure tolerance).
pub const MAX_REFRESH_FAILURES: i64 = 5;

/// State-string collisions are negligible for 32 random bytes; a couple of
/// retries covers the pathological case.
const CREATE_FLOW_ATTEMPTS: u32 = 3;

/// A freshly initiated flow: where to send the user, and the flow key.
#[derive(Clone, Debug, Serialize)]
pub struct AuthInit {
    pub authorize_url: String,
    pub state: String,
}

/// Result of a completed callback.
///
/// `state` is the final flow key the caller must remember — after an
/// identity merge it is authoritative and the key the caller started with
/// may no longer resolve.
#[derive(Clone, Debug, Serialize)]
pub struct CallbackOutcome {
    pub status: String,
    pub description: String,
    pub state: String,
}

/// Result of a refresh attempt that did not fail.
#[derive(Clone, Debug, Serialize)]
pub struct RefreshOutcome {
    pub status: String,
    pub description: String,
    pub state: String,
    /// Whether the provider was actually called and new tokens stored,
    /// as opposed to the stored ones still being fresh.
    pub refreshed: bool,
}

/// Tally of a [`refresh_all`](Authorizer::refresh_all) sweep.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RefreshSweep {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Stored access token prepared for serving.
#[derive(Clone, Debug, Serialize)]
pub struct ServingToken {
    pub access_token: String,
    /// Unix timestamp the token expires at
    pub expires_on: i64,
    /// Seconds until expiry (may be negative if refresh was tolerated-failed)
    pub expires_over: i64,
    pub nickname: Option<String>,
}

/// Sequences store and exchanger calls; the only component with invariants
/// spanning multiple store operations.
pub struct Authorizer<E: TokenExchanger> {
    store: Arc<TokenStore>,
    exchanger: E,
    provider: ProviderConfig,
}

impl<E: TokenExchanger> Authorizer<E> {
    pub fn new(store: Arc<TokenStore>, exchanger: E, provider: ProviderConfig) -> Self {
        Self {
            store,
            exchanger,
            provider,
        }
    }

    /// Starts a flow: generates the PKCE pair and state, persists the
    /// created row, and returns the provider authorization URL. No
    /// external call is made.
    pub fn auth_init(&self) -> BrokerResult<AuthInit> {
        let mut attempts = 0;
        loop {
            let verifier = pkce::generate_verifier();
            let state = pkce::generate_state();
            match self.store.create_flow(&verifier, &state) {
                Ok(()) => {
                    let challenge = pkce::challenge_s256(&verifier);
                    let authorize_url = self.build_authorize_url(&challenge, &state);
                    debug!(state = %state, "Authorization flow initiated");
                    return Ok(AuthInit {
                        authorize_url,
                        state,
                    });
                }
                Err(BrokerError::Conflict(s)) => {
                    attempts += 1;
                    warn!(state = %s, attempt = attempts, "State collision, regenerating");
                    if attempts >= CREATE_FLOW_ATTEMPTS {
                        return Err(BrokerError::Conflict(s));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_authorize_url(&self, challenge: &str, state: &str) -> String {
        format!(
            "{}?audience={}&scope={}&response_type=code&client_id={}\
             &code_challenge={}&code_challenge_method=S256&state={}&redirect_uri={}",
            self.provider.auth_url,
            urlencoding::encode(&self.provider.audience),
            urlencoding::encode(&self.provider.scope),
            urlencoding::encode(&self.provider.client_id),
            challenge,
            state,
            urlencoding::encode(&self.provider.redirect_uri),
        )
    }

    /// Completes a flow after the provider redirected back with a code.
    ///
    /// On exchange failure the row is intentionally kept, so a retry with
    /// the same code/state is possible. A missing external identity leaves
    /// the row token-bound for diagnostics or a manual retry.
    pub async fn complete_callback(&self, code: &str, state: &str) -> BrokerResult<CallbackOutcome> {
        if code.is_empty() || state.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "code and state are required".to_string(),
            ));
        }

        let verifier = self.store.get_verifier(state)?;
        self.store.bind_code(code, state)?;

        let tokens = self
            .exchanger
            .exchange_code(code, &verifier)
            .await
            .map_err(|e| {
                error!(state = %state, error = %e, "Token exchange failed; row kept for retry");
                e
            })?;

        let issued_at = chrono::Utc::now().timestamp();
        self.store.set_tokens(
            &tokens.access_token,
            &tokens.refresh_token,
            tokens.expires_in,
            issued_at,
            state,
        )?;

        match self.exchanger.lookup_nickname(&tokens.access_token).await {
            Some(nickname) => self.store.bind_nickname(&nickname, state)?,
            None => warn!(state = %state, "Couldn't resolve a nickname; flow continues without one"),
        }

        let external_id = self
            .exchanger
            .lookup_external_id(&tokens.access_token)
            .await
            .map_err(|e| {
                error!(state = %state, error = %e, "No stable identity; row left token-bound");
                e
            })?;

        let binding = self.store.bind_external_id(&external_id, state)?;
        let description = match binding {
            IdentityBinding::Created => "Tokens saved",
            IdentityBinding::Merged => "Tokens updated",
        };

        // Re-read the owning state rather than assuming ours survived; a
        // concurrent callback for the same identity may have merged again.
        let final_state = self
            .store
            .find_state_by_external_id(&external_id)?
            .unwrap_or_else(|| state.to_string());

        info!(
            state = %final_state,
            merged = matches!(binding, IdentityBinding::Merged),
            "Authorization flow completed"
        );

        Ok(CallbackOutcome {
            status: "ok".to_string(),
            description: description.to_string(),
            state: final_state,
        })
    }

    /// Refreshes a flow's tokens if they are inside the safety margin of
    /// expiry (or unconditionally with `force_refresh`).
    ///
    /// Concurrent refreshes for one `state` are not de-duplicated: both may
    /// call the provider and both race to store the result. Accepted —
    /// refresh is rare, idempotent enough server-side, and cheap to retry.
    pub async fn refresh_if_needed(
        &self,
        state: &str,
        force_refresh: bool,
        tolerate_failure: bool,
    ) -> BrokerResult<RefreshOutcome> {
        let Some(row) = self.store.get_row(state)? else {
            return Err(BrokerError::RefreshFailed {
                state: state.to_string(),
                reason: RefreshFailReason::NoSuchState,
            });
        };

        let now = chrono::Utc::now().timestamp();
        if let (Some(issued_at), Some(expires_in)) = (row.token_issued_at, row.expires_in) {
            if now < issued_at + expires_in - SAFETY_MARGIN_SECS && !force_refresh {
                return Ok(RefreshOutcome {
                    status: "ok".to_string(),
                    description: "Didn't refresh since it isn't required".to_string(),
                    state: state.to_string(),
                    refreshed: false,
                });
            }
        }

        let Some(refresh_token) = row.refresh_token.as_deref() else {
            // Row never reached token-bound state; counts like a failure
            warn!(state = %state, "Refresh requested for a flow without tokens");
            return self.note_refresh_failure(state, tolerate_failure);
        };

        match self.exchanger.refresh_tokens(refresh_token).await {
            Ok(tokens) => {
                let issued_at = chrono::Utc::now().timestamp();
                self.store.set_tokens(
                    &tokens.access_token,
                    &tokens.refresh_token,
                    tokens.expires_in,
                    issued_at,
                    state,
                )?;
                info!(state = %state, "Tokens refreshed");
                Ok(RefreshOutcome {
                    status: "ok".to_string(),
                    description: "Tokens were successfully updated".to_string(),
                    state: state.to_string(),
                    refreshed: true,
                })
            }
            Err(BrokerError::ProviderMaintenance) => {
                // Transient, provider-side; does not touch failure counters
                warn!(state = %state, "Refresh skipped, provider under maintenance");
                Err(BrokerError::RefreshFailed {
                    state: state.to_string(),
                    reason: RefreshFailReason::ProviderMaintenance,
                })
            }
            Err(e) => {
                warn!(
                    state = %state,
                    error = %e,
                    refresh_failures = row.refresh_failures,
                    "Refresh attempt failed"
                );
                self.note_refresh_failure(state, tolerate_failure)
            }
        }
    }

    /// Counts a refresh failure and enforces the budget.
    fn note_refresh_failure(
        &self,
        state: &str,
        tolerate_failure: bool,
    ) -> BrokerResult<RefreshOutcome> {
        let count = match self.store.increment_refresh_failures(state) {
            Ok(count) => count,
            Err(BrokerError::NotFound(_)) => {
                // Row vanished between the read and the increment
                return Err(BrokerError::RefreshFailed {
                    state: state.to_string(),
                    reason: RefreshFailReason::NoSuchState,
                });
            }
            Err(e) => return Err(e),
        };

        if !tolerate_failure && count >= MAX_REFRESH_FAILURES {
            self.store.delete_flow(state)?;
            warn!(state = %state, failures = count, "Flow removed, refresh-failure budget exhausted");
            return Err(BrokerError::RefreshFailed {
                state: state.to_string(),
                reason: RefreshFailReason::RemovedByFailureBudget,
            });
        }

        Err(BrokerError::RefreshFailed {
            state: state.to_string(),
            reason: RefreshFailReason::TryLater,
        })
    }

    /// Returns the stored token for serving, refreshing first if needed.
    ///
    /// The refresh is best-effort: a tolerated refresh failure still serves
    /// whatever is currently stored. `None` when the flow doesn't exist or
    /// the refresh removed it.
    pub async fn get_token_for_state(&self, state: &str) -> BrokerResult<Option<ServingToken>> {
        match self.refresh_if_needed(state, false, true).await {
            Ok(_) => {}
            Err(BrokerError::RefreshFailed {
                reason: RefreshFailReason::NoSuchState | RefreshFailReason::RemovedByFailureBudget,
                ..
            }) => return Ok(None),
            Err(e) => {
                warn!(state = %state, error = %e, "Serving stored tokens despite refresh failure");
            }
        }

        let Some(row) = self.store.get_row_for_serving(state)? else {
            return Ok(None);
        };
        let (Some(access_token), Some(issued_at), Some(expires_in)) =
            (row.access_token, row.token_issued_at, row.expires_in)
        else {
            // Created or code-bound rows have nothing to serve yet
            return Ok(None);
        };

        let expires_on = issued_at + expires_in;
        Ok(Some(ServingToken {
            access_token,
            expires_on,
            expires_over: expires_on - chrono::Utc::now().timestamp(),
            nickname: row.nickname,
        }))
    }

    /// Proactively refreshes every identity-bound flow whose tokens are
    /// nearing expiry, so refresh tokens don't go stale for callers that
    /// never poll. Failures are tolerated per row and never remove a flow.
    pub async fn refresh_all(&self) -> BrokerResult<RefreshSweep> {
        let mut sweep = RefreshSweep::default();
        for record in self.store.list_identity_bound()? {
            match self.refresh_if_needed(&record.state, false, true).await {
                Ok(outcome) if outcome.refreshed => sweep.refreshed += 1,
                Ok(_) => sweep.skipped += 1,
                Err(e) => {
                    warn!(state = %record.state, error = %e, "Sweep refresh failed, flow kept");
                    sweep.failed += 1;
                }
            }
        }
        info!(
            refreshed = sweep.refreshed,
            skipped = sweep.skipped,
            failed = sweep.failed,
            "Refresh sweep completed"
        );
        Ok(sweep)
    }

    /// Revokes a flow. Returns whether a row existed.
    pub fn delete_by_state(&self, state: &str) -> BrokerResult<bool> {
        self.store.delete_flow(state)
    }

    /// Every identity-bound record.
    pub fn list_valid_identities(&self) -> BrokerResult<Vec<AuthorizationRecord>> {
        self.store.list_identity_bound()
    }

    /// Removes rows that never reached identity-bound state.
    pub fn cleanup_orphans(&self) -> BrokerResult<usize> {
        self.store.purge_orphans()
    }
}
