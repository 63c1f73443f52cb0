//! Outbound exchanges against the identity provider.
//!
//! Stateless wrappers around the provider's HTTP API: authorization-code
//! exchange, refresh grant, and the two bearer-auth identity lookups.
//! Provider errors are normalized into the typed taxonomy; nothing here
//! touches the store.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

use crate::config::ProviderConfig;
use crate::error::{BrokerError, BrokerResult};

/// Status code the provider returns while under maintenance. Tolerated as
/// transient, distinct from a hard exchange failure.
const MAINTENANCE_STATUS: u16 = 418;

/// Token pair plus lifetime, as returned by the token endpoint.
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Wire format of the provider's token endpoint response
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// The three external exchanges the orchestrator sequences.
///
/// A trait so tests can substitute a double that counts calls and scripts
/// outcomes without a live provider.
pub trait TokenExchanger: Send + Sync {
    /// Exchange an authorization code (plus PKCE verifier) for tokens.
    fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> impl Future<Output = BrokerResult<TokenSet>> + Send;

    /// Trade a refresh token for a fresh token pair. Maintenance (418) is
    /// surfaced as `ProviderMaintenance`, transport failures as
    /// `Connection`; everything else non-2xx is `ExchangeFailed`.
    fn refresh_tokens(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = BrokerResult<TokenSet>> + Send;

    /// Display name for the token's owner. Cosmetic: every failure degrades
    /// to `None`, logged, never fatal.
    fn lookup_nickname(&self, access_token: &str) -> impl Future<Output = Option<String>> + Send;

    /// Stable provider-assigned identity. Failure here is fatal to the
    /// flow: without it the flow cannot be considered complete.
    fn lookup_external_id(
        &self,
        access_token: &str,
    ) -> impl Future<Output = BrokerResult<String>> + Send;
}

/// Live exchanger speaking to the configured provider.
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// POST a form to the token endpoint, returning status and raw body so
    /// callers can apply their own status policy.
    async fn post_token_request(
        &self,
        form: &HashMap<&str, &str>,
    ) -> BrokerResult<(reqwest::StatusCode, String)> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("User-Agent", &self.config.user_agent)
            .form(form)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok((status, body))
    }

    async fn get_bearer_json(&self, url: &str, access_token: &str) -> BrokerResult<Value> {
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(BrokerError::ExchangeFailed {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }
        serde_json::from_str(&body).map_err(|_| BrokerError::ExchangeFailed {
            status: status.as_u16(),
            body: body_snippet(&body),
        })
    }
}

impl TokenExchanger for ProviderClient {
    async fn exchange_code(&self, code: &str, verifier: &str) -> BrokerResult<TokenSet> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.config.redirect_uri.as_str());
        form.insert("code_verifier", verifier);
        form.insert("client_id", self.config.client_id.as_str());

        tracing::debug!(url = %self.config.token_url, "Exchanging authorization code for tokens");

        let (status, body) = self.post_token_request(&form).await?;
        if !status.is_success() {
            return Err(BrokerError::ExchangeFailed {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }
        parse_token_set(status.as_u16(), &body)
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> BrokerResult<TokenSet> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("refresh_token", refresh_token);

        tracing::debug!(url = %self.config.token_url, "Refreshing access token");

        let (status, body) = self.post_token_request(&form).await?;
        if status.as_u16() == MAINTENANCE_STATUS {
            tracing::warn!(body = %body_snippet(&body), "Provider is under maintenance");
            return Err(BrokerError::ProviderMaintenance);
        }
        if !status.is_success() {
            return Err(BrokerError::ExchangeFailed {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }
        parse_token_set(status.as_u16(), &body)
    }

    async fn lookup_nickname(&self, access_token: &str) -> Option<String> {
        let profile = match self
            .get_bearer_json(&self.config.profile_url, access_token)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Couldn't fetch profile for nickname");
                return None;
            }
        };

        let nickname = profile
            .pointer("/commander/name")
            .or_else(|| profile.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if nickname.is_none() {
            tracing::warn!("Profile response carries no display name");
        }
        nickname
    }

    async fn lookup_external_id(&self, access_token: &str) -> BrokerResult<String> {
        let identity = self
            .get_bearer_json(&self.config.identity_url, access_token)
            .await?;

        match identity.get("customer_id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(BrokerError::NoExternalId(
                "identity response carries no customer_id".to_string(),
            )),
        }
    }
}

fn parse_token_set(status: u16, body: &str) -> BrokerResult<TokenSet> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|_| BrokerError::ExchangeFailed {
            status,
            body: body_snippet(body),
        })?;
    Ok(TokenSet {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_in: parsed.expires_in,
    })
}

/// Trim response bodies carried inside errors to keep log lines sane.
fn body_snippet(body: &str) -> String {
    body.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "at-1234567890",
            "refresh_token": "rt-0987654321",
            "expires_in": 14400,
            "token_type": "Bearer"
        }"#;

        let set = parse_token_set(200, json).unwrap();
        assert_eq!(set.access_token, "at-1234567890");
        assert_eq!(set.refresh_token, "rt-0987654321");
        assert_eq!(set.expires_in, 14400);
    }

    #[test]
    fn test_token_response_missing_fields_is_exchange_failure() {
        // A 2xx with a malformed body still fails the exchange, carrying
        // the body for diagnostics
        let result = parse_token_set(200, r#"{"access_token": "only-this"}"#);
        match result {
            Err(BrokerError::ExchangeFailed { status, body }) => {
                assert_eq!(status, 200);
                assert!(body.contains("only-this"));
            }
            other => panic!("expected ExchangeFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_body_snippet_truncates() {
        let long = "x".repeat(2000);
        assert_eq!(body_snippet(&long).len(), 500);
        assert_eq!(body_snippet("short"), "short");
    }
}
