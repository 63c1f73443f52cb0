//! HTTP surface for the broker.
//!
//! Maps inbound requests onto orchestrator calls:
//! 1. GET /authorize → HTML page redirecting the user to the provider
//! 2. Provider redirects back to GET /callback with code + state
//! 3. Callers fetch/refresh tokens via GET /tokens/:state
//!
//! Privileged routes (token read/revoke, identity listing, maintenance)
//! require the configured shared secret in the `x-access-key` header; with
//! no secret configured the check is skipped (dev mode).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::authorizer::Authorizer;
use crate::error::BrokerError;
use crate::exchange::TokenExchanger;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for broker endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InvalidArgument(_) => AppError::BadRequest(err.to_string()),
            BrokerError::NotFound(_) => AppError::NotFound(err.to_string()),
            BrokerError::ExchangeFailed { .. }
            | BrokerError::NoExternalId(_)
            | BrokerError::ProviderMaintenance
            | BrokerError::Connection(_)
            | BrokerError::RefreshFailed { .. } => AppError::BadGateway(err.to_string()),
            BrokerError::Conflict(_) | BrokerError::Database(_) => {
                AppError::ServerError(err.to_string())
            }
        }
    }
}

/// Shared application state for the broker API
pub struct BrokerAppState<E: TokenExchanger> {
    pub authorizer: Authorizer<E>,
    /// Shared secret for privileged routes; None skips the check
    pub access_key: Option<String>,
}

/// Provider callback query parameters
#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
struct IdentitySummary {
    nickname: Option<String>,
    state: String,
    external_id: Option<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
}

#[derive(Serialize)]
struct PurgeResponse {
    removed: usize,
}

const REDIRECT_HTML_TEMPLATE: &str = r#"<!DOCTYPE HTML>
<html>
    <head>
        <meta http-equiv="refresh" content="0; url={link}">
    </head>
    <body>
        <a href="{link}">
            You should be redirected shortly...
        </a>
    </body>
</html>
"#;

/// Create the broker API router
pub fn create_broker_router<E: TokenExchanger + 'static>(state: BrokerAppState<E>) -> Router {
    Router::new()
        .route("/authorize", get(authorize::<E>))
        .route("/callback", get(callback::<E>))
        .route(
            "/tokens/:state",
            get(get_token::<E>).delete(delete_token::<E>),
        )
        .route("/identities", get(list_identities::<E>))
        .route("/maintenance/purge-orphans", post(purge_orphans::<E>))
        .route("/maintenance/refresh-all", post(refresh_all::<E>))
        .with_state(Arc::new(state))
}

/// Enforce the shared secret on privileged routes.
fn check_access_key(headers: &HeaderMap, access_key: &Option<String>) -> Result<(), AppError> {
    let Some(expected) = access_key else {
        return Ok(());
    };
    let provided = headers
        .get("x-access-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        warn!("Rejected privileged request with missing or wrong access key");
        return Err(AppError::Unauthorized(
            "Missing or invalid access key".to_string(),
        ));
    }
    Ok(())
}

/// GET /authorize
///
/// Initiates a flow and serves an HTML page that forwards the user to the
/// provider's authorization endpoint.
async fn authorize<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
) -> Result<Html<String>, AppError> {
    let init = state.authorizer.auth_init()?;
    debug!(state = %init.state, "Issued authorization redirect");
    Ok(Html(
        REDIRECT_HTML_TEMPLATE.replace("{link}", &init.authorize_url),
    ))
}

/// GET /callback?code=...&state=...
///
/// Provider redirect target. Completes the flow and reports the final
/// `state` the caller must keep (it may differ after an identity merge).
async fn callback<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    if let Some(error) = query.error {
        let description = query
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "Provider denied authorization");
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {} - {}",
            error, description
        )));
    }

    let code = query.code.unwrap_or_default();
    let flow_state = query.state.unwrap_or_default();

    let outcome = state
        .authorizer
        .complete_callback(&code, &flow_state)
        .await?;
    Ok(Json(outcome).into_response())
}

/// GET /tokens/:state
///
/// Serves the stored access token, refreshing it first when needed.
/// Privileged.
async fn get_token<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    Path(flow_state): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_access_key(&headers, &state.access_key)?;

    let token = state
        .authorizer
        .get_token_for_state(&flow_state)
        .await?
        .ok_or_else(|| AppError::NotFound("No tokens stored for this state".to_string()))?;

    Ok(Json(token).into_response())
}

/// DELETE /tokens/:state
///
/// Revokes a flow. Privileged.
async fn delete_token<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    Path(flow_state): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_access_key(&headers, &state.access_key)?;

    let deleted = state.authorizer.delete_by_state(&flow_state)?;
    if !deleted {
        return Err(AppError::NotFound(
            "No flow found for this state".to_string(),
        ));
    }

    info!(state = %flow_state, "Flow revoked");
    Ok(Json(DeleteResponse { success: true }).into_response())
}

/// GET /identities
///
/// Lists every identity-bound record. Privileged.
async fn list_identities<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_access_key(&headers, &state.access_key)?;

    let identities: Vec<IdentitySummary> = state
        .authorizer
        .list_valid_identities()?
        .into_iter()
        .map(|record| IdentitySummary {
            nickname: record.nickname,
            state: record.state,
            external_id: record.external_id,
        })
        .collect();

    Ok(Json(identities).into_response())
}

/// POST /maintenance/purge-orphans
///
/// Removes every flow that never reached an identity binding. Privileged.
async fn purge_orphans<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_access_key(&headers, &state.access_key)?;

    let removed = state.authorizer.cleanup_orphans()?;
    info!(removed, "Purged orphaned flows");
    Ok(Json(PurgeResponse { removed }).into_response())
}

/// POST /maintenance/refresh-all
///
/// Sweeps every identity-bound flow and refreshes tokens nearing expiry.
/// Privileged.
async fn refresh_all<E: TokenExchanger>(
    State(state): State<Arc<BrokerAppState<E>>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_access_key(&headers, &state.access_key)?;

    let sweep = state.authorizer.refresh_all().await?;
    Ok(Json(sweep).into_response())
}
