// Integration tests for the broker HTTP API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use oauth_broker::api::{create_broker_router, BrokerAppState};
use oauth_broker::authorizer::Authorizer;
use oauth_broker::config::ProviderConfig;
use oauth_broker::error::BrokerResult;
use oauth_broker::exchange::{TokenExchanger, TokenSet};
use oauth_broker::store::TokenStore;
use std::sync::Arc;
use tower::ServiceExt;

/// Scripted exchanger so no live provider is needed.
struct StubExchanger;

impl TokenExchanger for StubExchanger {
    async fn exchange_code(&self, _code: &str, _verifier: &str) -> BrokerResult<TokenSet> {
        Ok(TokenSet {
            access_token: "at-stub".to_string(),
            refresh_token: "rt-stub".to_string(),
            expires_in: 14400,
        })
    }

    async fn refresh_tokens(&self, _refresh_token: &str) -> BrokerResult<TokenSet> {
        Ok(TokenSet {
            access_token: "at-refreshed".to_string(),
            refresh_token: "rt-refreshed".to_string(),
            expires_in: 14400,
        })
    }

    async fn lookup_nickname(&self, _access_token: &str) -> Option<String> {
        Some("Test Pilot".to_string())
    }

    async fn lookup_external_id(&self, _access_token: &str) -> BrokerResult<String> {
        Ok("cust-42".to_string())
    }
}

fn test_provider_config() -> ProviderConfig {
    ProviderConfig {
        auth_url: "https://id.example.com/auth".to_string(),
        token_url: "https://id.example.com/token".to_string(),
        profile_url: "https://api.example.com/profile".to_string(),
        identity_url: "https://id.example.com/me".to_string(),
        client_id: "client-test".to_string(),
        scope: "auth capi".to_string(),
        ..ProviderConfig::default()
    }
}

fn create_test_app(access_key: Option<&str>) -> Router {
    let store = Arc::new(TokenStore::new(":memory:").unwrap());
    let authorizer = Authorizer::new(store, StubExchanger, test_provider_config());

    create_broker_router(BrokerAppState {
        authorizer,
        access_key: access_key.map(str::to_string),
    })
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// Runs GET /authorize and pulls the flow state out of the redirect URL.
async fn start_flow(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/authorize")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("meta http-equiv=\"refresh\""));
    assert!(html.contains("code_challenge_method=S256"));

    let start = html.find("&state=").unwrap() + "&state=".len();
    let end = html[start..].find('&').unwrap() + start;
    html[start..end].to_string()
}

#[tokio::test]
async fn test_authorize_serves_redirect_page() {
    let app = create_test_app(None);
    let state = start_flow(&app).await;

    // 32 random bytes, base64url without padding
    assert_eq!(state.len(), 43);
}

#[tokio::test]
async fn test_callback_requires_code_and_state() {
    let app = create_test_app(None);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/callback?code=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_reports_provider_denial() {
    let app = create_test_app(None);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/callback?error=access_denied&error_description=User+cancelled")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("access_denied"));
}

#[tokio::test]
async fn test_callback_unknown_state_is_not_found() {
    let app = create_test_app(None);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/callback?code=abc&state=never-issued")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_flow_and_token_serving() {
    let app = create_test_app(None);
    let state = start_flow(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=auth-code-1&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["description"], "Tokens saved");
    assert_eq!(json["state"], state);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/tokens/{state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["access_token"], "at-stub");
    assert_eq!(json["nickname"], "Test Pilot");
    assert!(json["expires_over"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_second_flow_merges_onto_new_state() {
    let app = create_test_app(None);

    let first = start_flow(&app).await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={first}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same external identity authorizes again under a fresh state
    let second = start_flow(&app).await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-2&state={second}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["description"], "Tokens updated");
    assert_eq!(json["state"], second);

    // The old state no longer resolves
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/tokens/{first}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_privileged_routes_require_access_key() {
    let app = create_test_app(Some("hunter2"));

    // Missing key
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/tokens/whatever")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/identities")
                .header("x-access-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Maintenance routes are privileged too
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/maintenance/refresh-all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Right key (unknown state, but past the auth check)
    let response = app
        .oneshot(
            Request::builder()
                .uri("/tokens/whatever")
                .header("x-access-key", "hunter2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_authorize_and_callback_are_public() {
    // The user-facing flow must work without the shared secret
    let app = create_test_app(Some("hunter2"));
    let state = start_flow(&app).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_delete_token_revokes_flow() {
    let app = create_test_app(None);
    let state = start_flow(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/tokens/{state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);

    // Already gone
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/tokens/{state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_identities_lists_completed_flows() {
    let app = create_test_app(None);
    let state = start_flow(&app).await;

    app.clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/identities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let identities = json.as_array().unwrap();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0]["state"], state);
    assert_eq!(identities[0]["external_id"], "cust-42");
    assert_eq!(identities[0]["nickname"], "Test Pilot");
}

#[tokio::test]
async fn test_refresh_all_reports_sweep_counts() {
    let app = create_test_app(None);

    // One completed flow with fresh tokens: the sweep has nothing to do
    let state = start_flow(&app).await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={state}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/maintenance/refresh-all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["refreshed"], 0);
    assert_eq!(json["skipped"], 1);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn test_purge_orphans_removes_unfinished_flows() {
    let app = create_test_app(None);

    // One completed flow, two abandoned ones
    let completed = start_flow(&app).await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri(format!("/callback?code=code-1&state={completed}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    start_flow(&app).await;
    start_flow(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/maintenance/purge-orphans")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["removed"], 2);

    // The completed flow survives
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/tokens/{completed}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
