use anyhow::Context;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use oauth_broker::api::{create_broker_router, BrokerAppState};
use oauth_broker::authorizer::Authorizer;
use oauth_broker::config::load_config;
use oauth_broker::exchange::ProviderClient;
use oauth_broker::store::TokenStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth_broker=info".into()),
        )
        .init();

    let config_path =
        std::env::var("BROKER_CONFIG").unwrap_or_else(|_| "broker.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    info!(
        db_path = %config.store.db_path,
        provider = %config.provider.auth_url,
        "Starting OAuth broker"
    );

    let store = Arc::new(
        TokenStore::new(&config.store.db_path).context("Failed to open token store")?,
    );
    let exchanger = ProviderClient::new(config.provider.clone());
    let authorizer = Authorizer::new(store, exchanger, config.provider.clone());

    let app = create_broker_router(BrokerAppState {
        authorizer,
        access_key: config.server.access_key.clone(),
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Broker API listening");

    axum::serve(listener, app).await?;
    Ok(())
}
