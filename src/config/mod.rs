use serde::Deserialize;

/// Complete broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Shared secret required (as `x-access-key` header) on privileged
    /// routes. When unset, the check is skipped.
    #[serde(default)]
    pub access_key: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            access_key: None,
        }
    }
}

/// Identity provider endpoints and client identity
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint the user is redirected to
    #[serde(default)]
    pub auth_url: String,
    /// Token exchange endpoint (authorization-code and refresh grants)
    #[serde(default)]
    pub token_url: String,
    /// Profile endpoint returning the display name (bearer auth)
    #[serde(default)]
    pub profile_url: String,
    /// Identity endpoint returning the stable customer identifier
    #[serde(default)]
    pub identity_url: String,
    /// OAuth client id, overridable via `BROKER_CLIENT_ID`
    #[serde(default)]
    pub client_id: String,
    /// Redirect URI registered with the provider
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// User-Agent sent on every outbound call (the provider mandates one)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default)]
    pub scope: String,
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:9000/callback".to_string()
}

fn default_user_agent() -> String {
    format!("oauth-broker/{}", env!("CARGO_PKG_VERSION"))
}

fn default_audience() -> String {
    "all".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            token_url: String::new(),
            profile_url: String::new(),
            identity_url: String::new(),
            client_id: String::new(),
            redirect_uri: default_redirect_uri(),
            user_agent: default_user_agent(),
            audience: default_audience(),
            scope: String::new(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "authorizations.sqlite".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Load configuration from a TOML file, then apply environment overrides
/// (`BROKER_CLIENT_ID`, `BROKER_ACCESS_KEY`).
pub fn load_config(path: &str) -> anyhow::Result<BrokerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let mut config: BrokerConfig = toml::from_str(&contents)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables win over file values so secrets can stay out of
/// the config file.
pub fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(client_id) = std::env::var("BROKER_CLIENT_ID") {
        if !client_id.is_empty() {
            config.provider.client_id = client_id;
        }
    }
    if let Ok(access_key) = std::env::var("BROKER_ACCESS_KEY") {
        if !access_key.is_empty() {
            config.server.access_key = Some(access_key);
        }
    }
}
