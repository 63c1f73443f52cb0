// OAuth broker - PKCE authorization flows, token refresh, identity merging

pub mod api;
pub mod authorizer;
pub mod config;
pub mod error;
pub mod exchange;
pub mod store;
