//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    /// Bearer token lifetime in seconds (default: 8 hours)
    pub token_ttl_seconds: u64,
    /// Maximum message content length in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Number of messages returned on room join
    pub history_limit: i64,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PARLEY_PORT")
                .unwrap_or_else(|_| "8765".to_string())
                .parse()
                .context("Invalid PARLEY_PORT")?,
            database_url: env::var("PARLEY_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/parley.db".to_string()),
            jwt_secret: env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "change_me".to_string()),
            token_ttl_seconds: env::var("PARLEY_TOKEN_TTL")
                .unwrap_or_else(|_| "28800".to_string())
                .parse()
                .context("Invalid PARLEY_TOKEN_TTL")?,
            max_message_size: env::var("PARLEY_MAX_MESSAGE_SIZE")
                .unwrap_or_else(|_| "65536".to_string()) // 64KB
                .parse()
                .context("Invalid PARLEY_MAX_MESSAGE_SIZE")?,
            ws_ping_interval: env::var("PARLEY_WS_PING_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid PARLEY_WS_PING_INTERVAL")?,
            history_limit: env::var("PARLEY_HISTORY_LIMIT")
                .unwrap_or_else(|_| "150".to_string())
                .parse()
                .context("Invalid PARLEY_HISTORY_LIMIT")?,
            cors_origins: env::var("PARLEY_CORS_ORIGINS").ok(),
            admin_token: env::var("PARLEY_ADMIN_TOKEN").ok(),
        };

        Ok(config)
    }
}
