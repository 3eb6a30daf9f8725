use anyhow::{Context, Result};

/// Client configuration loaded from environment variables.
///
/// No overall request timeout is applied here: a generation stream is
/// long-lived and deadline enforcement belongs to the caller wrapping the
/// request. Only the connect phase is bounded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint the generation request is POSTed to.
    pub generation_url: String,
    /// Optional service key, sent as `x-api-key` when present.
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            generation_url: require_env("GENERATION_URL")?,
            api_key: std::env::var("GENERATION_API_KEY").ok(),
            connect_timeout_secs: std::env::var("CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .context("CONNECT_TIMEOUT_SECS must be a number of seconds")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Programmatic constructor for embedding and tests.
    pub fn new(generation_url: impl Into<String>) -> Self {
        Config {
            generation_url: generation_url.into(),
            api_key: None,
            connect_timeout_secs: 30,
            rust_log: "info".to_string(),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
