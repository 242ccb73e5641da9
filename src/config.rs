use std::env;
use std::time::Duration;

/// Sliding window over which both request and token budgets are enforced.
pub const WINDOW_SIZE: Duration = Duration::from_secs(60);

/// Buffer added to computed waits so a just-expired entry doesn't collide
/// with the re-check.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Characters per estimated token.
pub const TOKEN_ESTIMATION_RATIO: usize = 4;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub max_concurrent_requests: u32,
    pub burst_limit: u32,
    pub avg_tokens_per_request: u32,
    pub max_retries: u32,
    pub base_backoff: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            tokens_per_minute: 40_000,
            max_concurrent_requests: 5,
            burst_limit: 3,
            avg_tokens_per_request: 2_000,
            max_retries: 3,
            base_backoff: 1.0,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            requests_per_minute: env_u32("RATE_LIMIT_REQUESTS_PER_MINUTE", 50),
            tokens_per_minute: env_u32("RATE_LIMIT_TOKENS_PER_MINUTE", 40_000),
            max_concurrent_requests: env_u32("RATE_LIMIT_MAX_CONCURRENT", 5),
            burst_limit: env_u32("RATE_LIMIT_BURST", 3),
            avg_tokens_per_request: env_u32("RATE_LIMIT_AVG_TOKENS", 2_000),
            max_retries: env_u32("RATE_LIMIT_MAX_RETRIES", 3),
            base_backoff: env_f64("RATE_LIMIT_BASE_BACKOFF", 1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub embedding_model: String,
    pub use_mock_data: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            max_tokens: 2_000,
            temperature: 0.0,
            embedding_model: "text-embedding-3-small".to_string(),
            use_mock_data: true,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env::var("OPENAI_API_KEY").ok(),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4".to_string()),
            max_tokens: env_u32("OPENAI_MAX_TOKENS", 2_000),
            temperature: env_f64("OPENAI_TEMPERATURE", 0.0) as f32,
            embedding_model: env::var("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            use_mock_data: env_bool("USE_MOCK_DATA", true),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.to_lowercase() == "true",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = RateLimitConfig::default();
        assert_eq!(config.requests_per_minute, 50);
        assert_eq!(config.tokens_per_minute, 40_000);
        assert_eq!(config.max_concurrent_requests, 5);
        assert_eq!(config.burst_limit, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_backoff, 1.0);
    }

    #[test]
    fn api_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.model, "gpt-4");
        assert_eq!(config.embedding_model, "text-embedding-3-small");
        assert!(config.use_mock_data);
    }
}
