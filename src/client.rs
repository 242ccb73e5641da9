use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TOKEN_ESTIMATION_RATIO;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::llm::LlmProvider;

/// Crude pre-call token sizing: characters over the estimation ratio.
pub fn estimate_tokens(text_len: usize) -> u32 {
    (text_len / TOKEN_ESTIMATION_RATIO) as u32
}

/// Wraps a raw provider so every call passes through the rate limiter.
///
/// Cost is estimated before the call and reconciled with the observed
/// output afterwards; the concurrency slot is released on every path,
/// success or failure, and errors pass through unchanged.
pub struct RateLimitedClient {
    inner: Arc<dyn LlmProvider>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn LlmProvider>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl LlmProvider for RateLimitedClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> Result<String> {
        let estimated = estimate_tokens(system_prompt.len() + user_prompt.len());
        let permit = self.limiter.acquire(estimated).await?;

        match self
            .inner
            .generate(system_prompt, user_prompt, temperature)
            .await
        {
            Ok(result) => {
                let actual = estimate_tokens(result.len()) + estimated;
                self.limiter.release(permit, actual);
                Ok(result)
            }
            Err(e) => {
                self.limiter.release(permit, 0);
                Err(e)
            }
        }
    }

    async fn get_embeddings(
        &self,
        texts: &[String],
        model: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let estimated = estimate_tokens(texts.iter().map(String::len).sum());
        let permit = self.limiter.acquire(estimated).await?;

        match self.inner.get_embeddings(texts, model, batch_size).await {
            Ok(result) => {
                // Embedding usage is not reported post-hoc; the estimate
                // stands in for actual consumption.
                self.limiter.release(permit, estimated);
                Ok(result)
            }
            Err(e) => {
                self.limiter.release(permit, 0);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::error::Error;
    use tokio::time::{Duration, Instant};

    /// Provider that fails every call.
    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn generate(&self, _: &str, _: &str, _: f32) -> Result<String> {
            Err(Error::provider(500, "boom"))
        }

        async fn get_embeddings(&self, _: &[String], _: &str, _: usize) -> Result<Vec<Vec<f32>>> {
            Err(Error::provider(500, "boom"))
        }
    }

    /// Provider that answers instantly.
    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn generate(&self, _: &str, user_prompt: &str, _: f32) -> Result<String> {
            Ok(format!("echo: {user_prompt}"))
        }

        async fn get_embeddings(
            &self,
            texts: &[String],
            _: &str,
            batch_size: usize,
        ) -> Result<Vec<Vec<f32>>> {
            // Index-tagged vectors so order is observable, emitted in
            // batch_size groups like the real client.
            let mut out = Vec::with_capacity(texts.len());
            for batch in texts.chunks(batch_size.max(1)) {
                for text in batch {
                    let tag: f32 = text.parse().unwrap_or(-1.0);
                    out.push(vec![tag, 1.0]);
                }
            }
            Ok(out)
        }
    }

    fn limiter(rpm: u32, tpm: u32, concurrent: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
            max_concurrent_requests: concurrent,
            ..RateLimitConfig::default()
        }))
    }

    async fn flush() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn token_estimation_uses_char_ratio() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(3), 0);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(4000), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_calls_release_their_slots() {
        let limiter = limiter(1000, 1_000_000, 3);
        let client = Arc::new(RateLimitedClient::new(
            Arc::new(FailingProvider),
            Arc::clone(&limiter),
        ));

        // Saturate the concurrency cap with failing calls.
        let mut handles = Vec::new();
        for _ in 0..3 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.generate("sys", "user", 0.0).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }

        // All slots must be free again; a further call completes rather
        // than deadlocking on a leaked permit.
        assert_eq!(limiter.status().await.in_flight, 0);
        let err = client.generate("sys", "user", 0.0).await;
        assert!(matches!(err, Err(Error::Provider { status: 500, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_generate_records_actual_usage() {
        let limiter = limiter(1000, 1_000_000, 3);
        let client = RateLimitedClient::new(Arc::new(EchoProvider), Arc::clone(&limiter));

        let system = "abcd".repeat(10); // 40 chars
        let user = "efgh".repeat(10); // 40 chars
        let result = client.generate(&system, &user, 0.0).await.unwrap();
        flush().await;

        let estimated = estimate_tokens(80);
        let expected = estimate_tokens(result.len()) + estimated;
        assert_eq!(limiter.status().await.tokens_in_window, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_generate_records_no_usage() {
        let limiter = limiter(1000, 1_000_000, 3);
        let client = RateLimitedClient::new(Arc::new(FailingProvider), Arc::clone(&limiter));

        let _ = client.generate("sys", "user", 0.0).await;
        flush().await;
        assert_eq!(limiter.status().await.tokens_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_order_survives_batch_fanout() {
        let limiter = limiter(1000, 1_000_000, 3);
        let client = RateLimitedClient::new(Arc::new(EchoProvider), limiter);

        let texts: Vec<String> = (0..250).map(|i| i.to_string()).collect();
        let embeddings = client
            .get_embeddings(&texts, "text-embedding-3-small", 100)
            .await
            .unwrap();

        assert_eq!(embeddings.len(), texts.len());
        for (i, embedding) in embeddings.iter().enumerate() {
            assert_eq!(embedding[0], i as f32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_generates_respect_request_window() {
        // requests_per_minute=2, max_concurrent=1: the third short call is
        // only admitted once the first falls out of the 60s window.
        let limiter = limiter(2, 100_000, 1);
        let client = RateLimitedClient::new(Arc::new(EchoProvider), limiter);

        let start = Instant::now();
        for _ in 0..3 {
            client.generate("hi", "there", 0.0).await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
