use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use log::{debug, info};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::retry::{execute_with_retry, RetryPolicy};

/// Call surface every LLM collaborator exposes. The rate-limited wrapper
/// implements this too, so pipeline stages never know whether they hold the
/// raw client or the governed one.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> Result<String>;

    async fn get_embeddings(
        &self,
        texts: &[String],
        model: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// HTTP client with retry and backoff shared by every outbound API.
///
/// Each attempt rebuilds the request and is bounded by its own per-call
/// timeout; transient statuses and network failures are retried per the
/// policy, everything else surfaces immediately.
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            policy,
        })
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, String)],
        body: Option<&serde_json::Value>,
        per_call_timeout: Duration,
    ) -> Result<T> {
        let url = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            path.to_string()
        };

        execute_with_retry(&self.policy, || {
            let mut builder = self
                .client
                .request(method.clone(), url.as_str())
                .timeout(per_call_timeout);
            for (name, value) in headers {
                builder = builder.header(*name, value.as_str());
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            async move {
                let response = builder.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(Error::provider(status.as_u16(), message));
                }
                Ok(response.json::<T>().await?)
            }
        })
        .await
    }
}

/// OpenAI-compatible chat-completions and embeddings client.
pub struct OpenAiClient {
    api: ApiClient,
    api_key: String,
    config: ApiConfig,
}

impl OpenAiClient {
    pub fn new(config: ApiConfig, policy: RetryPolicy) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY is required".to_string()))?;
        let api = ApiClient::new(config.base_url.clone(), policy)?;

        Ok(Self {
            api,
            api_key,
            config,
        })
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingsRequest {
            model,
            input: texts,
            encoding_format: "float",
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| Error::Parse(format!("embedding request encode: {e}")))?;

        let response: EmbeddingsResponse = self
            .api
            .request(
                Method::POST,
                "/embeddings",
                &self.auth_headers(),
                Some(&body),
                Duration::from_secs(10),
            )
            .await?;

        debug!(
            "generated {} embeddings for batch of {} texts",
            response.data.len(),
            texts.len()
        );
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature,
            max_tokens: self.config.max_tokens,
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| Error::Parse(format!("chat request encode: {e}")))?;

        let response: ChatCompletionResponse = self
            .api
            .request(
                Method::POST,
                "/chat/completions",
                &self.auth_headers(),
                Some(&body),
                Duration::from_secs(60),
            )
            .await?;

        if let Some(usage) = &response.usage {
            debug!(
                "completion used {} prompt + {} completion tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::Parse("completion response had no choices".to_string()))?;

        info!("generated {} characters of text", content.len());
        Ok(content)
    }

    /// Embeddings for `texts`, fanned out into concurrent sub-batches of at
    /// most `batch_size`. Results are flattened in input order regardless of
    /// batch completion order.
    async fn get_embeddings(
        &self,
        texts: &[String],
        model: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = batch_size.max(1);
        if texts.len() <= batch_size {
            return self.embed_batch(texts, model).await;
        }

        let batches: Vec<&[String]> = texts.chunks(batch_size).collect();
        info!(
            "embedding {} texts in {} concurrent batches",
            texts.len(),
            batches.len()
        );

        let results =
            try_join_all(batches.into_iter().map(|batch| self.embed_batch(batch, model))).await?;
        Ok(results.into_iter().flatten().collect())
    }
}
