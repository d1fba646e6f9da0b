//! Embedding backends for memory records.
//!
//! `EmbeddingBackend` turns memory text and recall queries into vectors of the
//! deployment dimension. The Gemini client can run in fallback mode, where an
//! API failure yields `Ok(None)` and the memory is stored without a vector.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::EmbeddingConfig;

/// Default Gemini embedding dimensions
pub const GEMINI_DIMENSIONS: usize = 768;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed memory content. `None` means the backend is degraded and the
    /// caller should store the memory without a vector.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError>;

    /// Embed a recall query. Defaults to `embed()`.
    async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed(text).await
    }

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Task type hint sent with each embedding request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    RetrievalDocument,
    RetrievalQuery,
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

/// Build the embedding backend for the configured model.
pub fn create_embedder(
    config: &EmbeddingConfig,
    api_key: &str,
) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    Ok(Box::new(GeminiEmbeddingClient::new(config, api_key)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    task_type: TaskType,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbedErrorResponse {
    error: Option<EmbedErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct EmbedErrorDetail {
    code: u16,
    message: String,
}

/// Gemini `embedContent` client.
#[derive(Debug, Clone)]
pub struct GeminiEmbeddingClient {
    client: Client,
    api_key: String,
    model: String,
    dimensions: usize,
    max_retries: usize,
    retry_delay_ms: u64,
    fallback: bool,
    base_url: String,
}

impl GeminiEmbeddingClient {
    pub fn new(config: &EmbeddingConfig, api_key: &str) -> Result<Self, EmbeddingError> {
        Self::with_base_url(
            config,
            api_key,
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: &EmbeddingConfig,
        api_key: &str,
        base_url: String,
    ) -> Result<Self, EmbeddingError> {
        if api_key.is_empty() {
            return Err(EmbeddingError::MissingApiKey);
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions as usize,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            fallback: config.fallback,
            base_url,
        })
    }

    async fn embed_with_task(&self, text: &str, task_type: TaskType) -> Result<Vec<f32>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        Retry::spawn(retry_strategy, || self.embed_once(text, task_type))
            .await
            .map_err(|e| {
                tracing::error!(attempts = self.max_retries, error = %e, "All embedding retry attempts failed");
                EmbeddingError::RetryExhausted {
                    attempts: self.max_retries,
                }
            })
    }

    async fn embed_once(&self, text: &str, task_type: TaskType) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type,
            output_dimensionality: self.dimensions,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let (code, message) = serde_json::from_str::<EmbedErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Gemini embedding API error");
            return Err(EmbeddingError::Api { code, message });
        }

        let values = response.json::<EmbedResponse>().await?.embedding.values;

        if values.len() != self.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }

    async fn embed_or_degrade(&self, text: &str, task_type: TaskType) -> Result<Option<Vec<f32>>, EmbeddingError> {
        match self.embed_with_task(text, task_type).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if self.fallback => {
                tracing::warn!(error = %e, "Embedding failed, continuing without a vector");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed_or_degrade(text, TaskType::RetrievalDocument).await
    }

    async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed_or_degrade(text, TaskType::RetrievalQuery).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        if self.fallback {
            "gemini-fallback"
        } else {
            "gemini"
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
