//! Text-generation capability for distillation.
//!
//! The pipeline only needs "prompt in, text out". `TextGenerator` hides the
//! provider; `GeminiTextClient` talks to Gemini `generateContent`, either via
//! the Generative Language API (API key) or a Vertex AI project endpoint
//! (bearer token).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::LlmConfig;

/// Model used when neither the task nor the config names one.
pub const DEFAULT_DISTILLATION_MODEL: &str = "gemini-2.0-flash-001";

const GENERATIVE_LANGUAGE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ============================================================================
// TextGenerator trait
// ============================================================================

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text for `prompt` against the named model.
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError>;

    /// Model used when the caller has no override.
    fn default_model(&self) -> &str;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Response contained no text candidate")]
    EmptyResponse,

    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

/// Build the configured generator.
pub fn create_generator(config: &LlmConfig) -> Result<Box<dyn TextGenerator>, LlmError> {
    Ok(Box::new(GeminiTextClient::new(config.clone())?))
}

// ============================================================================
// Gemini API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<GenerateContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeneratePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeneratePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<GenerateCandidate>,
}

#[derive(Debug, Deserialize)]
struct GenerateCandidate {
    content: Option<GenerateContent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// GeminiTextClient
// ============================================================================

#[derive(Debug, Clone)]
enum Endpoint {
    /// Generative Language API, authenticated with `?key=`.
    ApiKey { base_url: String },
    /// Vertex AI publisher model under a project, authenticated with a bearer token.
    Vertex { base_url: String, project: String, location: String },
}

#[derive(Debug, Clone)]
pub struct GeminiTextClient {
    client: Client,
    config: LlmConfig,
    endpoint: Endpoint,
}

impl GeminiTextClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingCredentials("llm.api_key / GOOGLE_API_KEY"));
        }

        let endpoint = match &config.project_id {
            Some(project) if !project.is_empty() => Endpoint::Vertex {
                base_url: config.base_url.clone().unwrap_or_else(|| {
                    format!("https://{}-aiplatform.googleapis.com/v1", config.location)
                }),
                project: project.clone(),
                location: config.location.clone(),
            },
            _ => Endpoint::ApiKey {
                base_url: config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| GENERATIVE_LANGUAGE_URL.to_string()),
            },
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    fn url_for(&self, model: &str) -> String {
        match &self.endpoint {
            Endpoint::ApiKey { base_url } => format!(
                "{}/models/{}:generateContent?key={}",
                base_url, model, self.config.api_key
            ),
            Endpoint::Vertex {
                base_url,
                project,
                location,
            } => format!(
                "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
                base_url, project, location, model
            ),
        }
    }

    async fn generate_once(&self, prompt: &str, model: &str) -> Result<String, LlmError> {
        let request = GenerateRequest {
            contents: vec![GenerateContent {
                role: Some("user".to_string()),
                parts: vec![GeneratePart {
                    text: Some(prompt.to_string()),
                }],
            }],
        };

        let mut builder = self.client.post(self.url_for(model)).json(&request);
        if let Endpoint::Vertex { .. } = self.endpoint {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let (code, message) = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, model, "Gemini generateContent error");
            return Err(LlmError::Api { code, message });
        }

        let body: GenerateResponse = response.json().await?;

        body.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().find_map(|p| p.text))
            .ok_or(LlmError::EmptyResponse)
    }
}

#[async_trait]
impl TextGenerator for GeminiTextClient {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(retry_strategy, || self.generate_once(prompt, model)).await;

        result.map_err(|e| {
            tracing::error!(
                attempts = self.config.max_retries,
                error = %e,
                model,
                "All generation retry attempts failed"
            );
            LlmError::RetryExhausted {
                attempts: self.config.max_retries,
                last: e.to_string(),
            }
        })
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn name(&self) -> &str {
        match self.endpoint {
            Endpoint::ApiKey { .. } => "gemini",
            Endpoint::Vertex { .. } => "vertex",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: "test-api-key".to_string(),
            base_url: Some(base_url),
            max_retries: 2,
            retry_delay_ms: 10,
            ..LlmConfig::default()
        }
    }

    fn text_response(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] }
            }]
        })
    }

    #[tokio::test]
    async fn test_generate_returns_first_candidate_text() {
        let mock_server = MockServer::start().await;
        let client = GeminiTextClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash-001:generateContent"))
            .and(query_param("key", "test-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("[]")))
            .mount(&mock_server)
            .await;

        let text = client
            .generate("extract", client.default_model())
            .await
            .expect("generation should succeed");
        assert_eq!(text, "[]");
        assert_eq!(client.name(), "gemini");
    }

    #[tokio::test]
    async fn test_generate_uses_requested_model() {
        let mock_server = MockServer::start().await;
        let client = GeminiTextClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let text = client.generate("p", "gemini-1.5-pro").await.unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn test_vertex_endpoint_uses_bearer_token() {
        let mock_server = MockServer::start().await;
        let mut config = test_config(mock_server.uri());
        config.project_id = Some("proj-1".to_string());
        let client = GeminiTextClient::new(config).unwrap();

        Mock::given(method("POST"))
            .and(path(
                "/projects/proj-1/locations/us-central1/publishers/google/models/gemini-2.0-flash-001:generateContent",
            ))
            .and(header("authorization", "Bearer test-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("v")))
            .mount(&mock_server)
            .await;

        let text = client.generate("p", client.default_model()).await.unwrap();
        assert_eq!(text, "v");
        assert_eq!(client.name(), "vertex");
    }

    #[tokio::test]
    async fn test_generate_retries_then_reports_exhaustion() {
        let mock_server = MockServer::start().await;
        let client = GeminiTextClient::new(test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": { "code": 503, "message": "overloaded" }
            })))
            .mount(&mock_server)
            .await;

        match client.generate("p", "m").await {
            Err(LlmError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.contains("overloaded"));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates_is_an_error() {
        let mock_server = MockServer::start().await;
        let mut config = test_config(mock_server.uri());
        config.max_retries = 0;
        let client = GeminiTextClient::new(config).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})))
            .mount(&mock_server)
            .await;

        let result = client.generate("p", "m").await;
        assert!(matches!(result, Err(LlmError::RetryExhausted { .. })));
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let result = GeminiTextClient::new(LlmConfig::default());
        assert!(matches!(result, Err(LlmError::MissingCredentials(_))));
    }
}
