//! Embedding provider trait and the HTTP client for remote vectorization services

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

/// Trait for embedding providers that turn text into a vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Name of the model producing the vectors
    fn model_name(&self) -> &str;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Cheap liveness check, used as the half-open circuit probe.
    ///
    /// Providers without a dedicated endpoint keep the default, in which case
    /// the next real call serves as the probe.
    async fn health_check(&self) -> Option<Result<()>> {
        None
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

/// Response shapes accepted from providers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    /// `{"embedding": [...]}`
    Single { embedding: Vec<f32> },
    /// `{"embeddings": [[...]]}`
    Batch { embeddings: Vec<Vec<f32>> },
    /// `{"data": [{"embedding": [...]}]}`
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Extracts the first vector from a provider response body.
pub fn parse_embedding_response(body: &str) -> Result<Vec<f32>> {
    let response: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|e| EmbedError::invalid_response(format!("unrecognized response body: {e}")))?;

    let vector = match response {
        EmbeddingResponse::Single { embedding } => Some(embedding),
        EmbeddingResponse::Batch { embeddings } => embeddings.into_iter().next(),
        EmbeddingResponse::Data { data } => data.into_iter().next().map(|d| d.embedding),
    }
    .ok_or_else(|| EmbedError::invalid_response("response contained no embedding"))?;

    if vector.is_empty() {
        return Err(EmbedError::invalid_response("embedding is empty"));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbedError::invalid_response(
            "embedding contains non-finite values",
        ));
    }
    Ok(vector)
}

/// Provider that POSTs `{model, input}` to an HTTP endpoint.
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: String,
    model: String,
    health_url: Option<String>,
}

impl std::fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("health_url", &self.health_url)
            .finish()
    }
}

impl HttpEmbeddingProvider {
    /// Builds the HTTP client from configuration. The API key, if the
    /// configured environment variable is set, is sent as a bearer token.
    pub fn new(config: &EmbedConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key() {
            let auth = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| EmbedError::invalid_config("API key is not a valid header value"))?;
            headers.insert(AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        tracing::info!(
            "Embedding provider configured: {} (model {})",
            config.endpoint,
            config.model
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            health_url: config.health_url.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EmbedError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        parse_embedding_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "http"
    }

    async fn health_check(&self) -> Option<Result<()>> {
        let url = self.health_url.as_ref()?;
        let result = async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(EmbedError::Status {
                    status: status.as_u16(),
                    body: String::new(),
                })
            }
        }
        .await;
        Some(result)
    }
}

/// Error bodies can be whole HTML pages; keep the start only.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_shape() {
        let v = parse_embedding_response(r#"{"embedding": [0.1, 0.2, 0.3]}"#).unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_parse_batch_and_data_shapes() {
        let v = parse_embedding_response(r#"{"model": "m", "embeddings": [[1.0, 2.0]]}"#).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);

        let v = parse_embedding_response(
            r#"{"object": "list", "data": [{"index": 0, "embedding": [0.5, -0.5]}]}"#,
        )
        .unwrap();
        assert_eq!(v, vec![0.5, -0.5]);
    }

    #[test]
    fn test_parse_rejects_unusable_bodies() {
        for body in [
            r#"{"embedding": []}"#,
            r#"{"embeddings": []}"#,
            r#"{"error": "model not found"}"#,
            "not json",
        ] {
            let err = parse_embedding_response(body).unwrap_err();
            assert!(matches!(err, EmbedError::InvalidResponse { .. }), "{body}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_provider_construction() {
        let config = EmbedConfig::default()
            .with_endpoint("http://127.0.0.1:9/api/embed")
            .with_model("test-model");
        let provider = HttpEmbeddingProvider::new(&config).unwrap();
        assert_eq!(provider.model_name(), "test-model");
        assert_eq!(provider.provider_name(), "http");
        assert_eq!(provider.endpoint(), "http://127.0.0.1:9/api/embed");

        assert!(HttpEmbeddingProvider::new(&EmbedConfig::default().with_model("")).is_err());
    }

    #[tokio::test]
    async fn test_health_check_absent_without_url() {
        let provider = HttpEmbeddingProvider::new(&EmbedConfig::default()).unwrap();
        assert!(provider.health_check().await.is_none());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "é".repeat(400);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 515);
    }
}
