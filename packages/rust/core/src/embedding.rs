//! Embedding generation behind the [`Embedder`] seam.

use std::time::Duration;

use async_trait::async_trait;
use docflow_shared::{AppConfig, DocflowError, Result, validate_api_key};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;

/// Produces one vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Client for an OpenAI-compatible `POST {api_base}/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    retry_delay: Duration,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(api_base: &str, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| DocflowError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Model from `[embedding]`, endpoint and key from `[conversion]`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = validate_api_key(&config.conversion.api_key_env)?;
        Self::new(&config.conversion.api_base, api_key, &config.embedding.model)
    }

    /// Base delay between attempts (doubles each retry).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    /// Retries on 429, 5xx and transport errors; other 4xx fail at once.
    #[instrument(skip_all, fields(model = %self.model, count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * (1 << (attempt - 1))).await;
            }

            let response = match self
                .client
                .post(format!("{}/embeddings", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(DocflowError::Enrichment(format!("embedding request failed: {e}")));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                    DocflowError::Enrichment(format!("invalid embedding response: {e}"))
                })?;
                return order_embeddings(parsed, texts.len());
            }

            let text = response.text().await.unwrap_or_default();
            let err = DocflowError::Enrichment(format!("embedding API error {status}: {text}"));
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(attempt, %status, "embedding API busy, retrying");
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| DocflowError::Enrichment("embedding failed".into())))
    }
}

fn order_embeddings(mut response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if response.data.len() != expected {
        return Err(DocflowError::Enrichment(format!(
            "expected {expected} embeddings, got {}",
            response.data.len()
        )));
    }
    response.data.sort_by_key(|item| item.index);
    debug!(dims = response.data.first().map_or(0, |d| d.embedding.len()), "embeddings received");
    Ok(response.data.into_iter().map(|item| item.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedder(server: &MockServer) -> OpenAiEmbedder {
        OpenAiEmbedder::new(&format!("{}/v1", server.uri()), "sk-test", "text-embedding-3-small")
            .unwrap()
            .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn embeddings_returned_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "text-embedding-3-small", "input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]},
                ]
            })))
            .mount(&server)
            .await;

        let vectors = embedder(&server)
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = embedder(&server).embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn server_errors_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&server)
            .await;

        let err = embedder(&server).embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let server = MockServer::start().await;
        assert!(embedder(&server).embed(&[]).await.unwrap().is_empty());
    }
}
