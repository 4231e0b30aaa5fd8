//! Image descriptions via an OpenAI-compatible vision chat completion.

use std::collections::HashMap;
use std::time::Duration;

use docflow_markdown::{image_refs, insert_image_descriptions};
use docflow_shared::{ConversionConfig, DocflowError, Result, validate_api_key};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

const LLM_TIMEOUT: Duration = Duration::from_secs(60);

const DESCRIBE_PROMPT: &str = "Describe this image in sentences in a single paragraph. \
Focus on key visual elements, data, diagrams, charts, or important details that would be \
useful for understanding the document.";

/// Describes images referenced from Markdown.
#[derive(Clone)]
pub struct ImageAnnotator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for ImageAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAnnotator")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ImageAnnotator {
    pub fn new(api_base: &str, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .map_err(|e| DocflowError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from `[conversion]`; fails when the API key env var is unset.
    pub fn from_config(config: &ConversionConfig) -> Result<Self> {
        let api_key = validate_api_key(&config.api_key_env).map_err(|_| {
            DocflowError::config(format!(
                "{} environment variable is required for image annotation but is not set",
                config.api_key_env
            ))
        })?;
        Self::new(&config.api_base, api_key, &config.image_model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One-paragraph description of the image at `image_url`.
    #[instrument(skip(self), fields(model = %self.model))]
    pub async fn describe(&self, image_url: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": DESCRIBE_PROMPT},
                    {"type": "image_url", "image_url": {"url": image_url}},
                ],
            }],
            "max_tokens": 300,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DocflowError::Enrichment(format!("vision request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DocflowError::Enrichment(format!(
                "vision API error {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DocflowError::Enrichment(format!("invalid vision response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DocflowError::Enrichment("vision response had no content".into()))
    }

    /// Insert a description under every remote or inline (`data:`) image.
    ///
    /// Returns the new Markdown and how many distinct images were described.
    /// A failed description is logged and that image is left as is.
    pub async fn annotate(&self, markdown: &str) -> (String, usize) {
        let mut descriptions = HashMap::new();
        for image in image_refs(markdown) {
            if descriptions.contains_key(&image.url)
                || !(image.is_remote() || image.url.starts_with("data:image/"))
            {
                continue;
            }
            match self.describe(&image.url).await {
                Ok(text) => {
                    debug!(url = %image.url, "image described");
                    descriptions.insert(image.url, text);
                }
                Err(e) => warn!(url = %image.url, error = %e, "image annotation failed, skipping"),
            }
        }

        let count = descriptions.len();
        if count == 0 {
            return (markdown.to_string(), 0);
        }
        (insert_image_descriptions(markdown, &descriptions), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(text: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
    }

    #[tokio::test]
    async fn describes_remote_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("A bar chart of revenue.")))
            .expect(1)
            .mount(&server)
            .await;

        let annotator =
            ImageAnnotator::new(&format!("{}/v1", server.uri()), "sk-test", "gpt-4o-mini").unwrap();
        let md = "# Report\n\n![Chart](https://cdn.example.com/c.png)\n\nSee ![again](https://cdn.example.com/c.png) and ![local](img/x.png).\n";
        let (out, count) = annotator.annotate(md).await;

        assert_eq!(count, 1);
        assert!(out.contains("![Chart](https://cdn.example.com/c.png)\n\n> A bar chart of revenue.\n"));
        assert!(out.contains("![local](img/x.png)"));
    }

    #[tokio::test]
    async fn failed_descriptions_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let annotator = ImageAnnotator::new(&server.uri(), "sk-test", "m").unwrap();
        let md = "![a](https://x.dev/a.png)\n";
        let (out, count) = annotator.annotate(md).await;
        assert_eq!(count, 0);
        assert_eq!(out, md);

        let err = annotator.describe("https://x.dev/a.png").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = ConversionConfig {
            api_key_env: "DOCFLOW_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..ConversionConfig::default()
        };
        let err = ImageAnnotator::from_config(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("DOCFLOW_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn debug_output_hides_api_key() {
        let annotator = ImageAnnotator::new("https://api.example.com/v1/", "sk-secret", "m").unwrap();
        let shown = format!("{annotator:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("<redacted>"));
        assert!(shown.contains("https://api.example.com/v1\""));
    }
}
