//! Ollama API client for the vision-language model
//!
//! Images are sent base64-encoded in the `images` field of
//! `POST /api/generate`; text-only calls simply omit it.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    calculate_backoff, clean_base_url, is_retryable_error, is_retryable_status, InferenceModel,
    DEFAULT_MAX_RETRIES,
};
use crate::config::VisionModelConfig;
use crate::error::ModelError;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagInfo>,
}

#[derive(Debug, Deserialize)]
struct TagInfo {
    name: String,
}

/// Ollama `/api/generate` client
#[derive(Debug)]
pub struct VisionClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl VisionClient {
    pub fn new(config: &VisionModelConfig) -> Result<Self, ModelError> {
        let base_url = clean_base_url(&config.base_url)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!("VisionClient created for {} ({})", base_url, config.model_name);

        Ok(Self {
            client,
            base_url,
            model: config.model_name.clone(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Override the retry budget (at least one attempt is always made)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    async fn encode_image(path: &Path) -> Result<String, ModelError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ModelError::ImageRead {
                path: path.display().to_string(),
                source,
            })?;
        Ok(STANDARD.encode(bytes))
    }
}

#[async_trait]
impl InferenceModel for VisionClient {
    fn name(&self) -> &str {
        &self.model
    }

    /// List models the Ollama server has pulled
    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate(&self, prompt: &str, image: Option<&Path>) -> Result<String, ModelError> {
        let images = match image {
            Some(path) => vec![Self::encode_image(path).await?],
            None => Vec::new(),
        };

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images,
            stream: false,
        };

        let url = format!("{}/api/generate", self.base_url);
        debug!(
            "Generating with {} at {} (image: {})",
            self.model,
            url,
            image.is_some()
        );

        let mut last_error: Option<ModelError> = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt - 1);
                warn!(
                    "Vision generate attempt {} failed, retrying in {:?}",
                    attempt, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            match self.client.post(&url).json(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: GenerateResponse = response
                            .json()
                            .await
                            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
                        return Ok(body.response);
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = ModelError::Status {
                        status: status.as_u16(),
                        body,
                    };
                    if is_retryable_status(status) {
                        last_error = Some(err);
                        continue;
                    }
                    error!("Vision generate failed: {}", err);
                    return Err(err);
                }
                Err(e) => {
                    if is_retryable_error(&e) {
                        last_error = Some(ModelError::Network(e));
                        continue;
                    }
                    return Err(ModelError::Network(e));
                }
            }
        }

        let err = last_error.unwrap_or(ModelError::EmptyResponse);
        error!(
            "Vision generate failed after {} attempts: {}",
            self.max_retries, err
        );
        Err(err)
    }
}
