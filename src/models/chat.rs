//! OpenAI-compatible chat client for the text-generation model
//!
//! The model is served by an external runtime (vLLM, llama.cpp server, TGI)
//! instead of being loaded into this process. Requests carry a single user
//! message, matching how the model was prompted during evaluation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    calculate_backoff, clean_base_url, is_retryable_error, is_retryable_status, InferenceModel,
    DEFAULT_MAX_RETRIES,
};
use crate::config::TextModelConfig;
use crate::error::ModelError;

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
}

/// Chat-completions client
#[derive(Debug)]
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl ChatClient {
    pub fn new(config: &TextModelConfig) -> Result<Self, ModelError> {
        let base_url = clean_base_url(&config.base_url)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!("ChatClient created for {} ({})", base_url, config.model_name);

        Ok(Self {
            client,
            base_url,
            model: config.model_name.clone(),
            max_tokens: config.max_new_tokens,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Override the retry budget (at least one attempt is always made)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

#[async_trait]
impl InferenceModel for ChatClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn generate(&self, prompt: &str, image: Option<&Path>) -> Result<String, ModelError> {
        if image.is_some() {
            return Err(ModelError::ImageUnsupported(self.model.clone()));
        }

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            max_tokens: Some(self.max_tokens),
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!("Generating with text model {} at {}", self.model, url);

        let mut last_error: Option<ModelError> = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt - 1);
                warn!(
                    "Text generate attempt {} failed, retrying in {:?}",
                    attempt, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            match self.client.post(&url).json(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let chat: ChatCompletionResponse = response
                            .json()
                            .await
                            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
                        return chat
                            .choices
                            .into_iter()
                            .next()
                            .map(|choice| choice.message.content)
                            .ok_or(ModelError::EmptyResponse);
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
                    error!("Text generate failed: {}", err);
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
            "Text generate failed after {} attempts: {}",
            self.max_retries, err
        );
        Err(err)
    }
}
