//! Clients for the inference services.
//!
//! Workflows only see [`InferenceModel`]; the registry decides which
//! concrete client answers the primary (image) calls and which answers the
//! chained follow-up calls.

mod chat;
mod vision;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::ModelsConfig;
use crate::error::ModelError;

pub use chat::ChatClient;
pub use vision::VisionClient;

/// Default number of retry attempts for transient failures
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay
const MAX_BACKOFF_MS: u64 = 5000;

/// A model that turns a prompt (and optionally an image) into text
#[async_trait]
pub trait InferenceModel: Send + Sync {
    /// Model identifier reported in logs
    fn name(&self) -> &str;

    /// Models the backing service can serve
    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        Ok(vec![self.name().to_string()])
    }

    /// Run one generation. `image` is read from disk by the client.
    async fn generate(&self, prompt: &str, image: Option<&Path>) -> Result<String, ModelError>;
}

/// Connection status of one model service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model: String,
    pub role: String,
    pub connected: bool,
    pub available_models: Vec<String>,
    pub error: Option<String>,
}

/// Ask a model service which models it serves
pub async fn check_status(model: &dyn InferenceModel, role: &str) -> ModelStatus {
    match model.list_models().await {
        Ok(models) => ModelStatus {
            model: model.name().to_string(),
            role: role.to_string(),
            connected: true,
            available_models: models,
            error: None,
        },
        Err(e) => ModelStatus {
            model: model.name().to_string(),
            role: role.to_string(),
            connected: false,
            available_models: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

/// Check if a reqwest error is retryable (transient network issues)
pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    if let Some(status) = err.status() {
        return is_retryable_status(status);
    }
    false
}

/// Check if an HTTP status code is retryable
pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Exponential backoff capped at [`MAX_BACKOFF_MS`], plus up to 100ms jitter
pub(crate) fn calculate_backoff(attempt: u32) -> Duration {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped_delay = base_delay.min(MAX_BACKOFF_MS);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_millis() as u64)
        % 100;
    Duration::from_millis(capped_delay + jitter)
}

/// Validate and normalize a service base URL
pub(crate) fn clean_base_url(base_url: &str) -> Result<String, ModelError> {
    let cleaned = base_url.trim_end_matches('/');
    let parsed = reqwest::Url::parse(cleaned)
        .map_err(|e| ModelError::InvalidUrl(format!("'{}': {}", cleaned, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ModelError::InvalidUrl(format!(
            "'{}' must use http or https",
            cleaned
        )));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ModelError::InvalidUrl(format!(
            "'{}' must not contain credentials",
            cleaned
        )));
    }
    Ok(cleaned.to_string())
}

/// Stands in for a model that is switched off in the config.
struct DisabledModel {
    name: String,
}

#[async_trait]
impl InferenceModel for DisabledModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        Err(ModelError::Disabled(self.name.clone()))
    }

    async fn generate(&self, _prompt: &str, _image: Option<&Path>) -> Result<String, ModelError> {
        Err(ModelError::Disabled(self.name.clone()))
    }
}

/// The models available to workflows, passed explicitly as shared state
#[derive(Clone)]
pub struct ModelRegistry {
    vision: Arc<dyn InferenceModel>,
    text: Option<Arc<dyn InferenceModel>>,
    loaded: bool,
}

impl ModelRegistry {
    pub fn new(vision: Arc<dyn InferenceModel>, text: Option<Arc<dyn InferenceModel>>) -> Self {
        Self {
            vision,
            text,
            loaded: true,
        }
    }

    /// Build HTTP clients for every enabled model
    pub fn from_config(config: &ModelsConfig) -> Result<Self, ModelError> {
        let vision: Arc<dyn InferenceModel> = if config.vision.enabled {
            Arc::new(VisionClient::new(&config.vision)?)
        } else {
            info!("Vision model disabled in config");
            Arc::new(DisabledModel {
                name: config.vision.model_name.clone(),
            })
        };

        let text: Option<Arc<dyn InferenceModel>> = if config.text.enabled {
            Some(Arc::new(ChatClient::new(&config.text)?))
        } else {
            None
        };

        Ok(Self {
            vision,
            text,
            loaded: config.vision.enabled,
        })
    }

    /// Model for image extraction and primary calls
    pub fn vision(&self) -> &dyn InferenceModel {
        self.vision.as_ref()
    }

    /// Model for chained text-only calls: the text model when configured,
    /// otherwise the vision model in text-only mode
    pub fn followup(&self) -> &dyn InferenceModel {
        match &self.text {
            Some(text) => text.as_ref(),
            None => self.vision.as_ref(),
        }
    }

    pub fn has_text_model(&self) -> bool {
        self.text.is_some()
    }

    /// Whether the primary model is ready to serve requests
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    /// Status of every configured model service
    pub async fn status(&self) -> Vec<ModelStatus> {
        let mut statuses = vec![check_status(self.vision(), "vision").await];
        if let Some(text) = &self.text {
            statuses.push(check_status(text.as_ref(), "text").await);
        }
        statuses
    }
}
