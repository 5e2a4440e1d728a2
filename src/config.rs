use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::recovery::ResponseRecovery;

/// Vision-language model served over the Ollama API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionModelConfig {
    pub model_name: String,
    pub base_url: String,
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for VisionModelConfig {
    fn default() -> Self {
        Self {
            model_name: "qwen3-vl:4b".to_string(),
            base_url: "http://localhost:11434".to_string(),
            enabled: true,
            timeout_secs: 120,
        }
    }
}

/// Text-generation model served over an OpenAI-compatible API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextModelConfig {
    pub model_name: String,
    pub base_url: String,
    pub enabled: bool,
    pub max_new_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for TextModelConfig {
    fn default() -> Self {
        Self {
            model_name: "google/medgemma-1.5-4b-it".to_string(),
            base_url: "http://localhost:8080".to_string(),
            enabled: false,
            max_new_tokens: 512,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub vision: VisionModelConfig,
    pub text: TextModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Served under `/static` when the directory exists
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            static_dir: PathBuf::from("static"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub temp_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub max_files_per_request: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/medral"),
            max_file_size_mb: 50,
            allowed_extensions: [".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_files_per_request: 10,
        }
    }
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> usize {
        (self.max_file_size_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Upper bound for a whole multipart request body
    pub fn max_request_bytes(&self) -> usize {
        self.max_file_size_bytes()
            .saturating_mul(self.max_files_per_request)
            // room for text fields and multipart framing
            .saturating_add(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_minutes: u64,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_sessions: 100,
        }
    }
}

fn default_languages() -> BTreeMap<String, String> {
    [
        ("en", "English"),
        ("hi", "Hindi"),
        ("ta", "Tamil"),
        ("te", "Telugu"),
        ("ml", "Malayalam"),
        ("kn", "Kannada"),
    ]
    .iter()
    .map(|(code, name)| (code.to_string(), name.to_string()))
    .collect()
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub session: SessionConfig,
    pub languages: BTreeMap<String, String>,
    /// Prompt catalogue overriding the built-in prompts
    pub prompts_path: Option<PathBuf>,
    pub recovery: ResponseRecovery,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            session: SessionConfig::default(),
            languages: default_languages(),
            prompts_path: None,
            recovery: ResponseRecovery::default(),
        }
    }
}

/// Only plain http(s) URLs without embedded credentials are accepted.
fn validate_model_url(label: &str, url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url.trim_end_matches('/'))
        .with_context(|| format!("Invalid {} URL '{}'", label, url))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("{} URL must use http or https scheme, got: {}", label, parsed.scheme());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        bail!("{} URL must not contain credentials", label);
    }
    Ok(())
}

impl Config {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".medral"))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.json"))
    }

    /// Load config from file, or return defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file {:?}", path))
        } else {
            debug!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.upload.max_file_size_mb == 0 {
            bail!("upload.max_file_size_mb must be non-zero");
        }
        if self.upload.max_files_per_request == 0 {
            bail!("upload.max_files_per_request must be non-zero");
        }
        if self.upload.allowed_extensions.is_empty() {
            bail!("upload.allowed_extensions must list at least one extension");
        }
        if self.session.max_sessions == 0 {
            bail!("session.max_sessions must be non-zero");
        }
        if self.recovery.wrapper_key.is_empty() || self.recovery.fallback_key.is_empty() {
            bail!("recovery keys must not be empty");
        }
        validate_model_url("vision model", &self.models.vision.base_url)?;
        if self.models.text.enabled {
            validate_model_url("text model", &self.models.text.base_url)?;
        }
        Ok(())
    }
}
