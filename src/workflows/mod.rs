//! The five documentation workflows.
//!
//! Every workflow follows the same shape: validate the request, persist the
//! uploads, run a primary vision call whose text is recovered into JSON, then
//! chain a follow-up call on that JSON. Primary failures abort the request;
//! follow-up failures degrade to a mapping carrying the error.

mod polypharmacy;
mod reports;
mod scribe;
mod translator;
mod triage;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::{InferenceModel, ModelRegistry};
use crate::prompts::PromptCatalog;
use crate::recovery::{JsonMap, ResponseRecovery};
use crate::session::SessionStore;
use crate::uploads::{StoredUpload, UploadStore};

pub use polypharmacy::PolypharmacyOutput;
pub use reports::ReportsOutput;
pub use scribe::ScribeOutput;
pub use translator::TranslatorOutput;
pub use triage::TriageOutput;

/// Longest slice of raw model output written to the debug log
const PREVIEW_CHARS: usize = 200;

/// A workflow, also the key its result is stored under in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    Triage,
    Reports,
    Scribe,
    Translator,
    Polypharmacy,
}

impl Tab {
    pub const ALL: [Tab; 5] = [
        Tab::Triage,
        Tab::Reports,
        Tab::Scribe,
        Tab::Translator,
        Tab::Polypharmacy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tab::Triage => "triage",
            Tab::Reports => "reports",
            Tab::Scribe => "scribe",
            Tab::Translator => "translator",
            Tab::Polypharmacy => "polypharmacy",
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded file as received, before validation
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Everything a workflow needs from the request
#[derive(Debug, Default)]
pub struct WorkflowRequest {
    pub session_id: Option<Uuid>,
    pub files: Vec<IncomingFile>,
    pub text_input: Option<String>,
}

/// Tab-specific payload plus the files it was produced from
#[derive(Debug)]
pub struct Processed<T> {
    pub output: T,
    pub files: Vec<PathBuf>,
}

impl<T: Serialize> Processed<T> {
    fn into_parts(self) -> Result<(JsonMap, Vec<PathBuf>), ApiError> {
        match serde_json::to_value(self.output) {
            Ok(Value::Object(map)) => Ok((map, self.files)),
            Ok(other) => Err(ApiError::Internal(format!(
                "Workflow produced a non-object result: {}",
                other
            ))),
            Err(e) => Err(ApiError::Internal(format!(
                "Failed to serialize workflow result: {}",
                e
            ))),
        }
    }
}

/// Shared state handed to every workflow and HTTP handler
pub struct AppContext {
    pub config: Config,
    pub registry: ModelRegistry,
    pub recovery: ResponseRecovery,
    pub prompts: PromptCatalog,
    pub uploads: UploadStore,
    pub sessions: SessionStore,
}

impl AppContext {
    pub fn new(config: Config, registry: ModelRegistry) -> Result<Self> {
        let prompts = PromptCatalog::load(config.prompts_path.as_deref())?;
        Ok(Self {
            recovery: config.recovery.clone(),
            uploads: UploadStore::new(&config.upload),
            sessions: SessionStore::new(&config.session),
            prompts,
            registry,
            config,
        })
    }

    async fn store_files(&self, files: Vec<IncomingFile>) -> Result<Vec<StoredUpload>, ApiError> {
        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            stored.push(self.uploads.save(&file.filename, &file.bytes).await?);
        }
        Ok(stored)
    }

    /// Run a call the workflow cannot do without. Failure aborts the request
    /// with `failure` as the message.
    async fn primary(
        &self,
        step: &str,
        prompt: &str,
        image: Option<&Path>,
        failure: &str,
    ) -> Result<String, ApiError> {
        match self.registry.vision().generate(prompt, image).await {
            Ok(text) => {
                debug!("Raw {} response: {}", step, preview(&text));
                Ok(text)
            }
            Err(e) => {
                error!("{} failed: {}", step, e);
                Err(ApiError::Workflow(failure.to_string()))
            }
        }
    }

    /// Run a chained call and recover its mapping. Failure degrades to
    /// `{fallback_key: "", "error": message}`.
    async fn follow_up(
        &self,
        model: &dyn InferenceModel,
        step: &str,
        prompt: &str,
        image: Option<&Path>,
    ) -> JsonMap {
        match model.generate(prompt, image).await {
            Ok(text) => {
                debug!("Raw {} response: {}", step, preview(&text));
                self.recovery.recover_object(&text)
            }
            Err(e) => {
                warn!("{} failed, returning degraded result: {}", step, e);
                let mut degraded = self.recovery.fallback("");
                degraded.insert("error".to_string(), Value::String(e.to_string()));
                degraded
            }
        }
    }
}

/// First `PREVIEW_CHARS` characters of `text`
fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn paths_of(stored: &[StoredUpload]) -> Vec<PathBuf> {
    stored.iter().map(|s| s.path.clone()).collect()
}

/// Run `tab` for `request` and record the result under its session
pub async fn run(ctx: &AppContext, tab: Tab, request: WorkflowRequest) -> Result<Value, ApiError> {
    let session_id = ctx.sessions.resolve(request.session_id).await;
    info!("Processing {} for session {}", tab, session_id);

    let (payload, files) = match tab {
        Tab::Triage => triage::process(ctx, request).await?.into_parts()?,
        Tab::Reports => reports::process(ctx, request).await?.into_parts()?,
        Tab::Scribe => scribe::process(ctx, request).await?.into_parts()?,
        Tab::Translator => translator::process(ctx, request).await?.into_parts()?,
        Tab::Polypharmacy => polypharmacy::process(ctx, request).await?.into_parts()?,
    };

    let mut result = JsonMap::new();
    result.insert("status".to_string(), Value::from("success"));
    result.insert("session_id".to_string(), Value::from(session_id.to_string()));
    result.insert("tab".to_string(), Value::from(tab.as_str()));
    result.extend(payload);
    result.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
    let result = Value::Object(result);

    ctx.sessions.record_files(session_id, tab, files).await;
    if !ctx.sessions.record_result(session_id, tab, result.clone()).await {
        warn!("Session {} was evicted before its {} result was stored", session_id, tab);
    }
    info!("{} complete for session {}", tab, session_id);
    Ok(result)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::ModelError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// One recorded `generate` call
    #[derive(Debug, Clone)]
    pub struct Call {
        pub prompt: String,
        pub image: Option<PathBuf>,
    }

    /// Model that answers from a script, one reply per call
    pub struct ScriptedModel {
        name: String,
        replies: Mutex<VecDeque<Result<String, u16>>>,
        pub calls: Mutex<Vec<Call>>,
    }

    impl ScriptedModel {
        /// `Err(status)` replies fail with that HTTP status
        pub fn new(name: &str, replies: Vec<Result<&str, u16>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceModel for ScriptedModel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, prompt: &str, image: Option<&Path>) -> Result<String, ModelError> {
            self.calls.lock().unwrap().push(Call {
                prompt: prompt.to_string(),
                image: image.map(Path::to_path_buf),
            });
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(status)) => Err(ModelError::Status {
                    status,
                    body: "scripted failure".to_string(),
                }),
                None => Err(ModelError::EmptyResponse),
            }
        }
    }

    pub fn context(
        dir: &TempDir,
        vision: Arc<ScriptedModel>,
        text: Option<Arc<ScriptedModel>>,
    ) -> AppContext {
        let mut config = Config::default();
        config.upload.temp_dir = dir.path().join("uploads");
        config.upload.max_files_per_request = 3;
        let registry = ModelRegistry::new(
            vision,
            text.map(|t| t as Arc<dyn InferenceModel>),
        );
        AppContext::new(config, registry).unwrap()
    }

    pub fn image(name: &str) -> IncomingFile {
        IncomingFile {
            filename: name.to_string(),
            bytes: b"image-bytes".to_vec(),
        }
    }

    pub fn images(names: &[&str]) -> WorkflowRequest {
        WorkflowRequest {
            files: names.iter().map(|n| image(n)).collect(),
            ..WorkflowRequest::default()
        }
    }
}
