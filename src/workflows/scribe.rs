//! Scribe: handwritten notes to structured history and a physician summary

use serde::Serialize;
use tracing::info;

use super::{paths_of, AppContext, Processed, Tab, WorkflowRequest};
use crate::error::ApiError;
use crate::prompts;
use crate::recovery::JsonMap;

/// Notes spanning more pages than this are rejected
const MAX_PAGES: usize = 2;

#[derive(Debug, Serialize)]
pub struct ScribeOutput {
    pub transcribed_notes: JsonMap,
    pub doctor_summary: JsonMap,
}

pub(super) async fn process(
    ctx: &AppContext,
    request: WorkflowRequest,
) -> Result<Processed<ScribeOutput>, ApiError> {
    if request.files.is_empty() || request.files.len() > MAX_PAGES {
        return Err(ApiError::BadRequest(format!("Upload 1-{} images", MAX_PAGES)));
    }
    let stored = ctx.store_files(request.files).await?;
    let notes_image = stored[0].path.as_path();

    info!("Transcribing doctor notes");
    let raw = ctx
        .primary(
            "transcription",
            ctx.prompts.vision_prompt(Tab::Scribe),
            Some(notes_image),
            "Vision model failed",
        )
        .await?;
    let transcribed_notes = ctx.recovery.recover_object(&raw);

    info!("Summarizing for the physician");
    let doctor_summary = ctx
        .follow_up(
            ctx.registry.vision(),
            "executive summary",
            &prompts::executive_summary(&transcribed_notes),
            Some(notes_image),
        )
        .await;

    Ok(Processed {
        files: paths_of(&stored),
        output: ScribeOutput {
            transcribed_notes,
            doctor_summary,
        },
    })
}
