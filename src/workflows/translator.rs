//! Translator: an image or typed text to English, then a safety review

use serde::Serialize;
use tracing::info;

use super::{paths_of, AppContext, Processed, Tab, WorkflowRequest};
use crate::error::ApiError;
use crate::prompts;
use crate::recovery::JsonMap;

#[derive(Debug, Serialize)]
pub struct TranslatorOutput {
    pub translation: JsonMap,
    pub validation: JsonMap,
}

pub(super) async fn process(
    ctx: &AppContext,
    request: WorkflowRequest,
) -> Result<Processed<TranslatorOutput>, ApiError> {
    if request.files.len() > 1 {
        return Err(ApiError::BadRequest("Upload a single image".to_string()));
    }
    let text_input = request
        .text_input
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());

    let stored = ctx.store_files(request.files).await?;

    // an image wins over typed text
    let (prompt, image) = match (stored.first(), text_input) {
        (Some(upload), _) => {
            info!("Extracting text to translate from image");
            (
                ctx.prompts.vision_prompt(Tab::Translator).to_string(),
                Some(upload.path.as_path()),
            )
        }
        (None, Some(text)) => {
            info!("Translating {} characters of typed text", text.chars().count());
            (prompts::text_translation(text, &ctx.config.languages), None)
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Provide either file or text_input".to_string(),
            ))
        }
    };

    let raw = ctx
        .primary("translation", &prompt, image, "Translation extraction failed")
        .await?;
    let translation = ctx.recovery.recover_object(&raw);

    info!(
        "Validating translation with {}",
        ctx.registry.followup().name()
    );
    let validation = ctx
        .follow_up(
            ctx.registry.followup(),
            "translation validation",
            &prompts::translation_validation(&translation),
            None,
        )
        .await;

    Ok(Processed {
        files: paths_of(&stored),
        output: TranslatorOutput {
            translation,
            validation,
        },
    })
}
