//! Polypharmacy: read every medicine strip, then check the combination

use serde::Serialize;
use tracing::{info, warn};

use super::{paths_of, preview, AppContext, Processed, Tab, WorkflowRequest};
use crate::error::ApiError;
use crate::prompts;
use crate::recovery::JsonMap;

#[derive(Debug, Serialize)]
pub struct PolypharmacyOutput {
    pub medicines_extracted: Vec<JsonMap>,
    pub safety_analysis: JsonMap,
}

pub(super) async fn process(
    ctx: &AppContext,
    request: WorkflowRequest,
) -> Result<Processed<PolypharmacyOutput>, ApiError> {
    let max = ctx.uploads.max_files_per_request();
    if request.files.is_empty() || request.files.len() > max {
        return Err(ApiError::BadRequest(format!("Upload 1-{} images", max)));
    }
    let stored = ctx.store_files(request.files).await?;
    let vision = ctx.registry.vision();
    let prompt = ctx.prompts.vision_prompt(Tab::Polypharmacy);

    let mut medicines_extracted = Vec::new();
    for (idx, upload) in stored.iter().enumerate() {
        info!(
            "Processing image {}/{} for medicine extraction",
            idx + 1,
            stored.len()
        );
        match vision.generate(prompt, Some(upload.path.as_path())).await {
            Ok(raw) => {
                let medicines = ctx.recovery.recover_list(&raw);
                if medicines.is_empty() {
                    warn!(
                        "No medicines extracted from image {}. Raw response: {}",
                        idx + 1,
                        preview(&raw)
                    );
                }
                medicines_extracted.extend(medicines);
            }
            Err(e) => warn!("Medicine extraction failed for image {}: {}", idx + 1, e),
        }
    }
    info!("Total medicines extracted: {}", medicines_extracted.len());

    let safety_analysis = ctx
        .follow_up(
            vision,
            "safety analysis",
            &prompts::polypharmacy_safety(&medicines_extracted),
            Some(stored[0].path.as_path()),
        )
        .await;

    Ok(Processed {
        files: paths_of(&stored),
        output: PolypharmacyOutput {
            medicines_extracted,
            safety_analysis,
        },
    })
}
