//! Lab reports: extract test results from every page, then explain them

use serde::Serialize;
use tracing::{info, warn};

use super::{paths_of, preview, AppContext, Processed, Tab, WorkflowRequest};
use crate::error::ApiError;
use crate::prompts;
use crate::recovery::JsonMap;

#[derive(Debug, Serialize)]
pub struct ReportsOutput {
    pub extracted_tests: Vec<JsonMap>,
    pub patient_explanations: JsonMap,
}

pub(super) async fn process(
    ctx: &AppContext,
    request: WorkflowRequest,
) -> Result<Processed<ReportsOutput>, ApiError> {
    let max = ctx.uploads.max_files_per_request();
    if request.files.is_empty() || request.files.len() > max {
        return Err(ApiError::BadRequest(format!("Upload 1-{} images", max)));
    }
    let stored = ctx.store_files(request.files).await?;
    let vision = ctx.registry.vision();

    let mut extracted_tests = Vec::new();
    for (idx, upload) in stored.iter().enumerate() {
        info!("Processing image {}/{} for test extraction", idx + 1, stored.len());
        let raw = match vision
            .generate(ctx.prompts.vision_prompt(Tab::Reports), Some(upload.path.as_path()))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Test extraction failed for image {}: {}", idx + 1, e);
                continue;
            }
        };

        let tests = ctx.recovery.recover_list(&raw);
        if tests.is_empty() {
            warn!(
                "No tests extracted from image {}. Raw response: {}",
                idx + 1,
                preview(&raw)
            );
        } else {
            info!("Parsed {} tests from image {}", tests.len(), idx + 1);
            extracted_tests.extend(tests);
        }
    }
    info!("Total tests extracted: {}", extracted_tests.len());

    let patient_explanations = ctx
        .follow_up(
            vision,
            "lab explanation",
            &prompts::lab_explanation(&extracted_tests),
            Some(stored[0].path.as_path()),
        )
        .await;

    Ok(Processed {
        files: paths_of(&stored),
        output: ReportsOutput {
            extracted_tests,
            patient_explanations,
        },
    })
}
