//! Triage: vitals slip plus patient photo to a RED/YELLOW/GREEN decision

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{paths_of, AppContext, Processed, Tab, WorkflowRequest};
use crate::error::ApiError;
use crate::prompts;
use crate::recovery::JsonMap;

#[derive(Debug, Serialize)]
pub struct TriageOutput {
    pub vitals_extraction: JsonMap,
    pub physical_assessment: JsonMap,
    pub triage_analysis: JsonMap,
}

fn unassessed() -> JsonMap {
    let mut map = JsonMap::new();
    map.insert(
        "physical_condition".to_string(),
        Value::from("Unable to assess from image"),
    );
    map.insert("distress_level".to_string(), Value::from("Unknown"));
    map
}

pub(super) async fn process(
    ctx: &AppContext,
    request: WorkflowRequest,
) -> Result<Processed<TriageOutput>, ApiError> {
    if request.files.len() != 2 {
        return Err(ApiError::BadRequest(
            "Upload exactly 2 images: vitals slip + patient photo".to_string(),
        ));
    }
    let stored = ctx.store_files(request.files).await?;
    let vitals_image = stored[0].path.as_path();
    let patient_image = stored[1].path.as_path();

    info!("Extracting vitals from slip image");
    let raw = ctx
        .primary(
            "vitals extraction",
            ctx.prompts.vision_prompt(Tab::Triage),
            Some(vitals_image),
            "Failed to extract vitals from slip",
        )
        .await?;
    let vitals = ctx.recovery.recover_object(&raw);

    info!("Assessing patient physical condition");
    let physical = match ctx
        .registry
        .vision()
        .generate(prompts::PHYSICAL_ASSESSMENT, Some(patient_image))
        .await
    {
        Ok(raw) => ctx.recovery.recover_object(&raw),
        Err(e) => {
            warn!("Physical assessment failed, proceeding with vitals only: {}", e);
            unassessed()
        }
    };

    info!("Performing combined triage analysis");
    let raw = ctx
        .primary(
            "triage decision",
            &prompts::combined_triage(&vitals, &physical),
            Some(vitals_image),
            "Triage decision analysis failed",
        )
        .await?;
    let triage_analysis = ctx.recovery.recover_object(&raw);
    let priority = triage_analysis
        .get("priority")
        .and_then(Value::as_str)
        .unwrap_or("unparsed");
    info!("Triage decision: {}", priority);

    Ok(Processed {
        files: paths_of(&stored),
        output: TriageOutput {
            vitals_extraction: vitals,
            physical_assessment: physical,
            triage_analysis,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_triage_chains_three_calls() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new(
            "vision",
            vec![
                Ok("thought\n{\"spo2\": \"88%\", \"pulse\": \"120\"}"),
                Ok("The patient looks pale. {\"distress_level\": \"Severe\"}"),
                Ok("```json\n{\"priority\": \"RED\", \"recommended_action\": \"Oxygen\"}\n```"),
            ],
        );
        let ctx = context(&dir, vision.clone(), None);

        let processed = process(&ctx, images(&["slip.jpg", "patient.png"]))
            .await
            .unwrap();
        let output = processed.output;
        assert_eq!(output.vitals_extraction["spo2"], "88%");
        assert_eq!(output.physical_assessment["distress_level"], "Severe");
        assert_eq!(output.triage_analysis["priority"], "RED");
        assert_eq!(processed.files.len(), 2);

        let calls = vision.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].image.as_deref(), Some(processed.files[0].as_path()));
        assert_eq!(calls[1].image.as_deref(), Some(processed.files[1].as_path()));
        assert_eq!(calls[1].prompt, prompts::PHYSICAL_ASSESSMENT);
        // combined decision is sent with the vitals slip
        assert_eq!(calls[2].image.as_deref(), Some(processed.files[0].as_path()));
        assert!(calls[2].prompt.contains(r#""spo2":"88%""#));
        assert!(calls[2].prompt.contains(r#""distress_level":"Severe""#));
    }

    #[tokio::test]
    async fn test_physical_assessment_failure_degrades() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new(
            "vision",
            vec![Ok("{\"spo2\": \"97%\"}"), Err(500), Ok("{\"priority\": \"GREEN\"}")],
        );
        let ctx = context(&dir, vision.clone(), None);

        let output = process(&ctx, images(&["slip.jpg", "patient.png"]))
            .await
            .unwrap()
            .output;
        assert_eq!(
            output.physical_assessment["physical_condition"],
            "Unable to assess from image"
        );
        assert_eq!(output.physical_assessment["distress_level"], "Unknown");
        assert_eq!(output.triage_analysis["priority"], "GREEN");
        assert!(vision.calls()[2].prompt.contains("Unable to assess from image"));
    }

    #[tokio::test]
    async fn test_vitals_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new("vision", vec![Err(500)]);
        let ctx = context(&dir, vision.clone(), None);

        let err = process(&ctx, images(&["slip.jpg", "patient.png"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to extract vitals from slip");
        assert_eq!(vision.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new("vision", vec![Ok("{}"), Ok("{}"), Err(503)]);
        let ctx = context(&dir, vision, None);

        let err = process(&ctx, images(&["slip.jpg", "patient.png"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Triage decision analysis failed");
    }

    #[tokio::test]
    async fn test_unparsable_vitals_fall_back_to_raw_text() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new(
            "vision",
            vec![Ok("BP looks high"), Ok("{}"), Ok("{\"priority\": \"YELLOW\"}")],
        );
        let ctx = context(&dir, vision, None);

        let output = process(&ctx, images(&["slip.jpg", "patient.png"]))
            .await
            .unwrap()
            .output;
        assert_eq!(output.vitals_extraction["analysis"], "BP looks high");
    }

    #[tokio::test]
    async fn test_requires_exactly_two_images() {
        let dir = TempDir::new().unwrap();
        let vision = ScriptedModel::new("vision", vec![]);
        let ctx = context(&dir, vision.clone(), None);

        let err = process(&ctx, images(&["slip.jpg"])).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(vision.calls().is_empty());
    }
}
