//! Prompt catalogue and builders for the chained prompts.
//!
//! The first-step prompt of each tab comes from a JSON catalogue so it can be
//! tuned without a rebuild. The chained prompts embed earlier results and are
//! built here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

use crate::recovery::JsonMap;
use crate::workflows::Tab;

const BUILTIN_PROMPTS: &str = include_str!("../prompts/prompts.json");

#[derive(Debug, Clone, Deserialize)]
struct TabPrompts {
    #[serde(alias = "qwen3_vl")]
    vision: String,
}

/// First-step prompts, keyed by tab
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    prompts: HashMap<String, TabPrompts>,
}

impl PromptCatalog {
    fn parse(content: &str) -> Result<HashMap<String, TabPrompts>> {
        serde_json::from_str(content).context("Failed to parse prompt catalogue")
    }

    /// The catalogue shipped with the service
    pub fn builtin() -> Result<Self> {
        let prompts = Self::parse(BUILTIN_PROMPTS)?;
        for tab in Tab::ALL {
            if !prompts.contains_key(tab.as_str()) {
                bail!("Built-in prompt catalogue is missing '{}'", tab);
            }
        }
        Ok(Self { prompts })
    }

    /// Built-in prompts overlaid with the entries of `path`, if given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt catalogue {:?}", path))?;
            let overrides = Self::parse(&content)?;
            info!("Loaded {} prompt overrides from {:?}", overrides.len(), path);
            catalog.prompts.extend(overrides);
        }
        Ok(catalog)
    }

    /// First-step vision prompt for `tab`
    pub fn vision_prompt(&self, tab: Tab) -> &str {
        self.prompts
            .get(tab.as_str())
            .map(|p| p.vision.as_str())
            .unwrap_or_default()
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

pub const PHYSICAL_ASSESSMENT: &str = r#"You are a Medical Vision Specialist. Analyze this patient photo for visible signs of distress or condition.

Look for: 1) Skin color (pale, flushed, cyanotic), 2) Breathing pattern (labored, shallow, normal), 3) Posture/positioning, 4) Consciousness level, 5) Visible distress signs (sweating, grimacing, restlessness).

Output a JSON object: {"physical_condition": "description", "distress_level": "None/Mild/Moderate/Severe", "visible_signs": ["sign1", "sign2"], "breathing_assessment": "description", "consciousness": "alert/drowsy/unresponsive"}"#;

pub fn combined_triage(vitals: &JsonMap, physical: &JsonMap) -> String {
    format!(
        r#"You are a Triage Nurse using Indian PHC guidelines. Make a triage decision based on BOTH vitals and physical assessment.

VITALS DATA: {}

PHYSICAL ASSESSMENT: {}

Assign priority based on COMBINED analysis:
- RED: Life-threatening (severe vital signs + severe distress)
- YELLOW: Urgent care needed (abnormal vitals or moderate distress)
- GREEN: Stable (normal/mild findings)

Output ONLY this JSON format with NO extra text:
{{"priority": "RED or YELLOW or GREEN", "justification_english": "Combined assessment reasoning in simple English", "justification_hindi": "सरल हिंदी में कारण", "key_vital_flags": ["concerning findings"], "physical_flags": ["physical concerns"], "recommended_action": "immediate action for nurse", "assessment_basis": "vitals and physical combined"}}"#,
        to_json(vitals),
        to_json(physical)
    )
}

pub fn lab_explanation(tests: &[JsonMap]) -> String {
    format!(
        r#"As a Patient Health Educator, explain these lab results in simple terms for a non-medical person.

Lab Results: {}

Output ONLY this JSON format with NO thinking or extra text:
{{"explanations": [{{"test_name": "name", "simple_explanation": "2 sentences", "status": "Normal/Concerning", "analogy": "simple comparison"}}], "next_steps": ["action1", "action2"], "warning_signs": "if any"}}"#,
        to_json(tests)
    )
}

pub fn executive_summary(notes: &JsonMap) -> String {
    format!(
        r#"As a Clinical Registrar, create a 3-bullet Executive Summary for the physician.

Patient History: {}

Highlight the most critical complaint first. Output ONLY this JSON format with NO thinking or extra text:
{{"executive_summary": ["critical point 1", "point 2", "point 3"], "critical_flags": ["flag1"], "doctor_focus_time": "Under 10 seconds"}}"#,
        to_json(notes)
    )
}

/// Translation prompt for typed text. The text is embedded as a JSON string
/// so quotes in the input cannot break the requested output template.
pub fn text_translation(text: &str, languages: &BTreeMap<String, String>) -> String {
    let known: Vec<String> = languages
        .iter()
        .map(|(code, name)| format!("{} ({})", name, code))
        .collect();
    format!(
        r#"Detect language and translate this medical text to English.

Text: {}

Common languages: {}

Output ONLY this JSON format with NO extra text:
{{"detected_language": "code", "original_text": "text as given", "english_translation": "translation", "language_name": "name", "is_medicine_instruction": true/false, "dosage_info": "if any", "confidence": "high/medium/low"}}"#,
        to_json(text),
        known.join(", ")
    )
}

pub fn translation_validation(translation: &JsonMap) -> String {
    format!(
        r#"Review this medical translation for accuracy:

{}

Check for mistranslations and clarity. Output ONLY this JSON format with NO extra text:
{{"validation_status": "Valid/Needs Review", "accuracy_check": ["check1"], "potential_issues": ["issue1"], "clarified_meaning": "meaning", "patient_safe_version": "final translation"}}"#,
        to_json(translation)
    )
}

pub fn polypharmacy_safety(medicines: &[JsonMap]) -> String {
    format!(
        r#"You are a Clinical Safety Monitor specializing in polypharmacy. Review these medicines: {}

Check for: 1) Drug interactions, 2) Duplicate medications, 3) Dangerous combinations, 4) Safety warnings.

Output ONLY this JSON format with NO thinking or extra text:
{{"medicines_list": [{{"name": "med", "category": "class"}}], "drug_interactions": ["interaction: description"], "duplicate_medications": ["dup1"], "safety_warnings": ["warning1"], "recommendation": "action", "urgency": "Low/Medium/High"}}"#,
        to_json(medicines)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_catalog_covers_every_tab() {
        let catalog = PromptCatalog::builtin().unwrap();
        for tab in Tab::ALL {
            assert!(!catalog.vision_prompt(tab).is_empty(), "missing prompt for {}", tab);
        }
    }

    #[test]
    fn test_overrides_accept_legacy_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompts.json");
        std::fs::write(&path, r#"{"triage": {"qwen3_vl": "Read the slip."}}"#).unwrap();

        let catalog = PromptCatalog::load(Some(&path)).unwrap();
        assert_eq!(catalog.vision_prompt(Tab::Triage), "Read the slip.");
        // untouched tabs keep the built-in prompt
        assert!(catalog.vision_prompt(Tab::Reports).contains("lab report"));
    }

    #[test]
    fn test_load_missing_override_fails() {
        let dir = TempDir::new().unwrap();
        assert!(PromptCatalog::load(Some(&dir.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_combined_triage_embeds_both_inputs() {
        let vitals = json!({"spo2": "88%"}).as_object().cloned().unwrap();
        let physical = json!({"distress_level": "Severe"}).as_object().cloned().unwrap();
        let prompt = combined_triage(&vitals, &physical);
        assert!(prompt.contains(r#"VITALS DATA: {"spo2":"88%"}"#));
        assert!(prompt.contains(r#"PHYSICAL ASSESSMENT: {"distress_level":"Severe"}"#));
        assert!(prompt.contains(r#"{"priority": "RED or YELLOW or GREEN""#));
    }

    #[test]
    fn test_text_translation_escapes_input() {
        let mut languages = BTreeMap::new();
        languages.insert("hi".to_string(), "Hindi".to_string());
        let prompt = text_translation(r#"दिन में "दो" बार"#, &languages);
        assert!(prompt.contains(r#"Text: "दिन में \"दो\" बार""#));
        assert!(prompt.contains("Hindi (hi)"));
    }

    #[test]
    fn test_list_prompts_embed_arrays() {
        let meds = vec![json!({"name": "Aspirin"}).as_object().cloned().unwrap()];
        assert!(polypharmacy_safety(&meds).contains(r#"[{"name":"Aspirin"}]"#));
        assert!(lab_explanation(&[]).contains("Lab Results: []"));
    }
}
