//! Prompt builder: constructs the three model-agnostic prompt kinds the
//! planning engine and session synthesizer need. No model-specific tokens —
//! emphasis comes from ALL-CAPS directives and fenced code blocks, per
//! spec.md §4.4.

use serde::Serialize;
use serde_json::Value;

/// One entry in the capability catalogue handed to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityCatalogueEntry {
    /// Capability id, e.g. `weather.get`.
    pub capability: String,
    /// One-line description shown to the model.
    pub description: String,
    /// Example parameter shape for this capability.
    pub example_params: Value,
}

/// A single task result to fold into a synthesis prompt.
#[derive(Debug, Clone)]
pub struct TaskResultSummary {
    /// The capability that produced (or failed to produce) this result.
    pub capability: String,
    /// `Ok(payload)` on success, `Err(message)` if the task failed/timed out.
    pub outcome: Result<Value, String>,
}

/// Which of the three prompt shapes a [`Prompt`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Decompose a user query into a task plan.
    Planning,
    /// Compose a final answer from collected task results.
    Synthesis,
    /// Ask the model to correct its own malformed JSON output.
    Repair,
}

/// A prompt ready to hand to an [`crate::llm::LlmCompleter`], plus the model
/// parameters spec.md §4.4 recommends for its kind.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Which prompt shape this is.
    pub kind: PromptKind,
    /// The full prompt text.
    pub text: String,
    /// Recommended sampling temperature.
    pub temperature: f32,
    /// Recommended maximum tokens to generate.
    pub max_tokens: u32,
}

const PLAN_SCHEMA: &str = r#"[
  {
    "capability": "<capability id from the catalogue>",
    "agent": "<agent id healthy for that capability>",
    "params": { "...": "..." },
    "priority": <integer >= 1>,
    "dependencies": ["<capability id this task waits on>", "..."]
  }
]"#;

fn few_shot_examples() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "weather in Nice, Fr",
            r#"[{"capability":"weather.get","agent":"weather-agent-1","params":{"location":"Nice,FR"},"priority":1,"dependencies":[]}]"#,
        ),
        (
            "2-day trip to Tokyo next week",
            r#"[{"capability":"travel.plan","agent":"travel-agent-1","params":{"destination":"Tokyo,JP","days":2},"priority":1,"dependencies":[]},{"capability":"weather.get","agent":"weather-agent-1","params":{"location":"Tokyo,JP"},"priority":1,"dependencies":[]}]"#,
        ),
    ]
}

/// Build the planning prompt: system directive, capability catalogue,
/// few-shot examples, schema restatement, then the user query.
pub fn build_planning_prompt(query: &str, catalogue: &[CapabilityCatalogueEntry]) -> Prompt {
    let mut text = String::new();
    text.push_str("YOU ARE A PLANNER. RESPOND WITH JSON ONLY. Do not include prose before or after the JSON array.\n\n");

    text.push_str("## CAPABILITY CATALOGUE\n");
    for entry in catalogue {
        text.push_str(&format!(
            "- `{}`: {} (example params: {})\n",
            entry.capability, entry.description, entry.example_params
        ));
    }
    text.push('\n');

    text.push_str("## EXAMPLES\n");
    for (example_query, example_plan) in few_shot_examples() {
        text.push_str(&format!("Query: \"{example_query}\"\n```json\n{example_plan}\n```\n\n"));
    }

    text.push_str("## OUTPUT SCHEMA\nRespond with a JSON array matching exactly this shape:\n```json\n");
    text.push_str(PLAN_SCHEMA);
    text.push_str("\n```\n\n");

    text.push_str(&format!("## QUERY\n{query}\n"));

    Prompt { kind: PromptKind::Planning, text, temperature: 0.2, max_tokens: 1024 }
}

/// Build the synthesis prompt: original query plus labelled task results.
pub fn build_synthesis_prompt(query: &str, results: &[TaskResultSummary]) -> Prompt {
    let mut text = String::new();
    text.push_str("COMPOSE A CONCISE ANSWER in plain prose for the user below, using the task results provided. ");
    text.push_str("If a task failed or is missing, mention it briefly rather than inventing an answer for it.\n\n");
    text.push_str(&format!("## ORIGINAL QUERY\n{query}\n\n"));
    text.push_str("## TASK RESULTS\n");
    for result in results {
        match &result.outcome {
            Ok(payload) => {
                text.push_str(&format!("### {}\n```json\n{}\n```\n", result.capability, payload));
            }
            Err(reason) => {
                text.push_str(&format!("### {} — UNAVAILABLE ({reason})\n", result.capability));
            }
        }
    }
    Prompt { kind: PromptKind::Synthesis, text, temperature: 0.6, max_tokens: 512 }
}

/// Build a repair prompt citing the malformed output and the schema it must
/// conform to.
pub fn build_repair_prompt(malformed: &str, defect: &str) -> Prompt {
    let text = format!(
        "PRIOR OUTPUT WAS NOT VALID. REPLY ONLY WITH THE CORRECTED JSON, NO PROSE.\n\n\
         ## DEFECT\n{defect}\n\n\
         ## PRIOR OUTPUT\n```\n{malformed}\n```\n\n\
         ## REQUIRED SCHEMA\n```json\n{PLAN_SCHEMA}\n```\n"
    );
    Prompt { kind: PromptKind::Repair, text, temperature: 0.0, max_tokens: 1024 }
}

/// Issues found by [`validate_prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptIssue {
    /// The capability catalogue section is missing or empty.
    MissingCatalogue,
    /// No few-shot example was included.
    MissingExample,
    /// The output schema was not restated.
    MissingSchema,
}

/// A coverage check over a built prompt: does it actually contain the
/// sections §4.4 requires for its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptQuality {
    /// Fraction of required sections present, in `[0.0, 1.0]`.
    pub score: f32,
    /// Which required sections were missing.
    pub issues: Vec<PromptIssue>,
}

/// Assert minimum section coverage for a prompt of the given kind.
pub fn validate_prompt(kind: PromptKind, text: &str) -> PromptQuality {
    let mut issues = Vec::new();
    let mut checks = 0u32;
    let mut passed = 0u32;

    if kind == PromptKind::Planning {
        checks += 1;
        if text.contains("CAPABILITY CATALOGUE") {
            passed += 1;
        } else {
            issues.push(PromptIssue::MissingCatalogue);
        }

        checks += 1;
        if text.contains("```json") && text.contains("EXAMPLES") {
            passed += 1;
        } else {
            issues.push(PromptIssue::MissingExample);
        }
    }

    checks += 1;
    if text.contains("SCHEMA") {
        passed += 1;
    } else {
        issues.push(PromptIssue::MissingSchema);
    }

    let score = if checks == 0 { 1.0 } else { passed as f32 / checks as f32 };
    PromptQuality { score, issues }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> Vec<CapabilityCatalogueEntry> {
        vec![CapabilityCatalogueEntry {
            capability: "weather.get".to_string(),
            description: "current weather for a location".to_string(),
            example_params: serde_json::json!({"location": "Nice,FR"}),
        }]
    }

    #[test]
    fn planning_prompt_has_low_temperature_and_all_sections() {
        let prompt = build_planning_prompt("weather in nice", &catalogue());
        assert!(prompt.temperature <= 0.2);
        let quality = validate_prompt(PromptKind::Planning, &prompt.text);
        assert_eq!(quality.score, 1.0);
        assert!(quality.issues.is_empty());
    }

    #[test]
    fn repair_prompt_has_zero_temperature() {
        let prompt = build_repair_prompt("not json", "expected a JSON array");
        assert_eq!(prompt.temperature, 0.0);
        assert!(prompt.text.contains("not json"));
    }

    #[test]
    fn synthesis_prompt_marks_missing_tasks() {
        let results = vec![TaskResultSummary {
            capability: "weather.get".to_string(),
            outcome: Err("timed out".to_string()),
        }];
        let prompt = build_synthesis_prompt("2-day trip to tokyo", &results);
        assert!(prompt.text.contains("UNAVAILABLE"));
    }

    #[test]
    fn validate_prompt_flags_missing_catalogue() {
        let quality = validate_prompt(PromptKind::Planning, "no sections here");
        assert!(quality.issues.contains(&PromptIssue::MissingCatalogue));
        assert!(quality.score < 1.0);
    }
}
