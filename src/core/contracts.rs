//! Artifact contracts: structural validation and fallback generation.
//!
//! Validation is purely structural. It never judges content quality, but it
//! does repair a few lenient fields in place (`confidence` is clamped,
//! `timeline_weeks` is recomputed) so callers always persist the repaired
//! value.

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::domain::ArtifactType;

/// Default plan length when phases carry no durations
pub const DEFAULT_TIMELINE_WEEKS: u64 = 8;

const MIN_SUMMARY_CHARS: usize = 20;
const MIN_RISKS: usize = 5;
const MIN_PHASES: usize = 4;
const MIN_MILESTONES: usize = 5;
const MIN_NEXT_ACTIONS: usize = 7;
const LEVELS: [&str; 3] = ["low", "medium", "high"];
const VERDICTS: [&str; 3] = ["go", "revise", "no_go"];

/// Errors extracting a JSON document from generated text
#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("No JSON object found in generated text")]
    NoJsonObject,

    #[error("Malformed JSON in generated text: {0}")]
    Malformed(String),
}

/// Outcome of validating one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }
}

/// Validate an artifact against the contract for its type.
///
/// Types without a contract always pass.
pub fn validate(artifact_type: ArtifactType, artifact: &mut Value) -> ValidationReport {
    match artifact_type {
        ArtifactType::FeasibilityAnalysisV1 => validate_feasibility(artifact),
        ArtifactType::ExecutionPlanV1 => validate_plan(artifact),
        ArtifactType::ExecutionLog | ArtifactType::ExecutionResult => {
            ValidationReport::from_errors(Vec::new())
        }
    }
}

/// Clamp a number into `[0, 1]`; NaN becomes 0
pub fn clamp01(n: f64) -> f64 {
    if n.is_nan() {
        return 0.0;
    }
    n.clamp(0.0, 1.0)
}

/// Validate a `feasibility_analysis_v1` artifact, clamping `confidence` in place
pub fn validate_feasibility(a: &mut Value) -> ValidationReport {
    let mut errors = Vec::new();

    if a.get("schema_version").and_then(Value::as_str) != Some("v1") {
        errors.push(r#"schema_version must be "v1""#.to_string());
    }

    let verdict = a.get("verdict").and_then(Value::as_str);
    if !verdict.is_some_and(|v| VERDICTS.contains(&v)) {
        errors.push(r#"verdict must be "go", "revise", or "no_go""#.to_string());
    }

    match a.get("confidence").and_then(Value::as_f64) {
        Some(confidence) => {
            if let Some(obj) = a.as_object_mut() {
                obj.insert("confidence".to_string(), json!(clamp01(confidence)));
            }
        }
        None => errors.push("confidence must be a number (0-1)".to_string()),
    }

    let summary_ok = a
        .get("summary")
        .and_then(Value::as_str)
        .is_some_and(|s| s.chars().count() >= MIN_SUMMARY_CHARS);
    if !summary_ok {
        errors.push(format!(
            "summary must be a string with at least {} characters",
            MIN_SUMMARY_CHARS
        ));
    }

    match a.get("risks").and_then(Value::as_array) {
        Some(risks) if risks.len() >= MIN_RISKS => {
            for (i, risk) in risks.iter().enumerate() {
                if !risk_is_complete(risk) {
                    errors.push(format!(
                        "risks[{}] missing required fields (risk, likelihood, impact, mitigation)",
                        i
                    ));
                }
            }
        }
        _ => errors.push(format!(
            "risks must be an array with at least {} items",
            MIN_RISKS
        )),
    }

    for field in ["key_assumptions", "unknowns", "recommended_next_steps"] {
        if !a.get(field).is_some_and(Value::is_array) {
            errors.push(format!("{} must be an array", field));
        }
    }

    for field in ["suggested_stack", "estimates"] {
        if !a.get(field).is_some_and(Value::is_object) {
            errors.push(format!("{} must be an object", field));
        }
    }

    ValidationReport::from_errors(errors)
}

fn risk_is_complete(risk: &Value) -> bool {
    let non_empty = |field: &str| {
        risk.get(field)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    };
    let level = |field: &str| {
        risk.get(field)
            .and_then(Value::as_str)
            .is_some_and(|s| LEVELS.contains(&s))
    };

    non_empty("risk") && non_empty("mitigation") && level("likelihood") && level("impact")
}

/// Validate an `execution_plan_v1` artifact, repairing `timeline_weeks` in place
pub fn validate_plan(p: &mut Value) -> ValidationReport {
    let mut errors = Vec::new();

    if p.get("schema_version").and_then(Value::as_str) != Some("v1") {
        errors.push(r#"schema_version must be "v1""#.to_string());
    }

    match p.get("phases").and_then(Value::as_array) {
        Some(phases) if phases.len() >= MIN_PHASES => {
            for (i, phase) in phases.iter().enumerate() {
                let named = phase
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty());
                let objectives = phase.get("objectives").is_some_and(Value::is_array);
                let deliverables = phase.get("deliverables").is_some_and(Value::is_array);
                if !(named && objectives && deliverables) {
                    errors.push(format!(
                        "phases[{}] missing required fields (name, objectives, deliverables)",
                        i
                    ));
                }
            }
        }
        _ => errors.push(format!(
            "phases must be an array with at least {} items (Discovery, Build, Test, Launch)",
            MIN_PHASES
        )),
    }

    match p.get("milestones").and_then(Value::as_array) {
        Some(milestones) if milestones.len() >= MIN_MILESTONES => {
            for (i, milestone) in milestones.iter().enumerate() {
                let named = milestone
                    .get("milestone")
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty());
                let week = milestone.get("week").is_some_and(Value::is_number);
                if !(named && week) {
                    errors.push(format!(
                        "milestones[{}] missing required fields (milestone, week)",
                        i
                    ));
                }
            }
        }
        _ => errors.push(format!(
            "milestones must be an array with at least {} items",
            MIN_MILESTONES
        )),
    }

    for field in ["components", "roles"] {
        if !p.get(field).is_some_and(Value::is_array) {
            errors.push(format!("{} must be an array", field));
        }
    }

    let actions = p
        .get("immediate_next_actions")
        .and_then(Value::as_array)
        .map(Vec::len);
    if !actions.is_some_and(|n| n >= MIN_NEXT_ACTIONS) {
        errors.push(format!(
            "immediate_next_actions must be an array with at least {} items",
            MIN_NEXT_ACTIONS
        ));
    }

    repair_timeline(p);

    ValidationReport::from_errors(errors)
}

/// Sum of phase durations; durations that are not numbers count as zero
pub fn phase_weeks(p: &Value) -> f64 {
    p.get("phases")
        .and_then(Value::as_array)
        .map(|phases| {
            phases
                .iter()
                .filter_map(|phase| phase.get("duration_weeks").and_then(weeks))
                .sum()
        })
        .unwrap_or(0.0)
}

/// A week count given as a JSON number or a numeric string such as `"6"`
pub fn weeks(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn repair_timeline(p: &mut Value) {
    let phase_sum = phase_weeks(p);
    let current = p.get("timeline_weeks").and_then(weeks);

    let Some(obj) = p.as_object_mut() else {
        return;
    };

    match current {
        Some(weeks) if weeks > 0.0 => {
            if phase_sum > 0.0 && (weeks - phase_sum).abs() > 1.0 {
                warn!(
                    timeline_weeks = weeks,
                    phase_sum, "timeline_weeks does not match phase durations"
                );
            }
        }
        _ => {
            let repaired = if phase_sum > 0.0 {
                number(phase_sum)
            } else {
                json!(DEFAULT_TIMELINE_WEEKS)
            };
            obj.insert("timeline_weeks".to_string(), repaired);
        }
    }
}

/// Whole numbers stay integers in the stored JSON
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n <= u64::MAX as f64 {
        json!(n as u64)
    } else {
        json!(n)
    }
}

/// Pull the outermost `{...}` object out of free-form generated text
pub fn extract_json(raw: &str) -> Result<Value, ContractError> {
    let start = raw.find('{').ok_or(ContractError::NoJsonObject)?;
    let end = raw.rfind('}').ok_or(ContractError::NoJsonObject)?;
    if end < start {
        return Err(ContractError::NoJsonObject);
    }

    let value: Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| ContractError::Malformed(e.to_string()))?;

    if value.is_object() {
        Ok(value)
    } else {
        Err(ContractError::NoJsonObject)
    }
}

fn risk(risk: &str, likelihood: &str, impact: &str, mitigation: &str) -> Value {
    json!({
        "risk": risk,
        "likelihood": likelihood,
        "impact": impact,
        "mitigation": mitigation,
    })
}

/// Schema-valid feasibility artifact used when generation or validation fails
pub fn feasibility_fallback(
    project_id: Uuid,
    idea_id: Uuid,
    idea_text: &str,
    errors: &[String],
) -> Value {
    let one_liner: String = idea_text.chars().take(160).collect();

    json!({
        "schema_version": "v1",
        "idea": {
            "project_id": project_id.to_string(),
            "idea_id": idea_id.to_string(),
            "title": "Validation Fallback",
            "one_liner": one_liner,
        },
        "verdict": "revise",
        "confidence": 0.4,
        "summary": "Feasibility artifact failed validation. System generated a fallback. See unknowns for validation errors.",
        "key_assumptions": [],
        "risks": [
            risk("Artifact validation failure", "high", "medium", "Fix generator to include all required fields"),
            risk("Missing or incomplete risks list", "high", "medium", "Ensure at least 5 risks are generated"),
            risk("Incomplete idea parsing", "medium", "medium", "Improve title and one-liner extraction from idea text"),
            risk("Downstream planning blocked", "medium", "high", "Planning should handle incomplete feasibility gracefully"),
            risk("Report quality degraded", "high", "low", "Renderer should clearly show validation errors"),
        ],
        "unknowns": [format!("Validation errors: {}", errors.join("; "))],
        "recommended_next_steps": [
            "Fix feasibility generator to satisfy schema v1 requirements",
            "Ensure all required fields are present",
            "Run validation before persisting artifacts",
            "Add logging to debug generation failures",
            "Test with various idea formats",
        ],
        "suggested_stack": {
            "frontend": [],
            "backend": [],
            "data": [],
            "ai": [],
            "infra": [],
        },
        "estimates": {
            "mvp_weeks": 8,
            "team_size": "solo",
            "cost_band": "low",
        },
    })
}

fn phase(name: &str, weeks: u64, objective: &str, deliverable: &str, criterion: &str) -> Value {
    json!({
        "name": name,
        "duration_weeks": weeks,
        "objectives": [objective],
        "deliverables": [deliverable],
        "success_criteria": [criterion],
    })
}

fn milestone(name: &str, week: u64, criterion: &str) -> Value {
    json!({
        "milestone": name,
        "week": week,
        "acceptance_criteria": [criterion],
    })
}

/// Schema-valid execution plan used when generation or validation fails
pub fn plan_fallback(project_id: Uuid, errors: &[String]) -> Value {
    let mut open_questions = vec![json!(
        "Complete feasibility analysis before detailed planning"
    )];
    if !errors.is_empty() {
        open_questions.push(json!(format!("Validation errors: {}", errors.join("; "))));
    }

    let mut plan = Map::new();
    plan.insert("schema_version".into(), json!("v1"));
    plan.insert("project_id".into(), json!(project_id.to_string()));
    plan.insert("timeline_weeks".into(), json!(DEFAULT_TIMELINE_WEEKS));
    plan.insert(
        "phases".into(),
        json!([
            phase("Discovery & Requirements", 2, "Understand requirements", "Requirements document", "Stakeholder approval"),
            phase("Build", 4, "Implement core features", "Working prototype", "Core features functional"),
            phase("Test & Refine", 1, "QA and bug fixes", "Test report", "Critical bugs resolved"),
            phase("Launch", 1, "Deploy to production", "Launch checklist", "Live and stable"),
        ]),
    );
    plan.insert(
        "components".into(),
        json!([{
            "name": "Core System",
            "purpose": "Main application logic",
            "complexity": "medium",
            "dependencies": [],
            "build_notes": ["TBD"],
        }]),
    );
    plan.insert(
        "roles".into(),
        json!([
            { "role": "Product Manager", "responsibilities": ["Define requirements", "Track progress"] },
            { "role": "Engineer", "responsibilities": ["Build and test", "Deploy"] },
        ]),
    );
    plan.insert(
        "milestones".into(),
        json!([
            milestone("Discovery Complete", 2, "Requirements approved"),
            milestone("Core Features Done", 6, "MVP features working"),
            milestone("Testing Complete", 7, "Critical bugs fixed"),
            milestone("Launch", 8, "System live"),
            milestone("Mid-Point Review", 4, "Progress on track"),
        ]),
    );
    plan.insert("open_questions".into(), Value::Array(open_questions));
    plan.insert(
        "immediate_next_actions".into(),
        json!([
            "Complete feasibility analysis",
            "Gather stakeholder requirements",
            "Define success metrics",
            "Identify resource constraints",
            "Create detailed timeline",
            "Assign team roles",
            "Schedule kickoff meeting",
        ]),
    );

    Value::Object(plan)
}
