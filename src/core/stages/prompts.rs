//! Prompt templates for each stage's generation call.

use serde_json::Value;

use crate::adapters::GenerationRequest;
use crate::domain::StageName;

const SYSTEM: &str = "You are a pragmatic product and engineering lead. \
Respond with a single JSON object and nothing else.";

const FEASIBILITY_SHAPE: &str = r#"{
  "schema_version": "v1",
  "idea": {"title": "short title", "one_liner": "one sentence"},
  "verdict": "go | revise | no_go",
  "confidence": 0.0,
  "summary": "at least two sentences",
  "key_assumptions": ["..."],
  "risks": [
    {"risk": "...", "likelihood": "low|medium|high", "impact": "low|medium|high", "mitigation": "..."}
  ],
  "unknowns": ["..."],
  "suggested_stack": {"frontend": "...", "backend": "...", "data": "...", "infra": "..."},
  "estimates": {"mvp_weeks": 8, "team_size": 3},
  "recommended_next_steps": ["..."]
}"#;

const PLAN_SHAPE: &str = r#"{
  "schema_version": "v1",
  "timeline_weeks": 8,
  "phases": [
    {"name": "...", "duration_weeks": 2, "objectives": ["..."], "deliverables": ["..."], "success_criteria": ["..."]}
  ],
  "components": [
    {"name": "...", "purpose": "...", "complexity": "low|medium|high", "dependencies": ["..."], "build_notes": ["..."]}
  ],
  "roles": [{"role": "...", "responsibilities": ["..."]}],
  "milestones": [{"milestone": "...", "week": 2, "acceptance_criteria": ["..."]}],
  "open_questions": ["..."],
  "immediate_next_actions": ["..."]
}"#;

fn request(stage: StageName, prompt: String, max_tokens: u32) -> GenerationRequest {
    GenerationRequest {
        stage,
        system: SYSTEM.to_string(),
        prompt,
        max_tokens,
    }
}

pub fn feasibility(idea: &str, max_tokens: u32) -> GenerationRequest {
    let prompt = format!(
        "Assess the feasibility of this project idea.\n\n\
         IDEA: {idea}\n\n\
         Return ONLY valid JSON with this shape:\n{FEASIBILITY_SHAPE}\n\n\
         Requirements:\n\
         - At least 5 risks, each with a concrete mitigation\n\
         - confidence is a number between 0 and 1\n\
         - Be honest: use no_go when the idea is not viable"
    );
    request(StageName::Feasibility, prompt, max_tokens)
}

pub fn planning(idea: &str, feasibility: &Value, max_tokens: u32) -> GenerationRequest {
    let verdict = feasibility
        .get("verdict")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let mvp_weeks = feasibility
        .pointer("/estimates/mvp_weeks")
        .and_then(Value::as_f64)
        .unwrap_or(10.0);
    let stack = feasibility
        .get("suggested_stack")
        .map(Value::to_string)
        .unwrap_or_else(|| "standard web stack".to_string());

    let prompt = format!(
        "Produce an execution plan for this project.\n\n\
         IDEA: {idea}\n\
         FEASIBILITY VERDICT: {verdict}\n\
         ESTIMATED MVP WEEKS: {mvp_weeks}\n\
         TECHNOLOGY STACK: {stack}\n\n\
         Return ONLY valid JSON with this shape:\n{PLAN_SHAPE}\n\n\
         Requirements:\n\
         - At least 4 phases; timeline_weeks is the sum of their duration_weeks\n\
         - At least 5 milestones with numeric weeks\n\
         - At least 7 immediate next actions, each doable within a day"
    );
    request(StageName::Planning, prompt, max_tokens)
}

pub fn execution(plan: &Value, max_tokens: u32) -> GenerationRequest {
    let phases: Vec<&str> = plan
        .get("phases")
        .and_then(Value::as_array)
        .map(|phases| {
            phases
                .iter()
                .filter_map(|p| p.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let actions = plan
        .get("immediate_next_actions")
        .map(Value::to_string)
        .unwrap_or_else(|| "[]".to_string());

    let prompt = format!(
        "Write a kickoff brief for executing this plan.\n\n\
         PHASES: {}\n\
         NEXT ACTIONS: {actions}\n\n\
         Return ONLY valid JSON:\n\
         {{\"notes\": [\"short, concrete kickoff notes\"]}}",
        phases.join(", ")
    );
    request(StageName::Execution, prompt, max_tokens)
}
