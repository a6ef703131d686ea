//! Product-specification generation.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use worldmind_store::models::{Classification, ProductSpec};

use super::{LanguageModel, call_typed};

const SYSTEM_PROMPT: &str = "\
You write the product specification an implementation team will build \
from. Produce a concise title, a one-paragraph overview, and concrete \
lists of goals, non-goals, technical requirements, edge cases, acceptance \
criteria, and affected components. Every acceptance criterion must be \
observable from the outside of the system. Incorporate the user's answers \
to clarifying questions verbatim where they resolve an ambiguity.";

fn result_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": [
            "title", "overview", "goals", "nonGoals",
            "technicalRequirements", "edgeCases", "acceptanceCriteria", "components"
        ],
        "properties": {
            "title": { "type": "string" },
            "overview": { "type": "string" },
            "goals": { "type": "array", "items": { "type": "string" } },
            "nonGoals": { "type": "array", "items": { "type": "string" } },
            "technicalRequirements": { "type": "array", "items": { "type": "string" } },
            "edgeCases": { "type": "array", "items": { "type": "string" } },
            "acceptanceCriteria": { "type": "array", "items": { "type": "string" } },
            "components": { "type": "array", "items": { "type": "string" } }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecWire {
    title: String,
    overview: String,
    goals: Vec<String>,
    non_goals: Vec<String>,
    technical_requirements: Vec<String>,
    edge_cases: Vec<String>,
    acceptance_criteria: Vec<String>,
    components: Vec<String>,
}

/// Generate the product specification for a request.
pub async fn generate_spec(
    model: &dyn LanguageModel,
    request: &str,
    classification: &Classification,
    project_context: Option<&str>,
    answers: &BTreeMap<String, String>,
) -> Result<ProductSpec> {
    let mut user_prompt = format!(
        "Request: {request}\n\nCategory: {} (complexity {})\n",
        classification.category, classification.complexity,
    );
    if let Some(ctx) = project_context {
        user_prompt.push_str("\nProject context:\n");
        user_prompt.push_str(ctx);
        user_prompt.push('\n');
    }
    if !answers.is_empty() {
        user_prompt.push_str("\nClarification answers:\n");
        for (question, answer) in answers {
            user_prompt.push_str(&format!("- {question}: {answer}\n"));
        }
    }

    let wire: SpecWire = call_typed(model, SYSTEM_PROMPT, &user_prompt, &result_schema())
        .await
        .context("spec generator call failed")?;

    Ok(ProductSpec {
        title: wire.title,
        overview: wire.overview,
        goals: wire.goals,
        non_goals: wire.non_goals,
        technical_requirements: wire.technical_requirements,
        edge_cases: wire.edge_cases,
        acceptance_criteria: wire.acceptance_criteria,
        components: wire.components,
    })
}

/// Render the specification as markdown.
pub fn render_spec_markdown(spec: &ProductSpec) -> String {
    let section = |title: &str, items: &[String]| -> String {
        if items.is_empty() {
            return String::new();
        }
        let mut out = format!("\n## {title}\n\n");
        for item in items {
            out.push_str(&format!("- {item}\n"));
        }
        out
    };

    let mut md = format!("# {}\n\n{}\n", spec.title, spec.overview);
    md.push_str(&section("Goals", &spec.goals));
    md.push_str(&section("Non-goals", &spec.non_goals));
    md.push_str(&section("Technical Requirements", &spec.technical_requirements));
    md.push_str(&section("Edge Cases", &spec.edge_cases));
    md.push_str(&section("Acceptance Criteria", &spec.acceptance_criteria));
    md.push_str(&section("Components", &spec.components));
    md
}

/// Persist the spec to `<project>/docs/SPEC.md`. Best-effort: failures are
/// logged and never fail the stage.
pub async fn write_spec_markdown(spec: &ProductSpec, project_path: &Path) {
    let docs_dir = project_path.join("docs");
    if let Err(e) = tokio::fs::create_dir_all(&docs_dir).await {
        tracing::warn!(error = %e, "could not create docs directory for spec");
        return;
    }
    let path = docs_dir.join("SPEC.md");
    if let Err(e) = tokio::fs::write(&path, render_spec_markdown(spec)).await {
        tracing::warn!(path = %path.display(), error = %e, "could not write spec markdown");
    }
}
