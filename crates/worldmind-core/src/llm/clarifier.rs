//! Clarifying-question generation.
//!
//! Runs between classification and spec generation. An empty question list
//! means the request is unambiguous and the pipeline moves straight on to
//! the specification.

use anyhow::{Context, Result};
use serde::Deserialize;

use worldmind_store::models::Classification;

use super::{LanguageModel, call_typed};

const SYSTEM_PROMPT: &str = "\
You prepare an engineering request for specification. If the request is \
ambiguous in a way that would change the produced code (missing endpoint \
shapes, unstated compatibility constraints, unclear scope), ask up to \
three short clarifying questions. If the request is actionable as stated, \
return an empty list. Never ask about preferences that do not change the \
code.";

fn result_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["questions"],
        "properties": {
            "questions": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": 3
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct QuestionsWire {
    questions: Vec<String>,
}

/// Generate clarifying questions for a request, or an empty list when the
/// request needs none.
pub async fn clarifying_questions(
    model: &dyn LanguageModel,
    request: &str,
    classification: &Classification,
) -> Result<Vec<String>> {
    let user_prompt = format!(
        "Request: {request}\n\nClassification: {} (complexity {}), components: {}",
        classification.category,
        classification.complexity,
        classification.affected_components.join(", "),
    );

    let wire: QuestionsWire = call_typed(model, SYSTEM_PROMPT, &user_prompt, &result_schema())
        .await
        .context("clarifier call failed")?;

    Ok(wire.questions)
}
