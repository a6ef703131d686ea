//! Request classification.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use worldmind_store::models::{Classification, PlanningStrategy, RequestCategory};

use super::{LanguageModel, call_typed};

const SYSTEM_PROMPT: &str = "\
You are the intake classifier for an engineering-mission orchestrator. \
Classify the user's request so the planner can choose a strategy. \
Categories: feature, bug_fix, refactor, documentation, infrastructure, deployment. \
Complexity is 1 (trivial, one file) to 5 (cross-cutting, many components). \
Name the components of the codebase the request touches. \
Recommend a planning strategy: sequential for tightly coupled changes, \
parallel for independent ones, adaptive when unsure. \
If the request implies a specific runtime (for example a JVM version or a \
node toolchain), set runtime_tag, else leave it null.";

fn result_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["category", "complexity", "affectedComponents", "planningStrategy"],
        "properties": {
            "category": { "type": "string", "enum": [
                "feature", "bug_fix", "refactor", "documentation",
                "infrastructure", "deployment"
            ]},
            "complexity": { "type": "integer", "minimum": 1, "maximum": 5 },
            "affectedComponents": { "type": "array", "items": { "type": "string" } },
            "planningStrategy": { "type": "string", "enum": ["sequential", "parallel", "adaptive"] },
            "runtimeTag": { "type": ["string", "null"] }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassificationWire {
    category: String,
    complexity: u8,
    affected_components: Vec<String>,
    planning_strategy: String,
    #[serde(default)]
    runtime_tag: Option<String>,
}

/// Classify a request. Raises on LLM failure or an out-of-set answer; the
/// driver treats that as an LLM error and fails the mission.
pub async fn classify(model: &dyn LanguageModel, request: &str) -> Result<Classification> {
    let wire: ClassificationWire = call_typed(model, SYSTEM_PROMPT, request, &result_schema())
        .await
        .context("classifier call failed")?;

    let category = parse_category(&wire.category)?;
    let planning_strategy = parse_strategy(&wire.planning_strategy)?;

    Ok(Classification {
        category,
        complexity: wire.complexity.clamp(1, 5),
        affected_components: wire.affected_components,
        planning_strategy,
        runtime_tag: wire.runtime_tag,
    })
}

fn parse_category(s: &str) -> Result<RequestCategory> {
    Ok(match s {
        "feature" => RequestCategory::Feature,
        "bug_fix" => RequestCategory::BugFix,
        "refactor" => RequestCategory::Refactor,
        "documentation" => RequestCategory::Documentation,
        "infrastructure" => RequestCategory::Infrastructure,
        "deployment" => RequestCategory::Deployment,
        other => bail!("classifier returned unknown category {other:?}"),
    })
}

fn parse_strategy(s: &str) -> Result<PlanningStrategy> {
    Ok(match s {
        "sequential" => PlanningStrategy::Sequential,
        "parallel" => PlanningStrategy::Parallel,
        "adaptive" => PlanningStrategy::Adaptive,
        other => bail!("classifier returned unknown planning strategy {other:?}"),
    })
}
