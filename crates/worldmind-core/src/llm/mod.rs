//! The LLM structured-call interface.
//!
//! The orchestrator never talks to a model provider directly; the
//! classifier, clarifier, spec generator, planner, and post-mission stage
//! all go through this trait. The trait is object-safe so it can be stored
//! as `Arc<dyn LanguageModel>` in the pipeline wiring.

pub mod classifier;
pub mod clarifier;
pub mod planner;
pub mod spec_gen;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A tool made available to a structured call.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Structured-call interface to a language model.
///
/// Both operations return a JSON value conforming to `result_schema`; the
/// provider is responsible for constraining the model to the schema.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn structured_call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        result_schema: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    async fn structured_call_with_tools(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        result_schema: &serde_json::Value,
        tools: &[ToolSpec],
    ) -> Result<serde_json::Value>;
}

// Compile-time assertion: LanguageModel must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn LanguageModel) {}
};

/// Make a structured call and deserialize the result into `T`.
pub async fn call_typed<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    system_prompt: &str,
    user_prompt: &str,
    result_schema: &serde_json::Value,
) -> Result<T> {
    let value = model
        .structured_call(system_prompt, user_prompt, result_schema)
        .await?;
    serde_json::from_value(value).context("structured call returned a non-conforming result")
}

/// Make a structured call with tools available and deserialize the result
/// into `T`.
pub async fn call_typed_with_tools<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    system_prompt: &str,
    user_prompt: &str,
    result_schema: &serde_json::Value,
    tools: &[ToolSpec],
) -> Result<T> {
    let value = model
        .structured_call_with_tools(system_prompt, user_prompt, result_schema, tools)
        .await?;
    serde_json::from_value(value).context("structured call returned a non-conforming result")
}
