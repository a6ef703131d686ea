//! Command-backed language model.
//!
//! Bridges the structured-call interface to an external model CLI: the
//! system prompt, user prompt, and result schema are passed as a JSON
//! document on stdin, and the command answers with the result JSON on
//! stdout. This keeps every provider detail outside the orchestrator.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use worldmind_core::llm::{LanguageModel, ToolSpec};

#[derive(Debug, Clone)]
pub struct CommandModel {
    command: String,
    args: Vec<String>,
}

impl CommandModel {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    async fn call(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn model command {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&payload)?;
            stdin
                .write_all(&body)
                .await
                .context("failed to write model request")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for model command")?;

        if !output.status.success() {
            bail!(
                "model command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        serde_json::from_slice(&output.stdout).context("model command returned invalid JSON")
    }
}

#[async_trait]
impl LanguageModel for CommandModel {
    async fn structured_call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        result_schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.call(serde_json::json!({
            "systemPrompt": system_prompt,
            "userPrompt": user_prompt,
            "resultSchema": result_schema,
        }))
        .await
    }

    async fn structured_call_with_tools(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        result_schema: &serde_json::Value,
        tools: &[ToolSpec],
    ) -> Result<serde_json::Value> {
        let tool_specs: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();

        self.call(serde_json::json!({
            "systemPrompt": system_prompt,
            "userPrompt": user_prompt,
            "resultSchema": result_schema,
            "tools": tool_specs,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let model = CommandModel::new("worldmind-model-that-does-not-exist", vec![]);
        let result = model
            .structured_call("sys", "user", &serde_json::json!({}))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cat_echoes_request_back() {
        // `cat` reflects the request JSON, which is itself valid JSON.
        let model = CommandModel::new("cat", vec![]);
        let result = model
            .structured_call("sys", "user", &serde_json::json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(result["systemPrompt"], "sys");
        assert_eq!(result["userPrompt"], "user");
    }
}
