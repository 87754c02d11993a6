use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Decision, DecisionOutcome, DecisionProvider};
use crate::engine::types::ExecutionState;

const SYSTEM_INSTRUCTION: &str = "You are the router of a campaign optimization agent. \
Decide what the agent should do next for this project.\n\
Decision types:\n\
- \"initialize\": no project exists yet; collect data, build strategy and campaign setup.\n\
- \"reflect\": the project exists and experiment results were uploaded; analyse and optimise.\n\
- \"enrich\": the project exists and additional context data was uploaded; fold it into the strategy.\n\
- \"continue\": the project exists but the current phase is unfinished; continue from there.\n\
Be decisive and answer only with JSON.";

/// Settings for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f64,
    pub timeout_s: f64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.3,
            timeout_s: 60.0,
        }
    }
}

/// Asks a chat model for the routing decision.
pub struct LlmDecisionProvider {
    settings: LlmSettings,
    client: reqwest::Client,
}

impl LlmDecisionProvider {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(
                Duration::try_from_secs_f64(settings.timeout_s)
                    .context("Invalid LLM timeout_s")?,
            )
            .build()?;
        Ok(Self { settings, client })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Ok(key) = std::env::var(&self.settings.api_key_env) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))?,
            );
        }
        Ok(headers)
    }
}

/// Render the project state the way the router prompt expects it.
pub fn build_prompt(state: &ExecutionState) -> String {
    let files = state
        .field("file_analyses")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|fa| {
                    format!(
                        "- File: {}\n  Type: {}\n  Rows: {}\n  Columns: {}",
                        fa.get("file_name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        fa.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        fa.get("row_count").and_then(|v| v.as_u64()).unwrap_or(0),
                        fa.get("columns").cloned().unwrap_or(Value::Array(Vec::new())),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "No files analyzed yet".to_string());

    let experiments = state
        .field("experiment_results")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);

    format!(
        "PROJECT STATE:\n\
         - Session: {}\n\
         - Current phase: {}\n\
         - Iteration: {}\n\
         - Has strategy: {}\n\
         - Has config: {}\n\
         - Previous experiments: {}\n\n\
         UPLOADED FILES:\n{}\n\n\
         Respond with JSON in this exact format:\n\
         {{\"decision\": \"initialize\" | \"reflect\" | \"enrich\" | \"continue\", \"reasoning\": \"...\"}}",
        state.session_num,
        state.field_str("current_phase").unwrap_or("unknown"),
        state.field("iteration").and_then(|v| v.as_u64()).unwrap_or(0),
        state.field("current_strategy").is_some(),
        state.field("current_config").is_some(),
        experiments,
        files,
    )
}

/// First choice's message content from a chat completions response.
fn extract_chat_reply(data: &Value) -> Option<String> {
    let first = data.get("choices")?.as_array()?.first()?;
    first
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| first.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

/// Parse the model's JSON answer, tolerating markdown code fences.
pub fn parse_reply(text: &str) -> Result<DecisionOutcome> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let parsed: Value =
        serde_json::from_str(body).with_context(|| format!("router reply is not JSON: {}", body))?;

    let label = parsed
        .get("decision")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("router reply has no 'decision' field"))?;
    let reasoning = parsed
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(DecisionOutcome {
        decision: Decision::parse(label),
        reasoning,
    })
}

#[async_trait]
impl DecisionProvider for LlmDecisionProvider {
    fn name(&self) -> &str {
        "llm"
    }

    async fn decide(&self, state: &ExecutionState) -> Result<DecisionOutcome> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_INSTRUCTION },
                { "role": "user", "content": build_prompt(state) },
            ],
        });

        debug!(url = %url, model = %self.settings.model, "Requesting routing decision");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("router: request failed: {}", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("router: failed to read response body: {}", e))?;

        if !status.is_success() {
            anyhow::bail!("router: request to {} returned {}: {}", url, status, text);
        }

        let data: Value = serde_json::from_str(&text).context("router: response is not JSON")?;
        let reply = extract_chat_reply(&data)
            .ok_or_else(|| anyhow::anyhow!("router: response has no message content"))?;

        parse_reply(&reply)
    }
}
