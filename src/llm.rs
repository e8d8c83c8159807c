use crate::config::LLMConfig;
use crate::error::DispatchError;
use crate::sharding::Shard;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// What the reasoning service is asked to look for in a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Alarm,
    Safety,
    Logic,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Alarm => "alarm",
            AnalysisKind::Safety => "safety",
            AnalysisKind::Logic => "logic",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Raw answer of the reasoning service for one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// One call per shard to an external reasoning service.
///
/// Implementations report transport and protocol problems as [`DispatchError`];
/// shard-level retry is layered on top by the dispatcher.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn analyze(&self, shard: &Shard, kind: AnalysisKind) -> Result<ServiceReply, DispatchError>;
}

/// Client for OpenAI-compatible chat completion endpoints (DeepSeek by default).
pub struct DeepSeekClient {
    config: LLMConfig,
    client: Client,
    prompts: PromptBuilder,
}

impl DeepSeekClient {
    pub fn new(config: LLMConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            client,
            prompts: PromptBuilder,
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> DispatchError {
        if err.is_timeout() {
            DispatchError::Timeout(self.config.timeout_seconds)
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl ReasoningClient for DeepSeekClient {
    async fn analyze(&self, shard: &Shard, kind: AnalysisKind) -> Result<ServiceReply, DispatchError> {
        let api_key = self.config.api_key.as_ref().ok_or(DispatchError::MissingApiKey)?;
        let prompt = self.prompts.build(shard, kind);

        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature
        });

        debug!("Sending shard {} to {} ({} prompt chars)", shard.id, self.config.model, prompt.len());
        trace!("Prompt for {}: {}", shard.id, prompt);

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                DispatchError::RateLimited(error_text)
            } else {
                DispatchError::Api {
                    status: status.as_u16(),
                    message: error_text,
                }
            });
        }

        let response_json: serde_json::Value =
            response.json().await.map_err(|e| self.map_transport_error(e))?;
        trace!("Raw response for {}: {}", shard.id, response_json);

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| DispatchError::InvalidResponse("missing choices[0].message.content".to_string()))?;

        let usage = serde_json::from_value::<TokenUsage>(response_json["usage"].clone()).ok();

        Ok(ServiceReply {
            content: content.to_string(),
            usage,
        })
    }
}

/// Renders the analysis prompt for a shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(&self, shard: &Shard, kind: AnalysisKind) -> String {
        let mut prompt = String::new();

        prompt.push_str(self.system_prompt(kind));
        prompt.push_str("\n\n## Context\n");
        prompt.push_str(&self.format_context(shard));
        prompt.push_str("\n## Examples\n");
        prompt.push_str(self.few_shot_examples(kind));
        prompt.push_str("\n\n## PLC code to analyze\n");
        prompt.push_str(&self.format_entities(shard));
        prompt.push_str("\n## Output format\n");
        prompt.push_str(&format!(
            r#"Respond with JSON only, using this structure:
{{
    "analysis_type": "{kind}",
    "findings": [
        {{
            "type": "missing_alarm|existing_alarm|safety_issue|logic_error",
            "severity": "critical|high|medium|low",
            "location": "where in the code",
            "description": "what was found",
            "recommendation": "how to improve it",
            "confidence": 0.0
        }}
    ],
    "summary": "overall assessment of this fragment",
    "confidence_score": 0.0
}}"#
        ));

        prompt
    }

    fn system_prompt(&self, kind: AnalysisKind) -> &'static str {
        match kind {
            AnalysisKind::Alarm => {
                "You are a senior PLC engineer and industrial automation expert reviewing the alarm system of a PLC program.

Your tasks:
1. Identify existing alarm configuration and logic
2. Find missing critical alarms
3. Assess whether alarms are reasonable and complete
4. Recommend improvements

Focus on safety alarms (emergency stop, safety doors, light curtains), process alarms (temperature, pressure, speed limits), equipment alarms (motor faults, sensor faults) and system alarms (communication and I/O faults). Consider IEC 61508, ISO 13849 and ISA-18.2 alarm management practice."
            }
            AnalysisKind::Safety => {
                "You are a functional safety expert reviewing the safety functions of a PLC program.

Your tasks:
1. Identify safety-related logic and functions
2. Assess the completeness of the safety functions
3. Check conformance with safety standards
4. Find latent hazards

Focus on safety I/O handling, interlocks, fault detection and diagnostics, maintaining the safe state, and redundancy."
            }
            AnalysisKind::Logic => {
                "You are a PLC program logic expert reviewing the correctness of a PLC program.

Your tasks:
1. Check the correctness of the program logic
2. Identify potential logic errors
3. Assess robustness
4. Recommend optimizations

Focus on completeness of conditions, state machines, timing, exception handling and consistent variable use."
            }
        }
    }

    fn few_shot_examples(&self, kind: AnalysisKind) -> &'static str {
        match kind {
            AnalysisKind::Alarm => {
                r#"Example 1 - missing temperature alarm:
Input: a temperature sensor is read but no over-temperature alarm exists
Output:
{
    "type": "missing_alarm",
    "severity": "high",
    "location": "temperature monitoring logic",
    "description": "Temperature sensor TT_001 is read but no over-temperature alarm is raised",
    "recommendation": "Add a high alarm (>80°C) and a high-high alarm (>95°C)",
    "confidence": 0.9
}

Example 2 - existing pressure alarm:
Input: a pressure sensor with high pressure alarm logic
Output:
{
    "type": "existing_alarm",
    "severity": "medium",
    "location": "pressure control loop",
    "description": "Complete pressure alarm configuration with high and low alarms",
    "recommendation": "Configuration is reasonable; verify set points periodically",
    "confidence": 0.95
}"#
            }
            AnalysisKind::Safety | AnalysisKind::Logic => {
                "Report each issue as one finding object; use an empty findings list when nothing is wrong."
            }
        }
    }

    fn format_context(&self, shard: &Shard) -> String {
        if shard.context.is_empty() {
            return "No external dependencies.\n".to_string();
        }

        let mut text = String::from("Dependencies defined outside this fragment:\n");
        for (name, entry) in &shard.context {
            text.push_str(&format!("- {} ({}): {}\n", name, entry.category.label(), entry.summary));
        }
        text
    }

    fn format_entities(&self, shard: &Shard) -> String {
        let mut text = format!(
            "Fragment {} ({}, lines {}-{})\n",
            shard.id,
            shard.group.label(),
            shard.line_start,
            shard.line_end
        );
        for entity in &shard.entities {
            text.push_str(&format!("\n### {}: {}\n", entity.category.label(), entity.name));
            text.push_str(&format!("```xml\n{}\n```\n", entity.raw_text));
        }
        text
    }
}
