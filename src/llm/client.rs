//! LLM Client - HTTP completion endpoint integration
//!
//! Text-in / JSON-out transport for the planner and the semantic
//! translator. The response may arrive fenced in markdown or with prose
//! around it; extraction peels all of that off before parsing.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

/// Completion API client
pub struct LlmClient {
    base_url: String,
    model: String,
    client: Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    /// Opaque extended-reasoning budget; endpoints that do not support it
    /// ignore the field
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    response: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            client,
        }
    }

    /// Generate a completion. `thinking_budget` of zero disables the
    /// extended-reasoning request option.
    pub async fn generate(
        &self,
        prompt: &str,
        json_format: bool,
        thinking_budget: u32,
    ) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            format: json_format.then(|| "json".to_string()),
            options: Some(GenerateOptions {
                num_predict: Some(4096),
                // Near-greedy sampling keeps the JSON stable
                temperature: Some(0.1),
                thinking_budget: (thinking_budget > 0).then_some(thinking_budget),
            }),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM endpoint")?;

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse LLM response body")?;

        Ok(body.response)
    }

    /// Generate and parse a structured JSON response
    pub async fn generate_json<T>(&self, prompt: &str, thinking_budget: u32) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.generate(prompt, true, thinking_budget).await?;
        let json_str = extract_json(&response);

        serde_json::from_str(&json_str).map_err(|e| {
            let preview = if json_str.len() > 600 {
                format!("{}... ({} bytes total)", &json_str[..600], json_str.len())
            } else {
                json_str.clone()
            };
            anyhow::anyhow!("Failed to parse JSON from LLM response: {e}\nResponse was:\n{preview}")
        })
    }

    /// Check whether the endpoint is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Extract the JSON payload from a model response: fenced block first, then
/// the outermost object or array, otherwise the trimmed text as-is.
pub fn extract_json(response: &str) -> String {
    let trimmed = response.trim();

    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
    } else if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            if let Some(end) = trimmed[start + 1..].find("```") {
                return trimmed[start + 1..start + 1 + end].trim().to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return trimmed[start..=end].to_string();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}
