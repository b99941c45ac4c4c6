use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{json_payload, HTTP_TIMEOUT_SECS};
use crate::curation::{ContentPart, Message, OutputSchema, Role, VisionModel};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic messages-API backend.
///
/// System messages are hoisted into the top-level `system` field and the
/// remaining user messages are merged into one turn, since the engine
/// never produces assistant turns.
pub struct AnthropicModel {
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.into(),
            temperature: 0.0,
            max_tokens: 4096,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn payload(&self, messages: &[Message]) -> Value {
        let mut system = Vec::new();
        let mut blocks = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => system.push(msg.text()),
                Role::User => {
                    for part in &msg.parts {
                        blocks.push(match part {
                            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                            ContentPart::Image { image } => json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": "image/jpeg",
                                    "data": image.as_str()
                                }
                            }),
                        });
                    }
                }
            }
        }

        let mut payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": blocks }],
        });
        if !system.is_empty() {
            payload["system"] = json!(system.join("\n\n"));
        }
        payload
    }

    async fn send(&self, payload: &Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(payload)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {}: {}", status, body);
        }
        Ok(resp.json().await?)
    }

    fn text_of(body: &Value) -> String {
        body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VisionModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[Message]) -> anyhow::Result<String> {
        let body = self.send(&self.payload(messages)).await?;
        let text = Self::text_of(&body);
        if text.is_empty() {
            anyhow::bail!("Claude response has no text content");
        }
        Ok(text)
    }

    /// Forces a single tool call whose input schema is the output schema.
    async fn invoke_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> anyhow::Result<Value> {
        let mut payload = self.payload(messages);
        payload["tools"] = json!([{
            "name": schema.name,
            "description": schema.description,
            "input_schema": schema.schema,
        }]);
        payload["tool_choice"] = json!({ "type": "tool", "name": schema.name });

        let body = self.send(&payload).await?;
        let tool_input = body["content"].as_array().and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b["type"] == "tool_use" && b["name"] == schema.name)
                .map(|b| b["input"].clone())
        });
        if let Some(input) = tool_input {
            return Ok(input);
        }

        let text = Self::text_of(&body);
        serde_json::from_str(json_payload(&text))
            .with_context(|| format!("Claude returned no {} tool call", schema.name))
    }
}
