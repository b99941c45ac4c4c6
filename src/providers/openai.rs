use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{json_payload, HTTP_TIMEOUT_SECS};
use crate::curation::{ContentPart, Message, OutputSchema, Role, VisionModel};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat-completions backend.
pub struct OpenAiModel {
    api_key: String,
    model: String,
    /// Base URL without the trailing `/chat/completions`.
    base_url: String,
    temperature: f64,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiModel {
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

    /// Reasoning models reject `temperature` and `max_tokens`.
    fn is_reasoning_model(&self) -> bool {
        self.model.starts_with('o')
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                };
                let has_image = msg.images().next().is_some();
                let content = if has_image {
                    Value::Array(
                        msg.parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                                ContentPart::Image { image } => json!({
                                    "type": "image_url",
                                    "image_url": { "url": image.data_url() }
                                }),
                            })
                            .collect(),
                    )
                } else {
                    Value::String(msg.text())
                };
                json!({ "role": role, "content": content })
            })
            .collect()
    }

    fn payload(&self, messages: &[Message]) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
        });
        if !self.is_reasoning_model() {
            payload["temperature"] = json!(self.temperature);
            payload["max_tokens"] = json!(self.max_tokens);
        }
        payload
    }

    async fn complete(&self, payload: &Value) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, body);
        }

        let body: Value = resp.json().await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("OpenAI response has no message content")
    }
}

#[async_trait]
impl VisionModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[Message]) -> anyhow::Result<String> {
        self.complete(&self.payload(messages)).await
    }

    async fn invoke_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> anyhow::Result<Value> {
        let mut payload = self.payload(messages);
        payload["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "description": schema.description,
                "schema": schema.schema,
                "strict": false
            }
        });
        let text = self.complete(&payload).await?;
        serde_json::from_str(json_payload(&text))
            .with_context(|| format!("OpenAI returned non-JSON structured output: {text}"))
    }
}
