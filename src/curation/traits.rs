//! Message types, structured judgments and the model capability contract.
//!
//! Concrete providers (OpenAI-compatible, Anthropic) implement
//! [`VisionModel`]; the engine only ever talks to that trait, so tests and
//! alternative backends plug in at the same seam.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Messages ─────────────────────────────────────────────────────

/// Speaker of a message in a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
}

/// An encoded image payload, forwarded verbatim to the provider.
///
/// The engine never decodes these except to build the merge composite strip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `data:` URL form used by OpenAI-style `image_url` parts.
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.0)
    }
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: EncodedImage },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image: EncodedImage) -> Self {
        Self::Image { image }
    }
}

/// A single message in the ordered context of a model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![ContentPart::text(text)],
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::text(text)],
        }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    /// All text parts joined by newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &EncodedImage> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::Image { image } => Some(image),
            ContentPart::Text { .. } => None,
        })
    }
}

// ── Structured output ────────────────────────────────────────────

/// JSON schema handed to a provider when a typed answer is required.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: serde_json::Value,
}

/// A response shape the synthesis call can be bound to.
pub trait StructuredOutput: DeserializeOwned + JsonSchema + Send {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn output_schema() -> OutputSchema {
        let mut schema =
            serde_json::to_value(schemars::schema_for!(Self)).unwrap_or_default();
        if let serde_json::Value::Object(ref mut map) = schema {
            map.remove("$schema");
        }
        OutputSchema {
            name: Self::NAME,
            description: Self::DESCRIPTION,
            schema,
        }
    }
}

// ── Curation judgment ────────────────────────────────────────────

/// Label a reviewer assigns to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Classification {
    Good,
    Bad,
    /// Only produced when the reviewer could not judge the unit.
    Error,
}

impl Classification {
    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Bad => "Bad",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured output for spike unit classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnitJudgment {
    /// Detailed explanation combining insights from each modality.
    pub reasoning: String,
    /// Quality score between 0.0 (bad) and 1.0 (excellent).
    pub unit_quality_score: f64,
    /// Final label. Use 'Error' only if something went wrong.
    pub classification: Classification,
}

impl UnitJudgment {
    /// Sentinel for a reviewer whose synthesis call never succeeded.
    pub fn error() -> Self {
        Self {
            reasoning: String::new(),
            unit_quality_score: 0.0,
            classification: Classification::Error,
        }
    }

    /// Pull the score back into `[0, 1]`; NaN becomes 0.
    pub fn clamped(mut self) -> Self {
        self.unit_quality_score = if self.unit_quality_score.is_nan() {
            0.0
        } else {
            self.unit_quality_score.clamp(0.0, 1.0)
        };
        self
    }
}

impl StructuredOutput for UnitJudgment {
    const NAME: &'static str = "UnitCuration";
    const DESCRIPTION: &'static str = "Structured output for spike unit classification.";
}

// ── Merge judgment ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum MergeType {
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "not merge")]
    NotMerge,
}

impl MergeType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::NotMerge => "not merge",
        }
    }
}

/// Structured output for a merge-candidate group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MergeJudgment {
    /// Whether the units in the group should be merged.
    pub merge_type: MergeType,
    /// Detailed reasoning for the decision.
    pub reasoning: String,
}

impl StructuredOutput for MergeJudgment {
    const NAME: &'static str = "MergeDecision";
    const DESCRIPTION: &'static str =
        "Structured output deciding whether candidate units should be merged.";
}

// ── Model trait ──────────────────────────────────────────────────

/// Capability contract for a vision-language model.
///
/// Implementations must be cheap to share: the engine holds one
/// `Arc<dyn VisionModel>` and calls it from many concurrent futures.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// Invoke with an ordered message list and return the text answer.
    async fn invoke(&self, messages: &[Message]) -> anyhow::Result<String>;

    /// Invoke bound to `schema` and return the raw JSON object it produced.
    async fn invoke_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> anyhow::Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_skips_images() {
        let msg = Message::user(vec![
            ContentPart::text("first"),
            ContentPart::image(EncodedImage::new("AAAA")),
            ContentPart::text("second"),
        ]);
        assert_eq!(msg.text(), "first\nsecond");
        assert_eq!(msg.images().count(), 1);
    }

    #[test]
    fn data_url_wraps_payload_untouched() {
        let img = EncodedImage::new("abc+/=");
        assert_eq!(img.data_url(), "data:image/jpeg;base64,abc+/=");
    }

    #[test]
    fn unit_judgment_schema_lists_fields() {
        let schema = UnitJudgment::output_schema();
        assert_eq!(schema.name, "UnitCuration");
        let props = &schema.schema["properties"];
        assert!(props.get("reasoning").is_some());
        assert!(props.get("unit_quality_score").is_some());
        assert!(props.get("classification").is_some());
        assert!(schema.schema.get("$schema").is_none());
    }

    #[test]
    fn merge_type_uses_spaced_wire_name() {
        let parsed: MergeJudgment =
            serde_json::from_str(r#"{"merge_type": "not merge", "reasoning": "distinct"}"#)
                .unwrap();
        assert_eq!(parsed.merge_type, MergeType::NotMerge);
        assert_eq!(serde_json::to_string(&MergeType::Merge).unwrap(), "\"merge\"");
    }

    #[test]
    fn clamped_bounds_score() {
        let judgment = UnitJudgment {
            reasoning: String::new(),
            unit_quality_score: 1.7,
            classification: Classification::Good,
        };
        assert_eq!(judgment.clamped().unit_quality_score, 1.0);

        let nan = UnitJudgment {
            unit_quality_score: f64::NAN,
            ..UnitJudgment::error()
        };
        assert_eq!(nan.clamped().unit_quality_score, 0.0);
    }
}
