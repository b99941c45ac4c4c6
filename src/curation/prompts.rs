//! Instructional context for each engine variant.
//!
//! Prompt text is opaque configuration. A [`PromptSet`] is either loaded
//! from a directory laid out as
//!
//! ```text
//! <dir>/head.txt
//! <dir>/fewshot_instruction.txt
//! <dir>/modality/<feature>.txt
//! <dir>/metrics.txt
//! <dir>/metrics_header.txt        ({metrics_descriptions} placeholder)
//! <dir>/metrics/<metric>.txt
//! ```
//!
//! or assembled in memory with [`PromptSet::new`] and the `with_*` builders.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

use super::error::EngineError;
use super::feature::{Feature, Variant};
use super::traits::{ContentPart, EncodedImage, Message};

const METRICS_PLACEHOLDER: &str = "{metrics_descriptions}";

/// Per-feature, head and metrics system context for one variant.
#[derive(Debug, Clone)]
pub struct PromptSet {
    variant: Variant,
    head: String,
    features: HashMap<Feature, String>,
    metrics: Option<String>,
}

impl PromptSet {
    pub fn new(variant: Variant, head: impl Into<String>) -> Self {
        Self {
            variant,
            head: head.into(),
            features: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_feature(mut self, feature: Feature, prompt: impl Into<String>) -> Self {
        self.features.insert(feature, prompt.into());
        self
    }

    pub fn with_metrics(mut self, prompt: impl Into<String>) -> Self {
        self.metrics = Some(prompt.into());
        self
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn feature(&self, feature: Feature) -> Option<&str> {
        self.features.get(&feature).map(String::as_str)
    }

    pub fn metrics(&self) -> Option<&str> {
        self.metrics.as_deref()
    }

    /// Check the set can serve every requested feature for `variant`.
    pub fn ensure_covers(
        &self,
        variant: Variant,
        features: &[Feature],
        with_metrics: bool,
    ) -> Result<(), EngineError> {
        if self.variant != variant {
            return Err(EngineError::VariantMismatch {
                expected: variant,
                found: self.variant,
            });
        }
        for &feature in features {
            if !feature.supports(variant) {
                return Err(EngineError::UnsupportedFeature { feature, variant });
            }
            if !self.features.contains_key(&feature) {
                return Err(EngineError::MissingPrompt(feature));
            }
        }
        if with_metrics && self.metrics.is_none() {
            return Err(EngineError::MissingMetricsPrompt);
        }
        Ok(())
    }

    // ── Message helpers ──────────────────────────────────────────

    pub fn head_message(&self) -> Message {
        Message::system(self.head.clone())
    }

    /// System context for one feature call.
    pub fn feature_message(&self, feature: Feature) -> Result<Message, EngineError> {
        self.feature(feature)
            .map(Message::system)
            .ok_or(EngineError::MissingPrompt(feature))
    }

    pub fn metrics_message(&self) -> Result<Message, EngineError> {
        self.metrics()
            .map(Message::system)
            .ok_or(EngineError::MissingMetricsPrompt)
    }

    // ── Loading ──────────────────────────────────────────────────

    /// Load the prompt directory for `variant`.
    ///
    /// `metrics` selects the per-metric descriptions (curation only); `None`
    /// skips the metrics prompt entirely.
    pub fn load(
        dir: &Path,
        variant: Variant,
        features: &[Feature],
        with_fewshot: bool,
        metrics: Option<&[String]>,
    ) -> anyhow::Result<Self> {
        let head = read_prompt(&dir.join("head.txt"))?;
        let mut set = Self::new(variant, head);

        let fewshot_instruction = if with_fewshot {
            Some(read_prompt(&dir.join("fewshot_instruction.txt"))?)
        } else {
            None
        };

        for &feature in features {
            if !feature.supports(variant) {
                return Err(EngineError::UnsupportedFeature { feature, variant }.into());
            }
            let path = dir.join("modality").join(format!("{}.txt", feature.name()));
            let mut prompt = read_prompt(&path)?;
            if let Some(ref instruction) = fewshot_instruction {
                prompt.push_str("\n\n");
                prompt.push_str(instruction);
            }
            set.features.insert(feature, prompt);
        }

        if let Some(names) = metrics {
            set.metrics = Some(load_metrics_prompt(dir, names)?);
        }

        tracing::debug!(
            dir = %dir.display(),
            variant = %variant,
            features = features.len(),
            with_fewshot,
            with_metrics = set.metrics.is_some(),
            "Loaded prompt set"
        );
        Ok(set)
    }
}

fn read_prompt(path: &Path) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading prompt {}", path.display()))?;
    Ok(text.trim_end().to_string())
}

/// Header with per-metric descriptions spliced in, or the plain metrics prompt
/// when no description file exists for any requested metric.
fn load_metrics_prompt(dir: &Path, names: &[String]) -> anyhow::Result<String> {
    let header_path = dir.join("metrics_header.txt");
    let mut descriptions = Vec::new();
    if header_path.exists() {
        for name in names {
            let path = dir.join("metrics").join(format!("{name}.txt"));
            if path.exists() {
                descriptions.push(read_prompt(&path)?);
            } else {
                tracing::warn!(metric = %name, "No description found for metric");
            }
        }
    }
    if descriptions.is_empty() {
        return read_prompt(&dir.join("metrics.txt"));
    }
    let header = read_prompt(&header_path)?;
    Ok(header.replace(METRICS_PLACEHOLDER, &descriptions.join("\n\n")))
}

// ── Task content ─────────────────────────────────────────────────

/// User message carrying one feature image for a curation call.
pub fn curation_task(image: &EncodedImage) -> Message {
    Message::user(vec![
        ContentPart::text("Assess the quality of this feature image"),
        ContentPart::image(image.clone()),
    ])
}

/// User message carrying one feature image for a merge group.
pub fn merge_task(feature: Feature, units: &str, image: &EncodedImage) -> Message {
    Message::user(vec![
        ContentPart::text(format!(
            "Assess the quality of this {} of unit list: {units}",
            feature.merge_caption()
        )),
        ContentPart::image(image.clone()),
    ])
}

/// User message carrying a unit's flattened metrics row.
pub fn metrics_task(rendered: &str) -> Message {
    Message::user_text(format!(
        "These are the quality metrics of this unit. Assess the quality. - {rendered}"
    ))
}
