//! Few-shot context: labelled example images inserted ahead of each
//! feature call.

use std::collections::HashMap;

use super::error::EngineError;
use super::feature::{Feature, Variant};
use super::table::{ArtifactTable, UnitKey};
use super::traits::{ContentPart, Message};

/// Labelled example units. Both empty means zero-shot.
#[derive(Debug, Clone)]
pub struct FewShotSets<K> {
    pub good: Vec<K>,
    pub bad: Vec<K>,
}

impl<K> Default for FewShotSets<K> {
    fn default() -> Self {
        Self {
            good: Vec::new(),
            bad: Vec::new(),
        }
    }
}

impl<K> FewShotSets<K> {
    pub fn new(good: Vec<K>, bad: Vec<K>) -> Self {
        Self { good, bad }
    }

    pub fn is_empty(&self) -> bool {
        self.good.is_empty() && self.bad.is_empty()
    }
}

/// Pre-built few-shot messages per feature, shared by every unit in a batch.
#[derive(Debug, Clone, Default)]
pub struct FewShotContext {
    messages: HashMap<Feature, Vec<Message>>,
}

impl FewShotContext {
    /// Build one user message per non-empty category per feature.
    ///
    /// Every listed example must have an artifact for every feature.
    pub fn build<K: UnitKey>(
        table: &ArtifactTable<K>,
        features: &[Feature],
        sets: &FewShotSets<K>,
        variant: Variant,
    ) -> Result<Self, EngineError> {
        let mut messages = HashMap::new();
        if sets.is_empty() {
            return Ok(Self { messages });
        }

        let (good_text, bad_text) = match variant {
            Variant::Curation => (
                "These are Good examples you must compare with",
                "These are Bad examples you must compare with",
            ),
            Variant::Merge => (
                "These are Good merge examples you must compare with",
                "These are Bad merge examples you must compare with",
            ),
        };

        for &feature in features {
            let mut block = Vec::with_capacity(2);
            for (ids, text) in [(&sets.good, good_text), (&sets.bad, bad_text)] {
                if ids.is_empty() {
                    continue;
                }
                let mut parts = vec![ContentPart::text(text)];
                for id in ids {
                    let image = table.require(id, feature).map_err(|err| match err {
                        EngineError::UnknownUnit(id) => EngineError::UnknownExample(id),
                        other => other,
                    })?;
                    parts.push(ContentPart::image(image.clone()));
                }
                block.push(Message::user(parts));
            }
            messages.insert(feature, block);
        }

        Ok(Self { messages })
    }

    pub fn for_feature(&self, feature: Feature) -> &[Message] {
        self.messages
            .get(&feature)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.messages.values().all(Vec::is_empty)
    }
}
