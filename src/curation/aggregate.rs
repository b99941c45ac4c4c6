//! Consensus over the reviewer ensemble: mean score, strict-majority vote
//! and concatenated reasoning.

use serde::ser::{Serialize, SerializeMap, Serializer};

use super::traits::{Classification, UnitJudgment};

/// One reviewer's finished judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewerVerdict {
    /// 1-based reviewer index.
    pub reviewer_id: usize,
    pub judgment: UnitJudgment,
    /// The synthesis call fell back to the Error sentinel.
    pub degraded: bool,
    /// Feature or metrics reports that fell back to the empty sentinel.
    pub degraded_reports: usize,
}

/// Per-reviewer vote kept on the consensus record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewerVote {
    pub reviewer_id: usize,
    pub score: f64,
    pub classification: Classification,
}

/// Consensus record for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationRecord {
    pub average_score: f64,
    pub final_classification: Classification,
    pub combined_reasoning: String,
    pub reviewers: Vec<ReviewerVote>,
    /// Reviewers whose synthesis degraded.
    pub degraded_reviewers: usize,
    /// Empty reports the reviewers synthesised over, summed across reviewers.
    pub degraded_reports: usize,
}

impl CurationRecord {
    /// Some call degraded or an Error vote was cast, so the label may not
    /// rest on a complete judgment.
    pub fn needs_review(&self) -> bool {
        self.degraded_reviewers > 0
            || self.degraded_reports > 0
            || self
                .reviewers
                .iter()
                .any(|v| v.classification == Classification::Error)
    }
}

/// Flattened as `average_score`, `final_classification`, `combined_reasoning`,
/// `reviewer_{i}_score`, `reviewer_{i}_class`, `degraded_reports`, `needs_review`.
impl Serialize for CurationRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5 + 2 * self.reviewers.len()))?;
        map.serialize_entry("average_score", &self.average_score)?;
        map.serialize_entry("final_classification", self.final_classification.label())?;
        map.serialize_entry("combined_reasoning", &self.combined_reasoning)?;
        for vote in &self.reviewers {
            map.serialize_entry(&format!("reviewer_{}_score", vote.reviewer_id), &vote.score)?;
            map.serialize_entry(
                &format!("reviewer_{}_class", vote.reviewer_id),
                vote.classification.label(),
            )?;
        }
        map.serialize_entry("degraded_reports", &self.degraded_reports)?;
        map.serialize_entry("needs_review", &self.needs_review())?;
        map.end()
    }
}

/// Round half away from zero to 2 decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Good iff strictly more than one vote is Good. Error never counts as Good.
pub fn majority(votes: &[Classification]) -> Classification {
    let good = votes.iter().filter(|c| **c == Classification::Good).count();
    if good > 1 {
        Classification::Good
    } else {
        Classification::Bad
    }
}

pub fn aggregate(verdicts: &[ReviewerVerdict]) -> CurationRecord {
    let scores: Vec<f64> = verdicts.iter().map(|v| v.judgment.unit_quality_score).collect();
    let average_score = if scores.is_empty() {
        0.0
    } else {
        round2(scores.iter().sum::<f64>() / scores.len() as f64)
    };

    let classes: Vec<Classification> =
        verdicts.iter().map(|v| v.judgment.classification).collect();

    let combined_reasoning = verdicts
        .iter()
        .map(|v| format!("Reviewer {}: {}", v.reviewer_id, v.judgment.reasoning))
        .collect::<Vec<_>>()
        .join("\n");

    CurationRecord {
        average_score,
        final_classification: majority(&classes),
        combined_reasoning,
        reviewers: verdicts
            .iter()
            .map(|v| ReviewerVote {
                reviewer_id: v.reviewer_id,
                score: v.judgment.unit_quality_score,
                classification: v.judgment.classification,
            })
            .collect(),
        degraded_reviewers: verdicts.iter().filter(|v| v.degraded).count(),
        degraded_reports: verdicts.iter().map(|v| v.degraded_reports).sum(),
    }
}
