//! Multi-reviewer VLM ensemble for spike-unit curation and merge review.
//!
//! Every unit is judged by three independent reviewers that each look at
//! one image per feature, write free-text reports, and condense them into a
//! structured judgment. The judgments are folded into a consensus record.
//!
//! ## Architecture
//!
//! ```text
//! ArtifactTable ─▸ run_batch ─┬─▸ CurationEngine ─▸ 3 × (features ─▸ synthesis) ─▸ aggregate
//!                             └─▸ MergeEngine    ─▸ 1 × (features ─▸ composite + synthesis)
//!                                        │
//!                                        └─▸ Dispatcher (retry, timeout, cancel, budget)
//!                                                 └─▸ dyn VisionModel
//! ```
//!
//! Model failures never abort a batch: each call retries at a fixed
//! interval and then degrades to a sentinel that the consensus records
//! surface (`Error` votes, undecided merges). Only inconsistent inputs are
//! rejected, up front, as [`EngineError`].

pub mod aggregate;
pub mod batch;
pub mod composite;
pub mod dispatch;
pub mod error;
pub mod feature;
pub mod fewshot;
pub mod merge;
pub mod prompts;
pub mod reviewer;
pub mod table;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use aggregate::{CurationRecord, ReviewerVerdict, ReviewerVote};
pub use batch::{BatchPlan, BatchProgress, ProgressFn, DEFAULT_WORKERS};
pub use dispatch::{CallOutcome, Dispatcher, RetryPolicy};
pub use error::EngineError;
pub use feature::{parse_features, required_extensions, Feature, Variant};
pub use fewshot::FewShotSets;
pub use merge::{MergeEngine, MergeGroups, MergeRecord, MergeRequest};
pub use prompts::PromptSet;
pub use reviewer::{CurationEngine, CurationRequest, REVIEWERS_PER_UNIT};
pub use table::{ArtifactTable, MetricsTable, ResultTable, UnitKey, DEFAULT_METRICS};
pub use traits::{
    Classification, ContentPart, EncodedImage, MergeJudgment, MergeType, Message, OutputSchema,
    Role, StructuredOutput, UnitJudgment, VisionModel,
};
