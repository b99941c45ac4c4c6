//! Merge engine: one reviewer-equivalent pass per candidate group, ending in
//! a structured merge / not-merge decision that also sees a composite strip
//! of every feature image.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::batch::{run_batch, BatchPlan, BatchProgress, ProgressFn, DEFAULT_WORKERS};
use super::composite::{render_strip, DEFAULT_STRIP_HEIGHT};
use super::dispatch::{scatter_gather, CallOutcome, Dispatcher};
use super::error::EngineError;
use super::feature::{Feature, Variant};
use super::fewshot::{FewShotContext, FewShotSets};
use super::prompts::{merge_task, PromptSet};
use super::reviewer::{compose_report, reject_duplicates};
use super::table::{ArtifactTable, ResultTable, UnitKey};
use super::traits::{ContentPart, MergeJudgment, MergeType, Message};

/// Group id → member unit ids.
pub type MergeGroups<K> = BTreeMap<K, Vec<K>>;

/// `[3, 7, 12]`, the unit-list rendering used in every merge prompt.
pub fn format_units<K: UnitKey>(units: &[K]) -> String {
    let inner = units
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

#[derive(Debug, Clone)]
pub struct MergeRequest<K: UnitKey> {
    pub features: Vec<Feature>,
    /// Few-shot examples, given as group ids of the artifact table.
    pub fewshot: FewShotSets<K>,
    /// Subset to decide; `None` means every row of the artifact table.
    pub group_ids: Option<Vec<K>>,
    pub workers: usize,
}

impl<K: UnitKey> MergeRequest<K> {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            features,
            fewshot: FewShotSets::default(),
            group_ids: None,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_fewshot(mut self, fewshot: FewShotSets<K>) -> Self {
        self.fewshot = fewshot;
        self
    }

    pub fn only_groups(mut self, ids: Vec<K>) -> Self {
        self.group_ids = Some(ids);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Decision for one candidate group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRecord<K> {
    /// `None` when the synthesis call degraded: undecided, not "not merge".
    pub merge_type: Option<MergeType>,
    pub merge_units: Vec<K>,
    pub reasoning: String,
    /// Feature reports exactly as the synthesis call saw them.
    pub report: String,
    /// Feature reports that fell back to the empty sentinel.
    pub degraded_reports: usize,
}

impl<K> MergeRecord<K> {
    pub fn is_undecided(&self) -> bool {
        self.merge_type.is_none()
    }

    pub fn should_merge(&self) -> bool {
        self.merge_type == Some(MergeType::Merge)
    }

    /// Undecided, or decided over one or more empty feature reports.
    pub fn needs_review(&self) -> bool {
        self.is_undecided() || self.degraded_reports > 0
    }
}

struct Prepared<K: UnitKey> {
    ids: Vec<K>,
    dispatcher: Dispatcher,
    prefixes: Vec<(Feature, Vec<Message>)>,
}

pub struct MergeEngine {
    dispatcher: Dispatcher,
    prompts: Arc<PromptSet>,
    strip_height: u32,
}

impl MergeEngine {
    pub fn new(dispatcher: Dispatcher, prompts: PromptSet) -> Self {
        Self {
            dispatcher,
            prompts: Arc::new(prompts),
            strip_height: DEFAULT_STRIP_HEIGHT,
        }
    }

    pub fn with_strip_height(mut self, height: u32) -> Self {
        self.strip_height = height;
        self
    }

    pub async fn run<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        groups: &MergeGroups<K>,
        request: &MergeRequest<K>,
    ) -> Result<ResultTable<K, MergeRecord<K>>, EngineError> {
        self.run_with_progress(artifacts, groups, request, None).await
    }

    pub async fn run_with_progress<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        groups: &MergeGroups<K>,
        request: &MergeRequest<K>,
        on_progress: Option<ProgressFn>,
    ) -> Result<ResultTable<K, MergeRecord<K>>, EngineError> {
        let prepared = self.prepare(artifacts, groups, request)?;
        let plan = BatchPlan::new(request.workers, 1, request.features.len());
        let progress = BatchProgress::new(prepared.ids.len()).with_callback(on_progress);

        tracing::info!(
            groups = prepared.ids.len(),
            features = request.features.len(),
            fewshot = !request.fewshot.is_empty(),
            model = self.dispatcher.model_name(),
            "Starting merge review"
        );

        let prepared = &prepared;
        let table = run_batch(&plan, &prepared.ids, &progress, move |group| async move {
            self.review_group(artifacts, groups, prepared, &group).await
        })
        .await;

        let undecided = table.iter().filter(|(_, r)| r.is_undecided()).count();
        if undecided > 0 {
            tracing::warn!(groups = undecided, "Merge groups left undecided");
        }
        let partial = table
            .iter()
            .filter(|(_, r)| !r.is_undecided() && r.degraded_reports > 0)
            .count();
        if partial > 0 {
            tracing::warn!(groups = partial, "Merge decisions rest on empty feature reports");
        }
        Ok(table)
    }

    fn prepare<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        groups: &MergeGroups<K>,
        request: &MergeRequest<K>,
    ) -> Result<Prepared<K>, EngineError> {
        if request.workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        if request.features.is_empty() {
            return Err(EngineError::NoFeatures);
        }
        self.prompts
            .ensure_covers(Variant::Merge, &request.features, false)?;

        let ids = match request.group_ids {
            Some(ref ids) => ids.clone(),
            None => artifacts.ids(),
        };
        reject_duplicates(&ids)?;
        for group in &ids {
            if !groups.contains_key(group) {
                return Err(EngineError::UnknownGroup(group.to_string()));
            }
            for &feature in &request.features {
                artifacts.require(group, feature)?;
            }
        }

        let fewshot =
            FewShotContext::build(artifacts, &request.features, &request.fewshot, Variant::Merge)?;
        let mut prefixes = Vec::with_capacity(request.features.len());
        for &feature in &request.features {
            let mut prefix = vec![self.prompts.feature_message(feature)?];
            prefix.extend(fewshot.for_feature(feature).iter().cloned());
            prefixes.push((feature, prefix));
        }

        Ok(Prepared {
            ids,
            dispatcher: self.dispatcher.for_run(request.workers),
            prefixes,
        })
    }

    async fn review_group<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        groups: &MergeGroups<K>,
        prepared: &Prepared<K>,
        group: &K,
    ) -> MergeRecord<K> {
        let units = groups.get(group).cloned().unwrap_or_default();
        let unit_list = format_units(&units);
        let unit_list = unit_list.as_str();

        let reports = scatter_gather(prepared.prefixes.iter(), |(feature, prefix)| {
            self.feature_report(&prepared.dispatcher, artifacts, group, unit_list, *feature, prefix)
        })
        .await;
        let degraded_reports = reports.iter().filter(|r| r.degraded).count();
        if degraded_reports > 0 {
            tracing::warn!(
                group = %group,
                degraded = degraded_reports,
                "Merge synthesis runs over empty reports"
            );
        }
        let report = compose_report(reports.iter().map(|r| r.value.as_str()));

        let mut messages = vec![self.prompts.head_message()];
        let images: Vec<_> = prepared
            .prefixes
            .iter()
            .filter_map(|(feature, _)| artifacts.get(group, *feature).cloned())
            .collect();
        match render_strip(images, Some(self.strip_height)).await {
            Ok(strip) => messages.push(Message::user(vec![
                ContentPart::text(format!("This is the feature image given of unit list: {unit_list}")),
                ContentPart::image(strip),
            ])),
            Err(err) => tracing::warn!(
                group = %group,
                error = %format!("{err:#}"),
                "Composite strip unavailable, synthesising without it"
            ),
        }
        messages.push(Message::user_text(report.clone()));

        let label = format!("group {group} synthesis");
        let outcome = prepared
            .dispatcher
            .judge(&label, &messages, || MergeJudgment {
                merge_type: MergeType::NotMerge,
                reasoning: String::new(),
            })
            .await;

        let (merge_type, reasoning) = if outcome.degraded {
            (None, String::new())
        } else {
            (Some(outcome.value.merge_type), outcome.value.reasoning)
        };
        tracing::debug!(
            group = %group,
            decision = merge_type.map(MergeType::label).unwrap_or("undecided"),
            "Group reviewed"
        );

        MergeRecord {
            merge_type,
            merge_units: units,
            reasoning,
            report,
            degraded_reports,
        }
    }

    async fn feature_report<K: UnitKey>(
        &self,
        dispatcher: &Dispatcher,
        artifacts: &ArtifactTable<K>,
        group: &K,
        unit_list: &str,
        feature: Feature,
        prefix: &[Message],
    ) -> CallOutcome<String> {
        let Some(image) = artifacts.get(group, feature) else {
            tracing::error!(group = %group, feature = %feature, "Artifact vanished after validation");
            return CallOutcome {
                value: String::new(),
                attempts: 0,
                degraded: true,
            };
        };
        let mut messages = prefix.to_vec();
        messages.push(merge_task(feature, unit_list, image));
        let label = format!("group {group} {feature}");
        dispatcher.report(&label, &messages).await
    }
}
