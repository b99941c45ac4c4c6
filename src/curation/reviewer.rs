//! Curation engine: three independent reviewers per unit, each fanning out
//! one call per feature (plus the optional metrics channel) and then
//! synthesising a structured [`UnitJudgment`].
//!
//! ```text
//! unit ─┬─▸ reviewer 1 ─┬─▸ feature calls ─┐
//!       │               └─▸ metrics call  ─┴─▸ synthesis ─▸ judgment ─┐
//!       ├─▸ reviewer 2 ─▸ ...                                         ├─▸ CurationRecord
//!       └─▸ reviewer 3 ─▸ ...                                         ┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::aggregate::{aggregate, CurationRecord, ReviewerVerdict};
use super::batch::{run_batch, BatchPlan, BatchProgress, ProgressFn, DEFAULT_WORKERS};
use super::dispatch::{scatter_gather, CallOutcome, Dispatcher};
use super::error::EngineError;
use super::feature::{Feature, Variant};
use super::fewshot::{FewShotContext, FewShotSets};
use super::prompts::{curation_task, metrics_task, PromptSet};
use super::table::{ArtifactTable, MetricsTable, ResultTable, UnitKey};
use super::traits::{Message, UnitJudgment};

pub const REVIEWERS_PER_UNIT: usize = 3;

const REPORT_HEADER: &str = "These are the quality assessment report from Visual Language Model";

/// Join per-call reports under the synthesis header, one separator line
/// before each report.
pub(crate) fn compose_report<'a>(reports: impl IntoIterator<Item = &'a str>) -> String {
    let separator = format!("\n{}\n", "-".repeat(50));
    std::iter::once(REPORT_HEADER)
        .chain(reports)
        .collect::<Vec<_>>()
        .join(&separator)
}

// ── Request ──────────────────────────────────────────────────────

/// Per-batch configuration surface.
#[derive(Debug, Clone)]
pub struct CurationRequest<K: UnitKey> {
    pub features: Vec<Feature>,
    pub fewshot: FewShotSets<K>,
    /// Issue the extra metrics call per reviewer.
    pub with_metrics: bool,
    pub metrics: Option<MetricsTable<K>>,
    /// Subset to curate; `None` means every row of the artifact table.
    pub unit_ids: Option<Vec<K>>,
    pub workers: usize,
}

impl<K: UnitKey> CurationRequest<K> {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            features,
            fewshot: FewShotSets::default(),
            with_metrics: false,
            metrics: None,
            unit_ids: None,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_fewshot(mut self, fewshot: FewShotSets<K>) -> Self {
        self.fewshot = fewshot;
        self
    }

    /// Supply the metrics table and turn the metrics channel on.
    pub fn with_metrics(mut self, metrics: MetricsTable<K>) -> Self {
        self.metrics = Some(metrics);
        self.with_metrics = true;
        self
    }

    pub fn only_units(mut self, ids: Vec<K>) -> Self {
        self.unit_ids = Some(ids);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Fan-out calls per reviewer.
    pub fn calls_per_reviewer(&self) -> usize {
        self.features.len() + usize::from(self.with_metrics)
    }
}

/// Everything resolved once per batch and shared read-only by every unit.
struct Prepared<K: UnitKey> {
    ids: Vec<K>,
    /// Run handle holding the `workers` call budget.
    dispatcher: Dispatcher,
    /// Feature system context followed by that feature's few-shot block.
    prefixes: Vec<(Feature, Vec<Message>)>,
    metrics_rows: HashMap<K, String>,
}

/// Each id is curated once; a repeated id is a caller error.
pub(crate) fn reject_duplicates<K: UnitKey>(ids: &[K]) -> Result<(), EngineError> {
    let mut seen = HashSet::with_capacity(ids.len());
    match ids.iter().find(|id| !seen.insert(*id)) {
        Some(id) => Err(EngineError::DuplicateUnit(id.to_string())),
        None => Ok(()),
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct CurationEngine {
    dispatcher: Dispatcher,
    prompts: Arc<PromptSet>,
}

impl CurationEngine {
    pub fn new(dispatcher: Dispatcher, prompts: PromptSet) -> Self {
        Self {
            dispatcher,
            prompts: Arc::new(prompts),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn run<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        request: &CurationRequest<K>,
    ) -> Result<ResultTable<K, CurationRecord>, EngineError> {
        self.run_with_progress(artifacts, request, None).await
    }

    /// Curate every requested unit. Only precondition violations fail;
    /// model-call failures degrade inside the record.
    pub async fn run_with_progress<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        request: &CurationRequest<K>,
        on_progress: Option<ProgressFn>,
    ) -> Result<ResultTable<K, CurationRecord>, EngineError> {
        let prepared = self.prepare(artifacts, request)?;
        let plan = BatchPlan::new(
            request.workers,
            REVIEWERS_PER_UNIT,
            request.calls_per_reviewer(),
        );
        let progress = BatchProgress::new(prepared.ids.len()).with_callback(on_progress);

        tracing::info!(
            units = prepared.ids.len(),
            features = request.features.len(),
            with_metrics = request.with_metrics,
            fewshot = !request.fewshot.is_empty(),
            model = self.dispatcher.model_name(),
            "Starting curation"
        );

        let prepared = &prepared;
        let table = run_batch(&plan, &prepared.ids, &progress, move |unit| async move {
            self.curate_unit(artifacts, prepared, &unit).await
        })
        .await;

        let flagged = table.iter().filter(|(_, r)| r.needs_review()).count();
        if flagged > 0 {
            tracing::warn!(units = flagged, "Units had degraded calls and need review");
        }
        Ok(table)
    }

    fn prepare<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        request: &CurationRequest<K>,
    ) -> Result<Prepared<K>, EngineError> {
        if request.workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        if request.features.is_empty() {
            return Err(EngineError::NoFeatures);
        }
        self.prompts
            .ensure_covers(Variant::Curation, &request.features, request.with_metrics)?;

        let ids = match request.unit_ids {
            Some(ref ids) => ids.clone(),
            None => artifacts.ids(),
        };
        reject_duplicates(&ids)?;
        for unit in &ids {
            for &feature in &request.features {
                artifacts.require(unit, feature)?;
            }
        }

        let mut metrics_rows = HashMap::new();
        if request.with_metrics {
            let metrics = request
                .metrics
                .as_ref()
                .ok_or(EngineError::MissingMetricsTable)?;
            for unit in &ids {
                metrics_rows.insert(unit.clone(), metrics.render_row(unit)?);
            }
        }

        let fewshot = FewShotContext::build(
            artifacts,
            &request.features,
            &request.fewshot,
            Variant::Curation,
        )?;

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
            metrics_rows,
        })
    }

    async fn curate_unit<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        prepared: &Prepared<K>,
        unit: &K,
    ) -> CurationRecord {
        let verdicts = scatter_gather(1..=REVIEWERS_PER_UNIT, |reviewer| {
            self.review(artifacts, prepared, unit, reviewer)
        })
        .await;
        let record = aggregate(&verdicts);
        tracing::debug!(
            unit = %unit,
            score = record.average_score,
            classification = %record.final_classification,
            "Unit curated"
        );
        record
    }

    /// One reviewer pass: feature fan-out, then the structured synthesis.
    async fn review<K: UnitKey>(
        &self,
        artifacts: &ArtifactTable<K>,
        prepared: &Prepared<K>,
        unit: &K,
        reviewer: usize,
    ) -> ReviewerVerdict {
        let feature_reports = scatter_gather(prepared.prefixes.iter(), |(feature, prefix)| {
            self.feature_report(&prepared.dispatcher, artifacts, unit, reviewer, *feature, prefix)
        });
        let metrics_report = async {
            match prepared.metrics_rows.get(unit) {
                Some(row) => Some(self.metrics_report(&prepared.dispatcher, unit, reviewer, row).await),
                None => None,
            }
        };
        let (mut reports, metrics_report) = tokio::join!(feature_reports, metrics_report);
        reports.extend(metrics_report);

        let degraded_reports = reports.iter().filter(|r| r.degraded).count();
        if degraded_reports > 0 {
            tracing::warn!(
                unit = %unit,
                reviewer,
                degraded = degraded_reports,
                "Reviewer is synthesising over empty reports"
            );
        }

        let content = compose_report(reports.iter().map(|r| r.value.as_str()));
        let messages = [self.prompts.head_message(), Message::user_text(content)];
        let label = format!("unit {unit} reviewer {reviewer} synthesis");
        let outcome = prepared
            .dispatcher
            .judge(&label, &messages, UnitJudgment::error)
            .await;

        ReviewerVerdict {
            reviewer_id: reviewer,
            judgment: outcome.value.clamped(),
            degraded: outcome.degraded,
            degraded_reports,
        }
    }

    async fn feature_report<K: UnitKey>(
        &self,
        dispatcher: &Dispatcher,
        artifacts: &ArtifactTable<K>,
        unit: &K,
        reviewer: usize,
        feature: Feature,
        prefix: &[Message],
    ) -> CallOutcome<String> {
        let Some(image) = artifacts.get(unit, feature) else {
            tracing::error!(unit = %unit, feature = %feature, "Artifact vanished after validation");
            return CallOutcome {
                value: String::new(),
                attempts: 0,
                degraded: true,
            };
        };
        let mut messages = prefix.to_vec();
        messages.push(curation_task(image));
        let label = format!("unit {unit} reviewer {reviewer} {feature}");
        dispatcher.report(&label, &messages).await
    }

    async fn metrics_report<K: UnitKey>(
        &self,
        dispatcher: &Dispatcher,
        unit: &K,
        reviewer: usize,
        row: &str,
    ) -> CallOutcome<String> {
        let messages = match self.prompts.metrics_message() {
            Ok(system) => [system, metrics_task(row)],
            Err(err) => {
                tracing::error!(unit = %unit, error = %err, "Metrics prompt vanished after validation");
                return CallOutcome {
                    value: String::new(),
                    attempts: 0,
                    degraded: true,
                };
            }
        };
        let label = format!("unit {unit} reviewer {reviewer} metrics");
        dispatcher.report(&label, &messages).await
    }
}
