//! End-to-end engine behaviour against the scripted model.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::testing::{FailMode, ScriptedModel};
use super::*;

const CURATION_FEATURES: [Feature; 4] = [
    Feature::WaveformSingle,
    Feature::WaveformMulti,
    Feature::Autocorr,
    Feature::SpikeLocations,
];

fn fast() -> RetryPolicy {
    RetryPolicy::fixed(10, Duration::from_millis(1))
}

fn artifacts(ids: &[u64], features: &[Feature]) -> ArtifactTable<u64> {
    let mut table = ArtifactTable::new();
    for &id in ids {
        for &feature in features {
            table.insert(id, feature, EncodedImage::new(format!("{id}-{feature}")));
        }
    }
    table
}

fn curation_prompts(features: &[Feature]) -> PromptSet {
    features
        .iter()
        .fold(PromptSet::new(Variant::Curation, "HEAD"), |set, &f| {
            set.with_feature(f, format!("SYS {f}"))
        })
        .with_metrics("METRICS SYS")
}

fn curation_engine(model: Arc<ScriptedModel>, features: &[Feature]) -> CurationEngine {
    let dispatcher = Dispatcher::new(model).with_policy(fast());
    CurationEngine::new(dispatcher, curation_prompts(features))
}

fn judgment(score: f64, class: &str) -> serde_json::Value {
    json!({
        "reasoning": format!("{class} at {score}"),
        "unit_quality_score": score,
        "classification": class
    })
}

// ── Curation ─────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_rows_are_sorted_with_consensus() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model.clone(), &features);

    let request = CurationRequest::new(features.to_vec()).only_units(vec![3, 1, 2]);
    let table = engine
        .run(&artifacts(&[3, 1, 2], &features), &request)
        .await
        .unwrap();

    assert_eq!(table.ids(), vec![1, 2, 3]);
    for (_, record) in table.iter() {
        assert_eq!(record.average_score, 0.8);
        assert_eq!(record.final_classification, Classification::Good);
        assert_eq!(record.reviewers.len(), REVIEWERS_PER_UNIT);
        assert!(!record.needs_review());
    }
    assert_eq!(model.text_calls(), 3 * 3 * 2);
    assert_eq!(model.structured_calls(), 3 * 3);
}

#[tokio::test]
async fn ordering_is_stable_under_jitter() {
    let features = [Feature::Autocorr];
    let ids: Vec<u64> = vec![7, 3, 11, 1, 9, 5, 12, 2, 8, 4, 10, 6];
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_jitter(15));
    let engine = curation_engine(model, &features);

    let request = CurationRequest::new(features.to_vec()).with_workers(9);
    let table = engine.run(&artifacts(&ids, &features), &request).await.unwrap();

    assert_eq!(table.ids(), (1..=12).collect::<Vec<u64>>());
}

#[tokio::test]
async fn reviewer_scores_are_averaged_and_rounded() {
    let features = [Feature::Autocorr];
    let model = Arc::new(
        ScriptedModel::new(FailMode::Never)
            .with_structured(judgment(0.2, "Bad"))
            .with_structured(judgment(0.5, "Good"))
            .with_structured(judgment(0.9, "Good")),
    );
    let engine = curation_engine(model, &features);

    let table = engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();
    let record = table.get(&1).unwrap();
    assert_eq!(record.average_score, 0.53);
    assert_eq!(record.final_classification, Classification::Good);
}

#[tokio::test]
async fn error_vote_never_counts_as_good() {
    let features = [Feature::Autocorr];
    let model = Arc::new(
        ScriptedModel::new(FailMode::Never)
            .with_structured(judgment(0.9, "Good"))
            .with_structured(judgment(0.0, "Error"))
            .with_structured(judgment(0.1, "Bad")),
    );
    let engine = curation_engine(model, &features);

    let table = engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();
    let record = table.get(&1).unwrap();
    assert_eq!(record.final_classification, Classification::Bad);
    assert!(record.needs_review());
    assert_eq!(record.degraded_reviewers, 0);
}

#[tokio::test]
async fn failing_model_degrades_every_reviewer_without_erroring() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Always));
    let engine = curation_engine(model.clone(), &features);

    let table = engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();

    assert_eq!(model.text_calls(), 3 * 2 * 10);
    assert_eq!(model.structured_calls(), 3 * 10);
    let record = table.get(&1).unwrap();
    assert_eq!(record.final_classification, Classification::Bad);
    assert_eq!(record.average_score, 0.0);
    assert_eq!(record.degraded_reviewers, 3);
    assert!(record
        .reviewers
        .iter()
        .all(|v| v.classification == Classification::Error));
}

#[tokio::test]
async fn empty_feature_reports_flag_unit_for_review() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::TextAlways));
    let engine = curation_engine(model.clone(), &features);

    let table = engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();

    let record = table.get(&1).unwrap();
    assert_eq!(record.final_classification, Classification::Good);
    assert_eq!(record.degraded_reviewers, 0);
    assert_eq!(record.degraded_reports, 3 * 2);
    assert!(record.needs_review());
    let json = serde_json::to_value(record).unwrap();
    assert_eq!(json["degraded_reports"], 6);
    assert_eq!(json["needs_review"], true);
}

#[tokio::test]
async fn transient_failures_are_invisible() {
    let features = [Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::First(4)));
    let engine = curation_engine(model, &features);

    let table = engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();
    let record = table.get(&1).unwrap();
    assert_eq!(record.final_classification, Classification::Good);
    assert!(!record.needs_review());
}

#[tokio::test]
async fn peak_calls_stay_within_worker_budget() {
    let ids: Vec<u64> = (1..=20).collect();
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_jitter(5));
    let engine = curation_engine(model.clone(), &CURATION_FEATURES);

    let request = CurationRequest::new(CURATION_FEATURES.to_vec()).with_workers(50);
    let table = engine
        .run(&artifacts(&ids, &CURATION_FEATURES), &request)
        .await
        .unwrap();

    assert_eq!(table.len(), 20);
    assert!(model.peak_in_flight() <= 50, "peak {}", model.peak_in_flight());
    assert_eq!(model.text_calls(), 20 * 3 * 4);
}

#[tokio::test]
async fn call_budget_caps_calls_when_batch_size_clamps() {
    let ids: Vec<u64> = (1..=6).collect();
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_jitter(3));
    let engine = curation_engine(model.clone(), &CURATION_FEATURES);

    let request = CurationRequest::new(CURATION_FEATURES.to_vec()).with_workers(5);
    engine
        .run(&artifacts(&ids, &CURATION_FEATURES), &request)
        .await
        .unwrap();

    assert!(model.peak_in_flight() <= 5, "peak {}", model.peak_in_flight());
}

#[tokio::test]
async fn zero_shot_calls_carry_no_example_block() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model.clone(), &features);

    engine
        .run(&artifacts(&[1, 2], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();

    for call in model.text_log() {
        assert_eq!(call.len(), 2);
        assert_eq!(call[0].role, Role::System);
        assert!(call[0].text().starts_with("SYS "));
        assert_eq!(call[1].text(), "Assess the quality of this feature image");
    }
}

#[tokio::test]
async fn few_shot_adds_one_message_per_category_per_feature() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model.clone(), &features);

    let request = CurationRequest::new(features.to_vec())
        .with_fewshot(FewShotSets::new(vec![1, 2], vec![3]))
        .only_units(vec![4]);
    engine
        .run(&artifacts(&[1, 2, 3, 4], &features), &request)
        .await
        .unwrap();

    let log = model.text_log();
    assert_eq!(log.len(), 3 * 2);
    for call in log {
        assert_eq!(call.len(), 4);
        let feature: Feature = call[0]
            .text()
            .trim_start_matches("SYS ")
            .parse()
            .unwrap();

        let good: Vec<String> = call[1].images().map(|i| i.as_str().to_string()).collect();
        assert_eq!(good, vec![format!("1-{feature}"), format!("2-{feature}")]);
        let bad: Vec<String> = call[2].images().map(|i| i.as_str().to_string()).collect();
        assert_eq!(bad, vec![format!("3-{feature}")]);

        let task: Vec<&str> = call[3].images().map(EncodedImage::as_str).collect();
        assert_eq!(task, vec![format!("4-{feature}")]);
    }
}

#[tokio::test]
async fn metrics_channel_is_gated() {
    let features = [Feature::Autocorr];
    let mut metrics = MetricsTable::new(["snr", "l_ratio"]);
    metrics.insert_row(1u64, vec![5.0, 0.1]).unwrap();

    let is_metrics_call = |call: &Vec<Message>| call[0].text() == "METRICS SYS";

    let off = Arc::new(ScriptedModel::new(FailMode::Never));
    let mut request = CurationRequest::new(features.to_vec()).with_metrics(metrics.clone());
    request.with_metrics = false;
    curation_engine(off.clone(), &features)
        .run(&artifacts(&[1], &features), &request)
        .await
        .unwrap();
    assert_eq!(off.text_log().iter().filter(|c| is_metrics_call(*c)).count(), 0);

    let on = Arc::new(ScriptedModel::new(FailMode::Never));
    let request = CurationRequest::new(features.to_vec()).with_metrics(metrics);
    curation_engine(on.clone(), &features)
        .run(&artifacts(&[1], &features), &request)
        .await
        .unwrap();
    let log = on.text_log();
    let metrics_calls: Vec<_> = log.iter().filter(|c| is_metrics_call(*c)).collect();
    assert_eq!(metrics_calls.len(), REVIEWERS_PER_UNIT);
    assert_eq!(
        metrics_calls[0][1].text(),
        "These are the quality metrics of this unit. Assess the quality. - snr: 5.00000,l_ratio: 0.10000"
    );
}

#[tokio::test]
async fn synthesis_sees_head_and_composed_reports() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model.clone(), &features);

    engine
        .run(&artifacts(&[1], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();

    let dashes = "-".repeat(50);
    let expected = format!(
        "These are the quality assessment report from Visual Language Model\n{dashes}\n\
         finding for: Assess the quality of this feature image\n{dashes}\n\
         finding for: Assess the quality of this feature image"
    );
    for call in model.structured_log() {
        assert_eq!(call.len(), 2);
        assert_eq!(call[0].text(), "HEAD");
        assert_eq!(call[1].text(), expected);
    }
}

#[tokio::test]
async fn progress_advances_once_per_unit() {
    let features = [Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model, &features);

    let ticks = Arc::new(AtomicUsize::new(0));
    let seen = ticks.clone();
    let callback: ProgressFn = Box::new(move |_done: usize, _total: usize| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    engine
        .run_with_progress(
            &artifacts(&[1, 2, 3, 4], &features),
            &CurationRequest::new(features.to_vec()),
            Some(callback),
        )
        .await
        .unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cancelled_batch_degrades_without_calling_model() {
    let features = [Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let dispatcher = Dispatcher::new(model.clone())
        .with_policy(fast())
        .with_cancellation(cancel);
    let engine = CurationEngine::new(dispatcher, curation_prompts(&features));

    let table = engine
        .run(&artifacts(&[1, 2], &features), &CurationRequest::new(features.to_vec()))
        .await
        .unwrap();
    assert_eq!(model.text_calls() + model.structured_calls(), 0);
    assert!(table.iter().all(|(_, r)| r.needs_review()));
}

#[tokio::test]
async fn preconditions_are_rejected_before_dispatch() {
    let features = [Feature::WaveformSingle, Feature::Autocorr];
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let engine = curation_engine(model.clone(), &features);
    let table = artifacts(&[1, 2], &features);

    let err = engine
        .run(&table, &CurationRequest::new(features.to_vec()).only_units(vec![9]))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::UnknownUnit("9".into()));

    let err = engine
        .run(&table, &CurationRequest::new(features.to_vec()).only_units(vec![2, 1, 2]))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::DuplicateUnit("2".into()));

    let err = engine
        .run(&table, &CurationRequest::new(features.to_vec()).with_workers(0))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NoWorkers);

    let err = engine
        .run(&table, &CurationRequest::new(vec![Feature::AmplitudePlot]))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::MissingPrompt(Feature::AmplitudePlot));

    let mut request = CurationRequest::new(features.to_vec());
    request.with_metrics = true;
    let err = engine.run(&table, &request).await.unwrap_err();
    assert_eq!(err, EngineError::MissingMetricsTable);

    let err = engine
        .run(
            &table,
            &CurationRequest::new(features.to_vec()).with_metrics(MetricsTable::new(["snr"])),
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::MissingMetricsRow("1".into()));

    let err = engine
        .run(
            &table,
            &CurationRequest::new(features.to_vec())
                .with_fewshot(FewShotSets::new(vec![42], vec![])),
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::UnknownExample("42".into()));

    let mut partial = artifacts(&[1], &features);
    partial.insert(2, Feature::Autocorr, EncodedImage::new("only one"));
    let err = engine
        .run(&partial, &CurationRequest::new(features.to_vec()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::MissingArtifact {
            unit: "2".into(),
            feature: Feature::WaveformSingle,
        }
    );

    assert_eq!(model.text_calls() + model.structured_calls(), 0);
}

// ── Merge ────────────────────────────────────────────────────────

const MERGE_FEATURES: [Feature; 2] = [Feature::WaveformSingle, Feature::Crosscorrelograms];

fn png(shade: u8) -> EncodedImage {
    let img = RgbImage::from_pixel(12, 6, Rgb([shade, shade, shade]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    EncodedImage::new(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

fn merge_fixture(decodable: bool) -> (ArtifactTable<u64>, MergeGroups<u64>) {
    let mut table = ArtifactTable::new();
    let mut groups = MergeGroups::new();
    for (group, units) in [(20u64, vec![3u64, 4]), (10, vec![1, 2])] {
        for (i, &feature) in MERGE_FEATURES.iter().enumerate() {
            let image = if decodable {
                png(40 * i as u8)
            } else {
                EncodedImage::new(format!("{group}-{feature}"))
            };
            table.insert(group, feature, image);
        }
        groups.insert(group, units);
    }
    (table, groups)
}

fn merge_engine(model: Arc<ScriptedModel>) -> MergeEngine {
    let prompts = MERGE_FEATURES
        .iter()
        .fold(PromptSet::new(Variant::Merge, "MERGE HEAD"), |set, &f| {
            set.with_feature(f, format!("SYS {f}"))
        });
    MergeEngine::new(Dispatcher::new(model).with_policy(fast()), prompts).with_strip_height(24)
}

fn merge_decision() -> serde_json::Value {
    json!({ "merge_type": "merge", "reasoning": "same neuron" })
}

#[tokio::test]
async fn merge_groups_are_decided_in_order() {
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_fallback(merge_decision()));
    let (table, groups) = merge_fixture(true);

    let result = merge_engine(model.clone())
        .run(&table, &groups, &MergeRequest::new(MERGE_FEATURES.to_vec()))
        .await
        .unwrap();

    assert_eq!(result.ids(), vec![10, 20]);
    let record = result.get(&10).unwrap();
    assert!(record.should_merge());
    assert_eq!(record.merge_units, vec![1, 2]);
    assert_eq!(record.reasoning, "same neuron");
    assert!(record
        .report
        .starts_with("These are the quality assessment report from Visual Language Model"));

    assert_eq!(model.text_calls(), 2 * MERGE_FEATURES.len());
    for call in model.text_log() {
        assert!(call[1].text().ends_with("of unit list: [1, 2]") || call[1].text().ends_with("of unit list: [3, 4]"));
    }
    for call in model.structured_log() {
        assert_eq!(call.len(), 3);
        assert_eq!(call[0].text(), "MERGE HEAD");
        assert!(call[1].text().starts_with("This is the feature image given of unit list: ["));
        assert_eq!(call[1].images().count(), 1);
    }
}

#[tokio::test]
async fn undecodable_images_skip_the_composite() {
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_fallback(merge_decision()));
    let (table, groups) = merge_fixture(false);

    let result = merge_engine(model.clone())
        .run(&table, &groups, &MergeRequest::new(MERGE_FEATURES.to_vec()))
        .await
        .unwrap();

    assert!(result.iter().all(|(_, r)| r.should_merge()));
    for call in model.structured_log() {
        assert_eq!(call.len(), 2);
    }
}

#[tokio::test]
async fn degraded_merge_is_undecided_not_negative() {
    let model = Arc::new(ScriptedModel::new(FailMode::StructuredAlways));
    let (table, groups) = merge_fixture(true);

    let result = merge_engine(model.clone())
        .run(&table, &groups, &MergeRequest::new(MERGE_FEATURES.to_vec()))
        .await
        .unwrap();

    let record = result.get(&20).unwrap();
    assert!(record.is_undecided());
    assert!(!record.should_merge());
    assert_eq!(record.merge_units, vec![3, 4]);
    assert_eq!(record.reasoning, "");
    assert!(!record.report.is_empty());
    assert_eq!(model.structured_calls(), 2 * 10);
}

#[tokio::test]
async fn empty_feature_reports_flag_merge_decision() {
    let model = Arc::new(ScriptedModel::new(FailMode::TextAlways).with_fallback(merge_decision()));
    let (table, groups) = merge_fixture(true);

    let result = merge_engine(model)
        .run(&table, &groups, &MergeRequest::new(MERGE_FEATURES.to_vec()))
        .await
        .unwrap();

    for (_, record) in result.iter() {
        assert!(record.should_merge());
        assert_eq!(record.degraded_reports, MERGE_FEATURES.len());
        assert!(record.needs_review());
    }
}

#[tokio::test]
async fn merge_calls_stay_within_worker_budget() {
    let model = Arc::new(
        ScriptedModel::new(FailMode::Never)
            .with_jitter(3)
            .with_fallback(merge_decision()),
    );
    let (table, groups) = merge_fixture(false);

    let request = MergeRequest::new(MERGE_FEATURES.to_vec()).with_workers(1);
    let result = merge_engine(model.clone())
        .run(&table, &groups, &request)
        .await
        .unwrap();

    assert_eq!(result.len(), 2);
    assert_eq!(model.peak_in_flight(), 1);
}

#[tokio::test]
async fn merge_few_shot_uses_merge_wording() {
    let model = Arc::new(ScriptedModel::new(FailMode::Never).with_fallback(merge_decision()));
    let (table, groups) = merge_fixture(false);

    let request = MergeRequest::new(MERGE_FEATURES.to_vec())
        .with_fewshot(FewShotSets::new(vec![20], vec![]))
        .only_groups(vec![10]);
    merge_engine(model.clone())
        .run(&table, &groups, &request)
        .await
        .unwrap();

    for call in model.text_log() {
        assert_eq!(call.len(), 3);
        assert_eq!(call[1].text(), "These are Good merge examples you must compare with");
    }
}

#[tokio::test]
async fn merge_rejects_unknown_groups_and_curation_prompts() {
    let model = Arc::new(ScriptedModel::new(FailMode::Never));
    let (table, mut groups) = merge_fixture(false);
    groups.remove(&20);

    let err = merge_engine(model.clone())
        .run(&table, &groups, &MergeRequest::new(MERGE_FEATURES.to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::UnknownGroup("20".into()));

    let err = merge_engine(model.clone())
        .run(
            &table,
            &groups,
            &MergeRequest::new(MERGE_FEATURES.to_vec()).only_groups(vec![10, 10]),
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::DuplicateUnit("10".into()));

    let wrong = MergeEngine::new(
        Dispatcher::new(model),
        curation_prompts(&[Feature::WaveformSingle]),
    );
    let err = wrong
        .run(&table, &groups, &MergeRequest::new(vec![Feature::WaveformSingle]).only_groups(vec![10]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::VariantMismatch {
            expected: Variant::Merge,
            found: Variant::Curation,
        }
    );
}
