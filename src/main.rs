use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spikeagent::config::{self, LoadedConfig};
use spikeagent::curation::{
    parse_features, required_extensions, ArtifactTable, Classification, CurationEngine,
    CurationRequest, Dispatcher, Feature, FewShotSets, MergeEngine, MergeGroups, MergeRequest,
    MetricsTable, ProgressFn, PromptSet, ResultTable, Variant, VisionModel, DEFAULT_METRICS,
};
use spikeagent::providers;

mod cli;

use cli::{Cli, Commands, CurateArgs, ExtensionsArgs, MergeArgs, RunArgs, VariantArg};

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spikeagent=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Curate(args) => curate(&loaded, args).await,
        Commands::Merge(args) => merge(&loaded, args).await,
        Commands::Extensions(args) => extensions(args),
        Commands::Config(args) => {
            if args.schema {
                println!("{}", config::json_schema()?);
            } else {
                print!("{}", toml::to_string_pretty(&loaded.config)?);
            }
            Ok(())
        }
    }
}

// ── Shared setup ─────────────────────────────────────────────────

struct Session {
    model: Arc<dyn VisionModel>,
    dispatcher: Dispatcher,
    workers: usize,
    features: Vec<Feature>,
    fewshot: FewShotSets<u64>,
}

fn session(loaded: &LoadedConfig, args: &RunArgs, variant: Variant) -> anyhow::Result<Session> {
    let mut model_section = loaded.config.model.clone();
    if let Some(ref name) = args.model {
        model_section.name = name.clone();
    }
    let model = providers::create_model(&model_section)?;

    let workers = args.workers.unwrap_or(loaded.config.engine.workers);
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let dispatcher = Dispatcher::new(model.clone())
        .with_policy(loaded.config.engine.retry_policy())
        .with_cancellation(cancel);

    let features = if args.features.is_empty() {
        variant.default_features()
    } else {
        parse_features(&args.features, variant)?
    };

    Ok(Session {
        model,
        dispatcher,
        workers,
        features,
        fewshot: FewShotSets::new(args.good.clone(), args.bad.clone()),
    })
}

/// First Ctrl-C cancels outstanding calls; the batch then finishes with
/// degraded rows instead of being killed mid-write.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding model calls");
            cancel.cancel();
        }
    });
}

fn progress_logger() -> ProgressFn {
    Box::new(|done: usize, total: usize| {
        info!(completed = done, total, "Progress");
    })
}

fn prompt_dir(loaded: &LoadedConfig, args: &RunArgs, variant: Variant) -> std::path::PathBuf {
    match args.prompts {
        Some(ref dir) => dir.clone(),
        None => loaded.config.engine.prompts_dir(&loaded.base_dir, variant),
    }
}

#[derive(Serialize)]
struct RunReport {
    run_id: String,
    generated_at: String,
    model: String,
    variant: Variant,
    rows: serde_json::Value,
}

fn write_report<R: Serialize>(
    output: Option<&Path>,
    model: &str,
    variant: Variant,
    index_name: &str,
    table: &ResultTable<u64, R>,
) -> anyhow::Result<()> {
    let report = RunReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        model: model.to_string(),
        variant,
        rows: table.to_json(index_name)?,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write results to {}", path.display()))?;
            info!(path = %path.display(), run_id = %report.run_id, "Results written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

// ── curate ───────────────────────────────────────────────────────

async fn curate(loaded: &LoadedConfig, args: CurateArgs) -> anyhow::Result<()> {
    let session = session(loaded, &args.run, Variant::Curation)?;
    let artifacts = ArtifactTable::load_json(&args.run.artifacts)?;

    let metric_names: Vec<String> = if args.metrics.is_empty() {
        DEFAULT_METRICS.iter().map(|m| m.to_string()).collect()
    } else {
        args.metrics.clone()
    };

    let mut request = CurationRequest::new(session.features.clone())
        .with_fewshot(session.fewshot.clone())
        .with_workers(session.workers);
    let mut selected_metrics = None;
    if args.with_metrics {
        let path = args
            .metrics_file
            .as_deref()
            .context("--with-metrics needs --metrics-file")?;
        let table = MetricsTable::load_json(path)?.select(&metric_names)?;
        selected_metrics = Some(table.columns().to_vec());
        request = request.with_metrics(table);
    }
    if !args.units.is_empty() {
        request = request.only_units(args.units.clone());
    }

    let prompts = PromptSet::load(
        &prompt_dir(loaded, &args.run, Variant::Curation),
        Variant::Curation,
        &session.features,
        !session.fewshot.is_empty(),
        selected_metrics.as_deref(),
    )?;

    let engine = CurationEngine::new(session.dispatcher, prompts);
    let table = engine
        .run_with_progress(&artifacts, &request, Some(progress_logger()))
        .await?;

    let good = table
        .iter()
        .filter(|(_, r)| r.final_classification == Classification::Good)
        .count();
    let flagged = table.iter().filter(|(_, r)| r.needs_review()).count();
    info!(
        units = table.len(),
        good,
        bad = table.len() - good,
        needs_review = flagged,
        "Curation finished"
    );

    write_report(
        args.run.output.as_deref(),
        session.model.name(),
        Variant::Curation,
        "unit_id",
        &table,
    )
}

// ── merge ────────────────────────────────────────────────────────

fn load_groups(path: &Path) -> anyhow::Result<MergeGroups<u64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading merge groups {}", path.display()))?;
    let groups: BTreeMap<u64, Vec<u64>> =
        serde_json::from_str(&raw).context("merge groups are not valid JSON")?;
    Ok(groups)
}

async fn merge(loaded: &LoadedConfig, args: MergeArgs) -> anyhow::Result<()> {
    let session = session(loaded, &args.run, Variant::Merge)?;
    let artifacts = ArtifactTable::load_json(&args.run.artifacts)?;
    let groups = load_groups(&args.groups)?;

    let mut request = MergeRequest::new(session.features.clone())
        .with_fewshot(session.fewshot.clone())
        .with_workers(session.workers);
    if !args.group_ids.is_empty() {
        request = request.only_groups(args.group_ids.clone());
    }

    let prompts = PromptSet::load(
        &prompt_dir(loaded, &args.run, Variant::Merge),
        Variant::Merge,
        &session.features,
        !session.fewshot.is_empty(),
        None,
    )?;

    let engine = MergeEngine::new(session.dispatcher, prompts)
        .with_strip_height(loaded.config.engine.strip_height);
    let table = engine
        .run_with_progress(&artifacts, &groups, &request, Some(progress_logger()))
        .await?;

    let merges = table.iter().filter(|(_, r)| r.should_merge()).count();
    let undecided = table.iter().filter(|(_, r)| r.is_undecided()).count();
    let flagged = table.iter().filter(|(_, r)| r.needs_review()).count();
    info!(
        groups = table.len(),
        merges,
        undecided,
        needs_review = flagged,
        "Merge review finished"
    );

    write_report(
        args.run.output.as_deref(),
        session.model.name(),
        Variant::Merge,
        "group_id",
        &table,
    )
}

// ── extensions ───────────────────────────────────────────────────

fn extensions(args: ExtensionsArgs) -> anyhow::Result<()> {
    let variant = match args.variant {
        VariantArg::Curation => Variant::Curation,
        VariantArg::Merge => Variant::Merge,
    };
    let features = if args.features.is_empty() {
        variant.default_features()
    } else {
        parse_features(&args.features, variant)?
    };
    let with_metrics = args.with_metrics && variant == Variant::Curation;
    for extension in required_extensions(&features, with_metrics) {
        println!("{extension}");
    }
    Ok(())
}
