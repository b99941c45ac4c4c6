use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "spikeagent",
    version,
    about = "Multi-reviewer VLM curation and merge review for sorted spike units"
)]
pub struct Cli {
    /// Config file (defaults to ~/.spikeagent/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify units as Good/Bad with a 3-reviewer vote.
    Curate(CurateArgs),
    /// Decide merge / not merge for candidate unit groups.
    Merge(MergeArgs),
    /// List the analyzer extensions a feature set needs.
    Extensions(ExtensionsArgs),
    /// Print the effective config, or its JSON schema.
    Config(ConfigArgs),
}

/// Options shared by both engines.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// JSON artifact table: `{"<id>": {"<feature>": "<base64 jpeg>"}}`.
    #[arg(long)]
    pub artifacts: PathBuf,

    /// Comma-separated features; defaults to every feature the engine supports.
    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,

    /// Ids of known-good examples for few-shot context.
    #[arg(long, value_delimiter = ',')]
    pub good: Vec<u64>,

    /// Ids of known-bad examples for few-shot context.
    #[arg(long, value_delimiter = ',')]
    pub bad: Vec<u64>,

    /// Override `[engine] workers`.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override `[model] name`.
    #[arg(long)]
    pub model: Option<String>,

    /// Prompt directory for this engine (overrides `[engine] prompts_dir`).
    #[arg(long)]
    pub prompts: Option<PathBuf>,

    /// Write results here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CurateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Add the quantitative metrics channel.
    #[arg(long, default_value_t = false)]
    pub with_metrics: bool,

    /// JSON metrics table: `{"<id>": {"<metric>": <number>}}`.
    #[arg(long, required_if_eq("with_metrics", "true"))]
    pub metrics_file: Option<PathBuf>,

    /// Metrics to show the model (defaults to snr, isi_violations_ratio, l_ratio).
    #[arg(long = "metric", value_delimiter = ',')]
    pub metrics: Vec<String>,

    /// Only curate these unit ids.
    #[arg(long, value_delimiter = ',')]
    pub units: Vec<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// JSON merge groups: `{"<group id>": [<unit id>, ...]}`.
    #[arg(long)]
    pub groups: PathBuf,

    /// Only review these group ids.
    #[arg(long, value_delimiter = ',')]
    pub group_ids: Vec<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum VariantArg {
    Curation,
    Merge,
}

#[derive(Args, Debug, Clone)]
pub struct ExtensionsArgs {
    #[arg(long, value_enum, default_value_t = VariantArg::Curation)]
    pub variant: VariantArg,

    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub with_metrics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Print the JSON schema instead of the effective values.
    #[arg(long, default_value_t = false)]
    pub schema: bool,
}
