use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::curation::{RetryPolicy, Variant};

// ── Top-level config ─────────────────────────────────────────────

/// Contents of `~/.spikeagent/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Batch, retry and prompt settings.
    pub engine: EngineSection,
    /// Which vision model to call and how.
    pub model: ModelSection,
}

// ── [engine] ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineSection {
    /// Global budget of simultaneous model calls.
    pub workers: usize,
    /// Attempts per model call before degrading.
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Upper bound on one model call, in seconds. 0 disables the limit.
    pub call_timeout_secs: u64,
    /// Root of the prompt tree; `curation/` and `merge/` live beneath it.
    /// Relative paths resolve against the config file's directory.
    pub prompts_dir: String,
    /// Height of the merge composite strip, in pixels.
    pub strip_height: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: crate::curation::DEFAULT_WORKERS,
            max_attempts: crate::curation::dispatch::DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 1000,
            call_timeout_secs: 120,
            prompts_dir: "prompts".into(),
            strip_height: crate::curation::composite::DEFAULT_STRIP_HEIGHT,
        }
    }
}

impl EngineSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        let timeout = (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs));
        RetryPolicy::fixed(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
            .with_call_timeout(timeout)
    }

    /// Prompt directory for `variant`, with `~` expanded.
    pub fn prompts_dir(&self, base: &Path, variant: Variant) -> PathBuf {
        let expanded = shellexpand::tilde(&self.prompts_dir);
        let root = PathBuf::from(expanded.as_ref());
        let root = if root.is_absolute() {
            root
        } else {
            base.join(root)
        };
        root.join(variant.label())
    }
}

// ── [model] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModelSection {
    /// Model name or alias (`gpt-4o`, `claude_3_7_sonnet`, ...).
    pub name: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Override for the provider endpoint (OpenAI-compatible gateways).
    pub base_url: Option<String>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: "gpt-4o".into(),
            temperature: 0.0,
            max_tokens: 4096,
            base_url: None,
        }
    }
}
