//! Concrete [`VisionModel`] backends.
//!
//! * [`OpenAiModel`]: chat completions, `image_url` data URLs and
//!   `response_format: json_schema` for structured output. Works against
//!   any OpenAI-compatible endpoint via `base_url`.
//! * [`AnthropicModel`]: messages API, base64 image blocks and a forced
//!   tool call for structured output.
//!
//! [`create_model`] picks the backend from a model name or alias.

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use crate::config::ModelSection;
use crate::curation::VisionModel;

pub use anthropic::AnthropicModel;
pub use openai::OpenAiModel;

/// Per-request HTTP timeout, independent of the dispatcher's call timeout.
pub(crate) const HTTP_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

/// A model name after alias resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider: ProviderKind,
    pub model_id: String,
}

const OPENAI_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "o1",
    "gpt-4-turbo",
    "gpt-3.5-turbo",
];

const ANTHROPIC_ALIASES: &[(&str, &str)] = &[
    ("claude_4_sonnet", "claude-sonnet-4-20250514"),
    ("claude_4_opus", "claude-opus-4-20250514"),
    ("claude_3_7_sonnet", "claude-3-7-sonnet-20250219"),
    ("claude_3_5_sonnet", "claude-3-5-sonnet-20240620"),
    ("claude_3_opus", "claude-3-opus-20240229"),
    ("claude_3_haiku", "claude-3-haiku-20240307"),
    ("claude_3_sonnet", "claude-3-sonnet-20240229"),
];

/// Map a configured name to a provider and wire model id.
///
/// Known aliases resolve to pinned ids; raw `claude-*` and `gpt-*`/`o*`
/// ids pass through unchanged.
pub fn resolve_model_name(name: &str) -> anyhow::Result<ResolvedModel> {
    let name = name.trim();
    if let Some((_, id)) = ANTHROPIC_ALIASES.iter().find(|(alias, _)| *alias == name) {
        return Ok(ResolvedModel {
            provider: ProviderKind::Anthropic,
            model_id: (*id).to_string(),
        });
    }
    if name.starts_with("claude-") {
        return Ok(ResolvedModel {
            provider: ProviderKind::Anthropic,
            model_id: name.to_string(),
        });
    }
    let looks_openai = OPENAI_MODELS.contains(&name)
        || name.starts_with("gpt-")
        || (name.starts_with('o') && name[1..].starts_with(|c: char| c.is_ascii_digit()));
    if looks_openai {
        return Ok(ResolvedModel {
            provider: ProviderKind::OpenAi,
            model_id: name.to_string(),
        });
    }
    anyhow::bail!(
        "Unknown model '{name}'. Supported: {} or {}",
        OPENAI_MODELS.join(", "),
        ANTHROPIC_ALIASES
            .iter()
            .map(|(alias, _)| *alias)
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Build the backend for `section`, reading keys from the environment:
/// `OPENAI_API_KEY` / `OPENAI_API_BASE`, `ANTHROPIC_API_KEY` /
/// `ANTHROPIC_BASE_URL`. `section.base_url` wins over the env base.
pub fn create_model(section: &ModelSection) -> anyhow::Result<Arc<dyn VisionModel>> {
    let resolved = resolve_model_name(&section.name)?;
    let model: Arc<dyn VisionModel> = match resolved.provider {
        ProviderKind::OpenAi => {
            let key = env_var("OPENAI_API_KEY")
                .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            let mut model = OpenAiModel::new(key, resolved.model_id)
                .with_temperature(section.temperature)
                .with_max_tokens(section.max_tokens);
            if let Some(base) = section.base_url.clone().or_else(|| env_var("OPENAI_API_BASE")) {
                model = model.with_base_url(base);
            }
            Arc::new(model)
        }
        ProviderKind::Anthropic => {
            let key = env_var("ANTHROPIC_API_KEY")
                .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY is not set"))?;
            let mut model = AnthropicModel::new(key, resolved.model_id)
                .with_temperature(section.temperature)
                .with_max_tokens(section.max_tokens);
            if let Some(base) = section.base_url.clone().or_else(|| env_var("ANTHROPIC_BASE_URL")) {
                model = model.with_base_url(base);
            }
            Arc::new(model)
        }
    };
    tracing::info!(model = model.name(), provider = ?resolved.provider, "Vision model ready");
    Ok(model)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ── Structured reply payload ─────────────────────────────────────

/// JSON object carried by a structured-call reply.
///
/// A fenced block wins (its language tag line is dropped); otherwise the
/// outermost `{...}` span, so a judgment wrapped in prose still parses.
pub(crate) fn json_payload(text: &str) -> &str {
    if let Some(body) = fenced_body(text) {
        return body;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(open), Some(close)) if open < close => &text[open..=close],
        _ => text.trim(),
    }
}

fn fenced_body(text: &str) -> Option<&str> {
    let (_, rest) = text.split_once("```")?;
    let (block, _) = rest.split_once("```")?;
    let body = match block.split_once('\n') {
        Some((tag, body)) if !tag.trim_start().starts_with(['{', '[']) => body,
        _ => block,
    };
    Some(body.trim())
}
