//! The closed set of visual features a unit can be judged on.
//!
//! Every feature knows its wire name, the caption used in merge prompts,
//! the analyzer extension that must exist before its image can be rendered,
//! and which engine variants accept it. The table is resolved once when a
//! prompt set is built; nothing downstream dispatches on strings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::EngineError;

// ── Engine variant ───────────────────────────────────────────────

/// Which engine a feature list, prompt set, or few-shot context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Per-unit Good/Bad classification with a 3-reviewer vote.
    Curation,
    /// Per-group merge / not-merge decision with a single pass.
    Merge,
}

impl Variant {
    pub fn label(self) -> &'static str {
        match self {
            Self::Curation => "curation",
            Self::Merge => "merge",
        }
    }

    /// Every feature the variant supports, in canonical order.
    pub fn default_features(self) -> Vec<Feature> {
        Feature::ALL
            .iter()
            .copied()
            .filter(|f| f.supports(self))
            .collect()
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Feature ──────────────────────────────────────────────────────

/// One visual representation of a unit or merge group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Single-channel average waveform.
    WaveformSingle,
    /// Multi-channel template.
    WaveformMulti,
    /// Autocorrelogram of spike times.
    Autocorr,
    /// Spike location scatter plot.
    SpikeLocations,
    /// Amplitude over time.
    AmplitudePlot,
    /// Crosscorrelograms between candidate units.
    Crosscorrelograms,
    /// PCA cluster view of candidate units.
    PcaClustering,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Self::WaveformSingle,
        Self::WaveformMulti,
        Self::Autocorr,
        Self::SpikeLocations,
        Self::AmplitudePlot,
        Self::Crosscorrelograms,
        Self::PcaClustering,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::WaveformSingle => "waveform_single",
            Self::WaveformMulti => "waveform_multi",
            Self::Autocorr => "autocorr",
            Self::SpikeLocations => "spike_locations",
            Self::AmplitudePlot => "amplitude_plot",
            Self::Crosscorrelograms => "crosscorrelograms",
            Self::PcaClustering => "pca_clustering",
        }
    }

    /// Short description of what a single unit's image shows.
    pub fn caption(self) -> &'static str {
        match self {
            Self::WaveformSingle => "Single-channel average waveform",
            Self::WaveformMulti => "Multi-channel average waveform (template)",
            Self::Autocorr => "Autocorrelogram of spike times",
            Self::SpikeLocations => "Spike location scatter plot",
            Self::AmplitudePlot => "Amplitude over time plot",
            Self::Crosscorrelograms => "Crosscorrelograms between units",
            Self::PcaClustering => "PCA clustering analysis",
        }
    }

    /// Caption used in merge prompts, where an image covers a whole group.
    pub fn merge_caption(self) -> &'static str {
        match self {
            Self::WaveformSingle => "Single-channel average waveform of candidate units",
            Self::WaveformMulti => "Multi-channel template of candidate units",
            Self::Autocorr => "Autocorrelograms of candidate units",
            Self::SpikeLocations => "Spike location scatter plot of candidate units",
            Self::AmplitudePlot => "Amplitude over time plot of candidate units",
            Self::Crosscorrelograms => "Crosscorrelograms between candidate units",
            Self::PcaClustering => "PCA clustering analysis of candidate units",
        }
    }

    /// Analyzer extension the renderer needs before this image can exist.
    pub fn required_extension(self) -> &'static str {
        match self {
            Self::WaveformSingle => "waveforms",
            Self::WaveformMulti => "templates",
            Self::Autocorr | Self::Crosscorrelograms => "correlograms",
            Self::SpikeLocations => "spike_locations",
            Self::AmplitudePlot => "spike_amplitudes",
            Self::PcaClustering => "principal_components",
        }
    }

    pub fn supports(self, variant: Variant) -> bool {
        match variant {
            Variant::Curation => !matches!(self, Self::Crosscorrelograms | Self::PcaClustering),
            Variant::Merge => self != Self::Autocorr,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == needle)
            .ok_or_else(|| EngineError::UnknownFeature(needle.to_string()))
    }
}

/// Parse, de-duplicate and variant-check a list of feature names.
///
/// Order is preserved; the first occurrence of a repeated name wins.
pub fn parse_features<S: AsRef<str>>(
    names: &[S],
    variant: Variant,
) -> Result<Vec<Feature>, EngineError> {
    let mut features = Vec::with_capacity(names.len());
    for name in names {
        let feature: Feature = name.as_ref().parse()?;
        if !feature.supports(variant) {
            return Err(EngineError::UnsupportedFeature { feature, variant });
        }
        if !features.contains(&feature) {
            features.push(feature);
        }
    }
    if features.is_empty() {
        return Err(EngineError::NoFeatures);
    }
    Ok(features)
}

/// Analyzer extensions a run needs, de-duplicated and sorted.
pub fn required_extensions(features: &[Feature], with_metrics: bool) -> Vec<&'static str> {
    let mut extensions: Vec<&'static str> =
        features.iter().map(|f| f.required_extension()).collect();
    if with_metrics {
        extensions.push("quality_metrics");
    }
    extensions.sort_unstable();
    extensions.dedup();
    extensions
}
