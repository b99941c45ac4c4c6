//! Keyed tables flowing in and out of a batch.
//!
//! * [`ArtifactTable`]: unit → feature → encoded image (read-only input)
//! * [`MetricsTable`]: unit → row of named quality metrics (read-only input)
//! * [`ResultTable`]: unit → consensus record, sorted by unit id (output)

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use super::error::EngineError;
use super::feature::Feature;
use super::traits::EncodedImage;

/// Metrics used when the caller does not name any.
pub const DEFAULT_METRICS: [&str; 3] = ["snr", "isi_violations_ratio", "l_ratio"];

/// Anything usable as a unit or group identifier.
pub trait UnitKey: Ord + Clone + Hash + Display + Debug + Send + Sync + 'static {}

impl<T> UnitKey for T where T: Ord + Clone + Hash + Display + Debug + Send + Sync + 'static {}

// ── Artifact table ───────────────────────────────────────────────

/// Per-unit encoded feature images.
#[derive(Debug, Clone)]
pub struct ArtifactTable<K: UnitKey> {
    rows: BTreeMap<K, BTreeMap<Feature, EncodedImage>>,
}

impl<K: UnitKey> Default for ArtifactTable<K> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<K: UnitKey> ArtifactTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: K, feature: Feature, image: EncodedImage) {
        self.rows.entry(unit).or_default().insert(feature, image);
    }

    /// Builder-style insert, handy for tests and small fixtures.
    pub fn with(mut self, unit: K, feature: Feature, image: EncodedImage) -> Self {
        self.insert(unit, feature, image);
        self
    }

    pub fn row(&self, unit: &K) -> Option<&BTreeMap<Feature, EncodedImage>> {
        self.rows.get(unit)
    }

    pub fn get(&self, unit: &K, feature: Feature) -> Option<&EncodedImage> {
        self.rows.get(unit).and_then(|row| row.get(&feature))
    }

    pub fn contains(&self, unit: &K) -> bool {
        self.rows.contains_key(unit)
    }

    /// Lookup that reports which precondition failed.
    pub fn require(&self, unit: &K, feature: Feature) -> Result<&EncodedImage, EngineError> {
        let row = self
            .rows
            .get(unit)
            .ok_or_else(|| EngineError::UnknownUnit(unit.to_string()))?;
        row.get(&feature).ok_or_else(|| EngineError::MissingArtifact {
            unit: unit.to_string(),
            feature,
        })
    }

    /// Every unit id, ascending.
    pub fn ids(&self) -> Vec<K> {
        self.rows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl ArtifactTable<u64> {
    /// Load `{"<unit>": {"<feature>": "<base64>"}}` from a JSON file.
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading artifact table {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let parsed: BTreeMap<u64, BTreeMap<String, String>> =
            serde_json::from_str(raw).context("artifact table is not valid JSON")?;
        let mut table = Self::new();
        for (unit, row) in parsed {
            for (name, encoded) in row {
                let feature: Feature = name.parse()?;
                table.insert(unit, feature, EncodedImage::new(encoded));
            }
        }
        Ok(table)
    }
}

// ── Metrics table ────────────────────────────────────────────────

/// Named quality metrics, one row per unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsTable<K: UnitKey> {
    columns: Vec<String>,
    rows: HashMap<K, Vec<f64>>,
}

impl<K: UnitKey> MetricsTable<K> {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Insert one row; its width must match the column count.
    pub fn insert_row(&mut self, unit: K, values: Vec<f64>) -> Result<(), EngineError> {
        if values.len() != self.columns.len() {
            return Err(EngineError::MetricsWidth {
                unit: unit.to_string(),
                expected: self.columns.len(),
                found: values.len(),
            });
        }
        self.rows.insert(unit, values);
        Ok(())
    }

    pub fn contains(&self, unit: &K) -> bool {
        self.rows.contains_key(unit)
    }

    /// Project onto the requested columns that exist, in request order.
    ///
    /// Missing names are logged and dropped; if none survive the selection
    /// fails.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, EngineError> {
        let mut picked: Vec<(String, usize)> = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            let name = name.as_ref();
            match self.columns.iter().position(|c| c == name) {
                Some(idx) if !picked.iter().any(|(n, _)| n == name) => {
                    picked.push((name.to_string(), idx));
                }
                Some(_) => {}
                None => missing.push(name.to_string()),
            }
        }
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Requested metrics not found in metrics table");
        }
        if picked.is_empty() {
            return Err(EngineError::NoMetricsAvailable {
                requested: names.iter().map(|n| n.as_ref().to_string()).collect(),
                available: self.columns.clone(),
            });
        }
        let rows = self
            .rows
            .iter()
            .map(|(unit, values)| {
                let projected = picked.iter().map(|(_, idx)| values[*idx]).collect();
                (unit.clone(), projected)
            })
            .collect();
        Ok(Self {
            columns: picked.into_iter().map(|(n, _)| n).collect(),
            rows,
        })
    }

    /// Flatten a unit's row to `"name: value,name: value"` with 5 decimals.
    pub fn render_row(&self, unit: &K) -> Result<String, EngineError> {
        let values = self
            .rows
            .get(unit)
            .ok_or_else(|| EngineError::MissingMetricsRow(unit.to_string()))?;
        Ok(self
            .columns
            .iter()
            .zip(values)
            .map(|(name, value)| render_metric(name, *value))
            .collect::<Vec<_>>()
            .join(","))
    }
}

/// `name: 0.12346`; missing values render as lowercase `nan`.
fn render_metric(name: &str, value: f64) -> String {
    if value.is_nan() {
        format!("{name}: nan")
    } else {
        format!("{name}: {value:.5}")
    }
}

impl MetricsTable<u64> {
    /// Load `{"<unit>": {"<metric>": <number|null>}}`; absent values become NaN.
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading metrics table {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let parsed: BTreeMap<u64, BTreeMap<String, Option<f64>>> =
            serde_json::from_str(raw).context("metrics table is not valid JSON")?;
        let mut columns: Vec<String> = parsed
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();

        let mut table = Self::new(columns.clone());
        for (unit, row) in parsed {
            let values = columns
                .iter()
                .map(|c| row.get(c).copied().flatten().unwrap_or(f64::NAN))
                .collect();
            table.insert_row(unit, values)?;
        }
        Ok(table)
    }
}

// ── Result table ─────────────────────────────────────────────────

/// Consensus records keyed and sorted by unit id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable<K: UnitKey, R> {
    rows: Vec<(K, R)>,
}

impl<K: UnitKey, R> ResultTable<K, R> {
    /// Sort rows ascending by id, whatever order they completed in.
    pub fn from_unordered(mut rows: Vec<(K, R)>) -> Self {
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Self { rows }
    }

    pub fn ids(&self) -> Vec<K> {
        self.rows.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn get(&self, unit: &K) -> Option<&R> {
        self.rows
            .binary_search_by(|(k, _)| k.cmp(unit))
            .ok()
            .map(|idx| &self.rows[idx].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &R)> {
        self.rows.iter().map(|(k, r)| (k, r))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<K: UnitKey + Serialize, R: Serialize> ResultTable<K, R> {
    /// Rows as JSON objects with the id stored under `index_name`, keeping
    /// the id's own JSON type.
    pub fn to_json(&self, index_name: &str) -> anyhow::Result<serde_json::Value> {
        let mut out = Vec::with_capacity(self.rows.len());
        for (id, record) in &self.rows {
            let mut map = match serde_json::to_value(record)? {
                serde_json::Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            map.insert(index_name.to_string(), serde_json::to_value(id)?);
            out.push(serde_json::Value::Object(map));
        }
        Ok(serde_json::Value::Array(out))
    }
}
