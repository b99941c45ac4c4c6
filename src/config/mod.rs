pub mod schema;

use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::UserDirs;

pub use schema::{Config, EngineSection, ModelSection};

/// `~/.spikeagent/config.toml`.
pub fn default_path() -> anyhow::Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".spikeagent").join("config.toml"))
}

/// Loaded config plus the directory relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub base_dir: PathBuf,
}

/// Load `path`, or the default location when `None`. A missing default
/// file yields defaults; a missing explicit file is an error.
pub fn load(path: Option<&Path>) -> anyhow::Result<LoadedConfig> {
    let (path, explicit) = match path {
        Some(p) => (PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()), true),
        None => (default_path()?, false),
    };
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if !path.exists() {
        if explicit {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(LoadedConfig {
            config: Config::default(),
            base_dir: std::env::current_dir().unwrap_or(base_dir),
        });
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = from_toml(&contents)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    tracing::debug!(path = %path.display(), model = %config.model.name, "Loaded config");
    Ok(LoadedConfig { config, base_dir })
}

pub fn from_toml(contents: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(contents)?)
}

/// JSON schema of the config file, for editors and `config --schema`.
pub fn json_schema() -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&schemars::schema_for!(Config))?)
}
