use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use feedscan_core::config::PipelineConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CANDIDATES: &[&str] = &[
    "feedscan.toml",
    "feedscan.json",
    "config/feedscan.toml",
    "config/feedscan.json",
];

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything `feedscanctl` needs: the pipeline knobs plus where the
/// Postgres backend lives.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedscanConfig {
    /// Connection string for the queue and table store. `DATABASE_URL`
    /// overrides it.
    pub database_url: Option<String>,
    /// Connections kept in the pool; defaults to worker parallelism + 2.
    pub max_connections: Option<u32>,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

impl FeedscanConfig {
    /// Load configuration from the process environment and working
    /// directory. Evaluation order:
    /// 1) `$FEEDSCAN_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$FEEDSCAN_CONFIG_JSON` (inline JSON),
    /// 3) `feedscan.toml`, `feedscan.json` or the same under `config/`,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        Self::resolve(|key| env::var(key).ok(), Path::new("."))
    }

    /// [`Self::load_from_env`] against an arbitrary variable lookup and
    /// base directory.
    pub fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        base_dir: &Path,
    ) -> anyhow::Result<(Self, ConfigSource)> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (mut config, source) = if let Some(path) = non_empty("FEEDSCAN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            (Self::load_from_file(&path)?, ConfigSource::EnvPath(path))
        } else if let Some(raw) = non_empty("FEEDSCAN_CONFIG_JSON") {
            let parsed =
                Self::parse_json(&raw).context("failed to parse FEEDSCAN_CONFIG_JSON")?;
            (parsed, ConfigSource::EnvInline)
        } else if let Some(path) = Self::find_default_file(base_dir) {
            (Self::load_from_file(&path)?, ConfigSource::File(path))
        } else {
            (Self::default(), ConfigSource::Default)
        };

        if let Some(url) = non_empty("DATABASE_URL") {
            config.database_url = Some(url);
        }
        Ok((config, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read feedscan config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid feedscan config {}", path.display())),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid feedscan config {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse feedscan config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid feedscan config json: {err}"))
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            anyhow!("no database configured; set DATABASE_URL or database_url in the config file")
        })
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
            .unwrap_or(self.pipeline.worker.parallelism as u32 + 2)
            .max(1)
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.exists())
    }
}
