use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::frame::DEFAULT_BUFFER_CAPACITY;
use crate::ingest::VisionApiConfig;
use crate::pipeline::{PipelineSettings, PipelineShape};
use crate::upload::DataverseConfig;

const DEFAULT_SOURCE_ENDPOINT: &str = "http://127.0.0.1:5000";
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONTENT_TYPE: &str = "image/png";
const DEFAULT_REPOSITORY_ENDPOINT: &str = "http://localhost:8080";
const DEFAULT_REPOSITORY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PERIOD_MS: u64 = 1_000;
const DEFAULT_FETCH_PERIOD_MS: u64 = 1_000;
const DEFAULT_UPLOAD_PERIOD_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct UplinkConfigFile {
    source: Option<SourceConfigFile>,
    repository: Option<RepositoryConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RepositoryConfigFile {
    endpoint: Option<String>,
    token: Option<String>,
    persistent_id: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    mode: Option<PipelineMode>,
    period_ms: Option<u64>,
    fetch_period_ms: Option<u64>,
    upload_period_ms: Option<u64>,
    buffer_capacity: Option<usize>,
}

/// Which worker layout to run.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    #[default]
    Combined,
    Split,
}

impl std::str::FromStr for PipelineMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "combined" => Ok(PipelineMode::Combined),
            "split" => Ok(PipelineMode::Split),
            other => Err(anyhow!(
                "unknown pipeline mode '{}'; expected combined or split",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub source: VisionApiConfig,
    pub repository: DataverseConfig,
    pub mode: PipelineMode,
    pub period: Duration,
    pub fetch_period: Duration,
    pub upload_period: Duration,
    pub buffer_capacity: usize,
}

impl UplinkConfig {
    /// Load from the file named by `UPLINK_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("UPLINK_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults when `None`), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: UplinkConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let repository = file.repository.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();

        Self {
            source: VisionApiConfig {
                endpoint: source
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_SOURCE_ENDPOINT.to_string()),
                timeout: Duration::from_millis(
                    source.timeout_ms.unwrap_or(DEFAULT_SOURCE_TIMEOUT_MS),
                ),
                content_type: source
                    .content_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            },
            repository: DataverseConfig {
                endpoint: repository
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_REPOSITORY_ENDPOINT.to_string()),
                token: repository.token.unwrap_or_default(),
                persistent_id: repository.persistent_id.unwrap_or_default(),
                timeout: Duration::from_millis(
                    repository
                        .timeout_ms
                        .unwrap_or(DEFAULT_REPOSITORY_TIMEOUT_MS),
                ),
            },
            mode: pipeline.mode.unwrap_or_default(),
            period: Duration::from_millis(pipeline.period_ms.unwrap_or(DEFAULT_PERIOD_MS)),
            fetch_period: Duration::from_millis(
                pipeline.fetch_period_ms.unwrap_or(DEFAULT_FETCH_PERIOD_MS),
            ),
            upload_period: Duration::from_millis(
                pipeline.upload_period_ms.unwrap_or(DEFAULT_UPLOAD_PERIOD_MS),
            ),
            buffer_capacity: pipeline.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("UPLINK_SOURCE_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.source.endpoint = endpoint;
            }
        }
        if let Ok(endpoint) = std::env::var("UPLINK_REPOSITORY_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.repository.endpoint = endpoint;
            }
        }
        if let Ok(token) = std::env::var("UPLINK_REPOSITORY_TOKEN") {
            if !token.trim().is_empty() {
                self.repository.token = token;
            }
        }
        if let Ok(pid) = std::env::var("UPLINK_DATASET_PID") {
            if !pid.trim().is_empty() {
                self.repository.persistent_id = pid;
            }
        }
        if let Ok(mode) = std::env::var("UPLINK_MODE") {
            if !mode.trim().is_empty() {
                self.mode = mode.parse()?;
            }
        }
        if let Ok(capacity) = std::env::var("UPLINK_BUFFER_CAPACITY") {
            self.buffer_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("UPLINK_BUFFER_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_endpoint("source.endpoint", &self.source.endpoint)?;
        validate_endpoint("repository.endpoint", &self.repository.endpoint)?;
        if self.repository.token.trim().is_empty() {
            return Err(anyhow!(
                "repository token must be set (repository.token or UPLINK_REPOSITORY_TOKEN)"
            ));
        }
        if self.repository.persistent_id.trim().is_empty() {
            return Err(anyhow!(
                "dataset persistent id must be set (repository.persistent_id or UPLINK_DATASET_PID)"
            ));
        }
        self.source
            .content_type
            .parse::<mime::Mime>()
            .map_err(|e| {
                anyhow!(
                    "source.content_type '{}' is not a valid mime type: {}",
                    self.source.content_type,
                    e
                )
            })?;
        if self.buffer_capacity == 0 {
            return Err(anyhow!("buffer capacity must be greater than zero"));
        }
        for (name, period) in [
            ("period", self.period),
            ("fetch_period", self.fetch_period),
            ("upload_period", self.upload_period),
        ] {
            if period.is_zero() {
                return Err(anyhow!("pipeline {} must be greater than zero", name));
            }
        }
        if self.source.timeout.is_zero() || self.repository.timeout.is_zero() {
            return Err(anyhow!("request timeouts must be greater than zero"));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let shape = match self.mode {
            PipelineMode::Combined => PipelineShape::Combined {
                period: self.period,
            },
            PipelineMode::Split => PipelineShape::Split {
                fetch_period: self.fetch_period,
                upload_period: self.upload_period,
            },
        };
        PipelineSettings {
            shape,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

fn read_config_file(path: &Path) -> Result<UplinkConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn validate_endpoint(name: &str, endpoint: &str) -> Result<()> {
    Url::parse(endpoint).map_err(|e| anyhow!("{} '{}' is not a valid url: {}", name, endpoint, e))?;
    Ok(())
}
