//! Server configuration
//!
//! Loaded from a TOML file; every section and field has a default so a bare
//! file (or none at all) still yields a runnable configuration. Command-line
//! flags override individual fields after loading.

use crate::source::SourceKind;
use anyhow::{bail, Context};
use can_telemetry::hub::HubConfig;
use can_telemetry::pipeline::PipelineConfig;
use can_telemetry::store::StoreConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    /// Path to the signal catalog JSON
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    /// "simulated" or "replay"
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// Emission interval for the simulated source
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Capture file for the replay source
    pub path: Option<PathBuf>,
    /// Loop the capture when it runs out
    #[serde(default = "default_repeat")]
    pub repeat: bool,
    /// Depth of the frame channel between source and pipeline
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_degraded_flush_interval_secs")]
    pub degraded_flush_interval_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer: usize,
    #[serde(default = "default_degraded_replay_buffer")]
    pub degraded_replay_buffer: usize,
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

fn default_bind() -> String {
    "127.0.0.1:9100".to_string()
}

fn default_source_kind() -> String {
    "simulated".to_string()
}

fn default_interval_ms() -> u64 {
    100
}

fn default_repeat() -> bool {
    true
}

fn default_frame_queue() -> usize {
    1024
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_degraded_flush_interval_secs() -> u64 {
    15
}

fn default_retention_hours() -> u64 {
    24
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_replay_buffer() -> usize {
    1000
}

fn default_degraded_replay_buffer() -> usize {
    100
}

fn default_client_queue() -> usize {
    64
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            interval_ms: default_interval_ms(),
            path: None,
            repeat: default_repeat(),
            frame_queue: default_frame_queue(),
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            degraded_flush_interval_secs: default_degraded_flush_interval_secs(),
            retention_hours: default_retention_hours(),
            prune_interval_secs: default_prune_interval_secs(),
            replay_buffer: default_replay_buffer(),
            degraded_replay_buffer: default_degraded_replay_buffer(),
            client_queue: default_client_queue(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config file {:?}", path))
    }
}

impl SourceSection {
    pub fn kind(&self) -> anyhow::Result<SourceKind> {
        match self.kind.as_str() {
            "simulated" => Ok(SourceKind::Simulated {
                interval: Duration::from_millis(self.interval_ms),
            }),
            "replay" => {
                let path = self
                    .path
                    .clone()
                    .context("source.kind = \"replay\" requires source.path")?;
                Ok(SourceKind::Replay {
                    path,
                    repeat: self.repeat,
                })
            }
            other => bail!("unknown source kind '{}'", other),
        }
    }
}

impl PipelineSection {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            store: StoreConfig {
                batch_size: self.batch_size,
                flush_interval: Duration::from_secs(self.flush_interval_secs),
                degraded_flush_interval: Duration::from_secs(self.degraded_flush_interval_secs),
            },
            hub: HubConfig {
                buffer_capacity: self.replay_buffer,
                degraded_buffer_capacity: self.degraded_replay_buffer,
                client_queue_capacity: self.client_queue,
            },
            retention: Duration::from_secs(self.retention_hours * 3600),
            prune_interval: Duration::from_secs(self.prune_interval_secs),
            ..PipelineConfig::default()
        }
    }
}
