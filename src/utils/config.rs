//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `FSDP_*` environment variables override config file values.
//! Example: `FSDP_STEPS=20` overrides `training.steps`,
//! `FSDP_ENGINE__FORWARD_PREFETCH=true` overrides `engine.forward_prefetch`.

use crate::utils::error::{FsdpError, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Sharding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logical mesh shape; its product must equal the world size
    #[serde(default = "default_mesh_shape")]
    pub mesh_shape: Vec<usize>,

    /// Mesh dimension whose sub-group shards the parameters
    #[serde(default)]
    pub shard_mesh_dim: usize,

    /// Tensor dimension parameters are split along
    #[serde(default)]
    pub shard_dim: usize,

    /// Device the unsharded parameters and forward inputs live on
    #[serde(default = "default_device")]
    pub device: String,

    /// Free non-root unsharded buffers at forward exit
    #[serde(default = "default_true")]
    pub reshard_after_forward: bool,

    /// Issue the next group's all-gather while the current group computes
    #[serde(default)]
    pub forward_prefetch: bool,
}

/// Training loop configuration used by the launcher and parity harness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    #[serde(default = "default_steps")]
    pub steps: usize,

    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Seed for parameter init; inputs use `seed + rank + 1`
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Artificial delays (milliseconds) used to exercise overlap
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub after_forward_ms: u64,

    #[serde(default)]
    pub before_all_gather_ms: u64,

    #[serde(default)]
    pub before_reduce_scatter_ms: u64,

    #[serde(default)]
    pub before_optim_ms: u64,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FsdpConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub delays: DelayConfig,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_mesh_shape() -> Vec<usize> { vec![2] }
fn default_device() -> String { "cpu".to_string() }
fn default_true() -> bool { true }
fn default_world_size() -> usize { 2 }
fn default_steps() -> usize { 10 }
fn default_lr() -> f64 { 1e-2 }
fn default_batch_size() -> usize { 8 }
fn default_hidden_dim() -> usize { 32 }
fn default_num_layers() -> usize { 3 }
fn default_seed() -> u64 { 42 }
fn default_log_format() -> String { "pretty".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mesh_shape: default_mesh_shape(),
            shard_mesh_dim: 0,
            shard_dim: 0,
            device: default_device(),
            reshard_after_forward: true,
            forward_prefetch: false,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            steps: default_steps(),
            learning_rate: default_lr(),
            batch_size: default_batch_size(),
            hidden_dim: default_hidden_dim(),
            num_layers: default_num_layers(),
            seed: default_seed(),
        }
    }
}

impl EngineConfig {
    /// Resolve the configured device string (`cpu`, `cuda`, `cuda:N`, `metal:N`).
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }
}

/// Parse a device string into a candle device.
pub fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_lowercase();
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, idx)) => {
            let ordinal = idx
                .parse::<usize>()
                .map_err(|_| FsdpError::Config(format!("Invalid device ordinal in '{}'", spec)))?;
            (kind.to_string(), ordinal)
        }
        None => (spec.clone(), 0),
    };

    match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(ordinal)?),
        "metal" => Ok(Device::new_metal(ordinal)?),
        other => Err(FsdpError::Config(format!("Unknown device kind: {}", other))),
    }
}

impl DelayConfig {
    pub fn after_forward(&self) -> Option<Duration> {
        non_zero(self.after_forward_ms)
    }

    pub fn before_all_gather(&self) -> Option<Duration> {
        non_zero(self.before_all_gather_ms)
    }

    pub fn before_reduce_scatter(&self) -> Option<Duration> {
        non_zero(self.before_reduce_scatter_ms)
    }

    pub fn before_optim(&self) -> Option<Duration> {
        non_zero(self.before_optim_ms)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl FsdpConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| FsdpError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration from a file, then apply `FSDP_*` overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(config_key) = key.strip_prefix("FSDP_") else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["engine", field] => self.apply_engine_override(field, &value),
                ["training", field] => self.apply_training_override(field, &value),
                ["delays", field] => self.apply_delay_override(field, &value),
                ["log_format"] => self.log_format = value.to_string(),
                [field] => {
                    self.apply_engine_override(field, &value);
                    self.apply_training_override(field, &value);
                    self.apply_delay_override(field, &value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_engine_override(&mut self, field: &str, value: &str) {
        match field {
            "mesh_shape" => {
                let parsed: std::result::Result<Vec<usize>, _> =
                    value.split(',').map(|s| s.trim().parse()).collect();
                if let Ok(shape) = parsed { self.engine.mesh_shape = shape; }
            }
            "shard_mesh_dim" => if let Ok(v) = value.parse() { self.engine.shard_mesh_dim = v; }
            "shard_dim" => if let Ok(v) = value.parse() { self.engine.shard_dim = v; }
            "device" => self.engine.device = value.to_string(),
            "reshard_after_forward" => self.engine.reshard_after_forward = parse_bool(value),
            "forward_prefetch" | "prefetch" => self.engine.forward_prefetch = parse_bool(value),
            _ => {}
        }
    }

    fn apply_training_override(&mut self, field: &str, value: &str) {
        match field {
            "world_size" => if let Ok(v) = value.parse() { self.training.world_size = v; }
            "steps" => if let Ok(v) = value.parse() { self.training.steps = v; }
            "learning_rate" | "lr" => if let Ok(v) = value.parse() { self.training.learning_rate = v; }
            "batch_size" => if let Ok(v) = value.parse() { self.training.batch_size = v; }
            "hidden_dim" => if let Ok(v) = value.parse() { self.training.hidden_dim = v; }
            "num_layers" => if let Ok(v) = value.parse() { self.training.num_layers = v; }
            "seed" => if let Ok(v) = value.parse() { self.training.seed = v; }
            _ => {}
        }
    }

    fn apply_delay_override(&mut self, field: &str, value: &str) {
        match field {
            "after_forward_ms" => if let Ok(v) = value.parse() { self.delays.after_forward_ms = v; }
            "before_all_gather_ms" => if let Ok(v) = value.parse() { self.delays.before_all_gather_ms = v; }
            "before_reduce_scatter_ms" => if let Ok(v) = value.parse() { self.delays.before_reduce_scatter_ms = v; }
            "before_optim_ms" => if let Ok(v) = value.parse() { self.delays.before_optim_ms = v; }
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        let mesh_size: usize = self.engine.mesh_shape.iter().product();
        if self.engine.mesh_shape.is_empty() || mesh_size != self.training.world_size {
            return Err(FsdpError::InvalidMeshShape(format!(
                "mesh shape {:?} covers {} ranks but world_size is {}",
                self.engine.mesh_shape, mesh_size, self.training.world_size
            )));
        }

        if self.engine.shard_mesh_dim >= self.engine.mesh_shape.len() {
            return Err(FsdpError::Config(format!(
                "shard_mesh_dim ({}) out of range for mesh shape {:?}",
                self.engine.shard_mesh_dim, self.engine.mesh_shape
            )));
        }

        if self.training.hidden_dim == 0 || self.training.num_layers == 0 {
            return Err(FsdpError::Config(
                "hidden_dim and num_layers must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
