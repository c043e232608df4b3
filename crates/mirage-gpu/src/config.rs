use serde::Deserialize;

use crate::backend::BackendKind;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const ENV_QUEUE_CAPACITY: &str = "MIRAGE_GPU_QUEUE_CAPACITY";
pub const ENV_BACKEND: &str = "MIRAGE_GPU_BACKEND";
pub const ENV_SURFACE: &str = "MIRAGE_GPU_SURFACE";

/// Construction-time settings of a [`GraphicsPipeline`](crate::GraphicsPipeline).
///
/// Nothing here can change once the pipeline is running.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Maximum number of submitted lists waiting for the dispatcher.
    pub queue_capacity: usize,
    pub backend: BackendKind,
    pub surface_width: u32,
    pub surface_height: u32,
    /// Name of the dispatcher thread.
    pub thread_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backend: BackendKind::Soft,
            surface_width: 640,
            surface_height: 480,
            thread_name: "mirage-gpu-dispatch".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env var {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("surface size {0}x{1} is empty")]
    EmptySurface(u32, u32),
}

impl PipelineConfig {
    /// Defaults overridden by the `MIRAGE_GPU_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a caller-supplied variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            config.queue_capacity = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_QUEUE_CAPACITY,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_BACKEND) {
            config.backend = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_BACKEND,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_SURFACE) {
            let (w, h) = parse_surface(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                var: ENV_SURFACE,
                value: raw.clone(),
            })?;
            config.surface_width = w;
            config.surface_height = h;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.surface_width == 0 || self.surface_height == 0 {
            return Err(ConfigError::EmptySurface(
                self.surface_width,
                self.surface_height,
            ));
        }
        Ok(())
    }
}

/// Parses `WIDTHxHEIGHT`.
fn parse_surface(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(|c: char| c == 'x' || c == 'X')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}
