//! Configuration management for the overlay commit core
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It covers the window pool size, the timing of the
//! retry and fence waits, and the static description of each output.

use crate::mask::MAX_WINDOWS;
use crate::output::OutputKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// Hardware window pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Retry and wait timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Outputs registered at startup
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// Window pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of hardware windows (1-32)
    pub windows: u8,
}

/// Timing of the allocator and commit waits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a growing output waits for in-flight windows before giving up (ms)
    pub retry_wait_ms: u64,

    /// Refresh rate assumed for outputs that do not report one (Hz)
    pub default_refresh_hz: u32,

    /// Frame intervals before a fence wait logs a warning
    pub fence_soft_frames: u32,

    /// Hard bound on the total fence wait (ms, 0 = unbounded)
    pub fence_timeout_ms: u64,

    /// How long the worker waits for the hardware to retire a frame (ms)
    pub frame_done_timeout_ms: u64,
}

/// Static capability data of one output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Connector name, unique across outputs
    pub name: String,

    /// "panel", "external" or "writeback"
    pub kind: OutputKind,

    /// Most windows the output can composite at once
    pub max_windows: u8,

    /// Refresh rate (Hz); the timing default applies when absent
    #[serde(default)]
    pub refresh_hz: Option<u32>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            timing: TimingConfig::default(),
            outputs: vec![
                OutputConfig::new("DSI-1", OutputKind::Panel, 6).with_refresh(60),
                OutputConfig::new("DP-1", OutputKind::External, 4),
                OutputConfig::new("WB-1", OutputKind::Writeback, 1),
            ],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { windows: 8 }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_wait_ms: 20,
            default_refresh_hz: 60,
            fence_soft_frames: 5,
            fence_timeout_ms: 3000,
            frame_done_timeout_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    /// `None` when fence waits are unbounded
    pub fn fence_timeout(&self) -> Option<Duration> {
        if self.fence_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.fence_timeout_ms))
        }
    }

    pub fn frame_done_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_done_timeout_ms)
    }
}

impl OutputConfig {
    pub fn new(name: impl Into<String>, kind: OutputKind, max_windows: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            max_windows,
            refresh_hz: None,
        }
    }

    pub fn with_refresh(mut self, hz: u32) -> Self {
        self.refresh_hz = Some(hz);
        self
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: CoreConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.windows == 0 || self.pool.windows > MAX_WINDOWS {
            anyhow::bail!("Invalid pool size {}: must be between 1 and {}", self.pool.windows, MAX_WINDOWS);
        }

        if self.timing.default_refresh_hz == 0 {
            anyhow::bail!("Invalid default_refresh_hz: must be greater than 0");
        }

        if self.timing.fence_soft_frames == 0 {
            anyhow::bail!("Invalid fence_soft_frames: must be greater than 0");
        }

        let mut names = HashSet::new();
        for output in &self.outputs {
            if !names.insert(output.name.as_str()) {
                anyhow::bail!("Duplicate output name: {}", output.name);
            }
            if output.max_windows == 0 || output.max_windows > self.pool.windows {
                anyhow::bail!(
                    "Invalid max_windows {} for output {}: must be between 1 and the pool size ({})",
                    output.max_windows,
                    output.name,
                    self.pool.windows
                );
            }
            if output.refresh_hz == Some(0) {
                anyhow::bail!("Invalid refresh_hz for output {}: must be greater than 0", output.name);
            }
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of the partial config that differ from the defaults override this config
    pub fn merge_partial(mut self, partial: CoreConfig) -> Self {
        let default_config = CoreConfig::default();

        if partial.pool != default_config.pool {
            self.pool = partial.pool;
        }
        if partial.timing != default_config.timing {
            self.timing = partial.timing;
        }
        if partial.outputs != default_config.outputs {
            self.outputs = partial.outputs;
        }

        self
    }
}
