//! Configuration types for migslice

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{DeviceProfile, MigError, MigResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target device
    pub device: DeviceConfig,
    /// Allocator configuration
    pub allocator: AllocatorConfig,
    /// Native backend selection
    pub backend: BackendConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> MigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device index, as passed to CUDA_VISIBLE_DEVICES
    pub index: u32,
    /// Built-in family name used when no inline profile is given
    pub family: String,
    /// Inline profile table, overrides `family`
    pub profile: Option<DeviceProfile>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            family: "a100".to_string(),
            profile: None,
        }
    }
}

impl DeviceConfig {
    /// Resolve and validate the profile table for this device
    pub fn resolve_profile(&self) -> MigResult<DeviceProfile> {
        let profile = match &self.profile {
            Some(profile) => profile.clone(),
            None => DeviceProfile::builtin(&self.family).ok_or_else(|| {
                MigError::Config(format!(
                    "Unknown device family '{}' (known: {})",
                    self.family,
                    DeviceProfile::builtin_names().join(", ")
                ))
            })?,
        };
        profile.validate()?;
        Ok(profile)
    }
}

/// Allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Every allocation gets its own device partition
    Isolated,
    /// All allocations share one full-size device partition
    Shared,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Isolated => write!(f, "isolated"),
            Strategy::Shared => write!(f, "shared"),
        }
    }
}

/// What `allocate` does when there is no capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitMode {
    /// Return the allocation failure immediately
    FailFast,
    /// Wait until a partition from the same allocator is released
    Blocking,
}

/// Resolved waiting behaviour for an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    FailFast,
    /// `None` waits indefinitely
    Blocking { timeout: Option<Duration> },
}

/// Allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Allocation strategy
    pub strategy: Strategy,
    /// Behaviour on exhaustion
    pub wait: WaitMode,
    /// Upper bound on a blocking wait in milliseconds
    pub wait_timeout_ms: Option<u64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Isolated,
            wait: WaitMode::FailFast,
            wait_timeout_ms: None,
        }
    }
}

impl AllocatorConfig {
    pub fn wait_policy(&self) -> WaitPolicy {
        match self.wait {
            WaitMode::FailFast => WaitPolicy::FailFast,
            WaitMode::Blocking => WaitPolicy::Blocking {
                timeout: self.wait_timeout_ms.map(Duration::from_millis),
            },
        }
    }
}

/// Native backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process model of MIG geometry
    Simulated,
    /// NVIDIA Management Library
    Nvml,
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type
    pub kind: BackendKind,
    /// Number of devices the simulated backend exposes
    pub simulated_devices: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Simulated,
            simulated_devices: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
