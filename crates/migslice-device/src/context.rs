//! Native library lifecycle

use migslice_core::{BackendConfig, BackendKind, DeviceProfile, MigError, MigResult};
use std::sync::Arc;
use tracing::info;

use crate::backend::PartitionBackend;
use crate::simulated::SimulatedBackend;

/// Owner of the initialized partition-management library
///
/// Constructing a context is the single initialization point for the native
/// layer. Devices opened from it keep the library alive; it is shut down once
/// the context and every such device are dropped.
#[derive(Clone)]
pub struct PartitionContext {
    backend: Arc<dyn PartitionBackend>,
}

impl PartitionContext {
    /// Use an already constructed backend
    pub fn with_backend(backend: Arc<dyn PartitionBackend>) -> Self {
        info!(backend = backend.name(), "Partition context initialized");
        Self { backend }
    }

    /// Simulated devices, one per profile
    pub fn simulated(profiles: Vec<DeviceProfile>) -> Self {
        Self::with_backend(Arc::new(SimulatedBackend::new(profiles)))
    }

    /// Initialize NVML
    #[cfg(feature = "nvml")]
    pub fn nvml() -> MigResult<Self> {
        Ok(Self::with_backend(Arc::new(crate::nvml::NvmlBackend::init()?)))
    }

    /// Build the backend selected in configuration
    ///
    /// The simulated backend exposes `simulated_devices` copies of `profile`.
    pub fn from_config(config: &BackendConfig, profile: &DeviceProfile) -> MigResult<Self> {
        match config.kind {
            BackendKind::Simulated => {
                if config.simulated_devices == 0 {
                    return Err(MigError::Config(
                        "simulated_devices must be at least 1".to_string(),
                    ));
                }
                let profiles = (0..config.simulated_devices)
                    .map(|_| profile.clone())
                    .collect();
                Ok(Self::simulated(profiles))
            }
            #[cfg(feature = "nvml")]
            BackendKind::Nvml => Self::nvml(),
            #[cfg(not(feature = "nvml"))]
            BackendKind::Nvml => Err(MigError::Config(
                "NVML backend requested but migslice was built without the `nvml` feature"
                    .to_string(),
            )),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PartitionBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_simulated() {
        let config = BackendConfig {
            kind: BackendKind::Simulated,
            simulated_devices: 2,
        };
        let ctx = PartitionContext::from_config(&config, &DeviceProfile::a100()).unwrap();
        assert_eq!(ctx.backend().device_count().unwrap(), 2);
        assert_eq!(ctx.backend().name(), "simulated");
    }

    #[test]
    fn test_from_config_rejects_zero_devices() {
        let config = BackendConfig {
            kind: BackendKind::Simulated,
            simulated_devices: 0,
        };
        let result = PartitionContext::from_config(&config, &DeviceProfile::a100());
        assert!(matches!(result, Err(MigError::Config(_))));
    }

    #[cfg(not(feature = "nvml"))]
    #[test]
    fn test_nvml_requires_feature() {
        let config = BackendConfig {
            kind: BackendKind::Nvml,
            simulated_devices: 1,
        };
        let result = PartitionContext::from_config(&config, &DeviceProfile::a100());
        assert!(matches!(result, Err(MigError::Config(_))));
    }
}
