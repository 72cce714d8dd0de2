//! Physical accelerator handle

use migslice_core::{DeviceProfile, MigError, MigResult};
use std::sync::Arc;
use tracing::info;

use crate::backend::PartitionBackend;
use crate::context::PartitionContext;

/// A MIG-capable device
///
/// Read-only after construction and shared by every allocator targeting it.
/// It does not own any partition.
pub struct Device {
    backend: Arc<dyn PartitionBackend>,
    index: u32,
    profile: DeviceProfile,
}

impl Device {
    /// Open the device at `index`, which must belong to the `profile` family
    pub fn open(ctx: &PartitionContext, index: u32, profile: DeviceProfile) -> MigResult<Self> {
        profile.validate()?;

        let backend = Arc::clone(ctx.backend());
        if index >= backend.device_count()? {
            return Err(MigError::DeviceNotFound(index));
        }

        info!(
            device = index,
            family = %profile.name,
            slices = profile.total_slices,
            backend = backend.name(),
            "Device opened"
        );

        Ok(Self {
            backend,
            index,
            profile,
        })
    }

    /// Device index, as passed to CUDA_VISIBLE_DEVICES
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Profile table of this device's family
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Hardware UUID
    pub fn uuid(&self) -> MigResult<String> {
        self.backend.device_uuid(self.index)
    }

    /// How many more device partitions of `slices` could be created right now
    pub fn remaining_device_partition_capacity(&self, slices: u32) -> MigResult<u32> {
        let profile = self.profile.device_partition_profile(slices)?;
        self.backend.device_partition_capacity(self.index, profile)
    }

    pub(crate) fn backend(&self) -> &dyn PartitionBackend {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("family", &self.profile.name)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_query() {
        let ctx = PartitionContext::simulated(vec![DeviceProfile::a100()]);
        let device = Device::open(&ctx, 0, DeviceProfile::a100()).unwrap();

        assert_eq!(device.index(), 0);
        assert_eq!(device.remaining_device_partition_capacity(1).unwrap(), 7);
        assert_eq!(device.remaining_device_partition_capacity(7).unwrap(), 1);
        assert!(device.uuid().unwrap().starts_with("GPU-"));
    }

    #[test]
    fn test_open_unknown_index() {
        let ctx = PartitionContext::simulated(vec![DeviceProfile::a100()]);
        let result = Device::open(&ctx, 1, DeviceProfile::a100());
        assert!(matches!(result, Err(MigError::DeviceNotFound(1))));
    }

    #[test]
    fn test_capacity_invalid_slices() {
        let ctx = PartitionContext::simulated(vec![DeviceProfile::a100()]);
        let device = Device::open(&ctx, 0, DeviceProfile::a100()).unwrap();
        assert!(matches!(
            device.remaining_device_partition_capacity(5),
            Err(MigError::InvalidSliceCount(5))
        ));
    }

    #[test]
    fn test_open_rejects_invalid_profile() {
        let ctx = PartitionContext::simulated(vec![DeviceProfile::a100()]);
        let mut profile = DeviceProfile::a100();
        profile.entries.clear();
        assert!(matches!(
            Device::open(&ctx, 0, profile),
            Err(MigError::Config(_))
        ));
    }
}
