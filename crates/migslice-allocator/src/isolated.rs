//! Allocator giving every request its own device partition

use migslice_core::{MigResult, Strategy, WaitPolicy};
use migslice_device::{ComputePartition, Device, DevicePartition};
use std::sync::Arc;
use tracing::info;

use crate::allocator::{Allocator, AllocatorCore};

/// Each allocation creates a device partition of exactly the requested size
/// and a compute partition filling it
///
/// Allocations are hardware-isolated from one another. Whether a set of
/// requests fits depends on arrival order and placement, not only on the sum
/// of their slices.
pub struct IsolatedAllocator {
    core: AllocatorCore,
}

impl IsolatedAllocator {
    /// Fails if `device` is already partitioned
    pub fn new(device: Arc<Device>, wait: WaitPolicy) -> MigResult<Self> {
        let core = AllocatorCore::new(device, wait)?;
        info!(
            device = core.device().index(),
            wait = ?wait,
            "Isolated allocator ready"
        );
        Ok(Self { core })
    }
}

impl Allocator for IsolatedAllocator {
    fn strategy(&self) -> Strategy {
        Strategy::Isolated
    }

    fn device(&self) -> &Arc<Device> {
        self.core.device()
    }

    fn allocate(&self, slices: u32) -> MigResult<ComputePartition<'_>> {
        self.core.allocate(Strategy::Isolated, slices, || {
            let parent = DevicePartition::new(self.core.device(), slices)?;
            ComputePartition::owning(parent, slices)
        })
    }

    fn remaining(&self, slices: u32) -> MigResult<u32> {
        self.core.device().remaining_device_partition_capacity(slices)
    }

    fn free(&self, partition: ComputePartition<'_>) {
        self.core.free(partition)
    }

    fn wait_policy(&self) -> WaitPolicy {
        self.core.wait_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migslice_core::DeviceProfile;
    use migslice_device::{PartitionContext, SimulatedBackend};

    #[test]
    fn test_each_allocation_owns_a_device_partition() {
        let sim = Arc::new(SimulatedBackend::new(vec![DeviceProfile::a100()]));
        let ctx = PartitionContext::with_backend(sim.clone());
        let device = Arc::new(Device::open(&ctx, 0, DeviceProfile::a100()).unwrap());
        let allocator = IsolatedAllocator::new(device, WaitPolicy::FailFast).unwrap();

        let a = allocator.allocate(2).unwrap();
        let b = allocator.allocate(1).unwrap();
        assert!(a.is_owning() && b.is_owning());
        assert_eq!(sim.live_device_partitions(), 2);
        assert_ne!(a.parent_placement().unwrap(), b.parent_placement().unwrap());

        allocator.free(a);
        assert_eq!(sim.live_device_partitions(), 1);
        allocator.free(b);
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_fragmented_request_fails() {
        let ctx = PartitionContext::simulated(vec![DeviceProfile::a100()]);
        let device = Arc::new(Device::open(&ctx, 0, DeviceProfile::a100()).unwrap());
        let allocator = IsolatedAllocator::new(device, WaitPolicy::FailFast).unwrap();

        let _one = allocator.allocate(1).unwrap();
        let _three = allocator.allocate(3).unwrap();
        // Three slices are unused, yet a 3-slice request no longer fits
        assert_eq!(allocator.remaining(3).unwrap(), 0);
        assert!(allocator.allocate(3).unwrap_err().is_allocation_failure());
    }
}
