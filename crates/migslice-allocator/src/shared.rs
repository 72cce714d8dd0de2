//! Allocator sharing one full-size device partition

use migslice_core::{MigResult, Strategy, WaitPolicy};
use migslice_device::{ComputePartition, Device, DevicePartition};
use std::sync::Arc;
use tracing::info;

use crate::allocator::{Allocator, AllocatorCore};

/// Creates one device partition spanning the whole device up front; every
/// allocation is a compute partition inside it
///
/// Allocations compete only for compute-level capacity. The device partition
/// is released when the allocator is dropped, which the borrow on every
/// handed-out compute partition keeps from happening early.
pub struct SharedAllocator {
    core: AllocatorCore,
    partition: DevicePartition,
}

impl SharedAllocator {
    /// Fails if `device` is already partitioned
    pub fn new(device: Arc<Device>, wait: WaitPolicy) -> MigResult<Self> {
        let core = AllocatorCore::new(device, wait)?;
        let total = core.device().profile().total_slices;
        let partition = DevicePartition::new(core.device(), total)?;

        info!(
            device = core.device().index(),
            slices = total,
            wait = ?wait,
            "Shared allocator ready"
        );
        Ok(Self { core, partition })
    }

    /// The device partition every allocation lives on
    pub fn partition(&self) -> &DevicePartition {
        &self.partition
    }
}

impl Allocator for SharedAllocator {
    fn strategy(&self) -> Strategy {
        Strategy::Shared
    }

    fn device(&self) -> &Arc<Device> {
        self.core.device()
    }

    fn allocate(&self, slices: u32) -> MigResult<ComputePartition<'_>> {
        self.core.allocate(Strategy::Shared, slices, || {
            ComputePartition::shared(&self.partition, slices)
        })
    }

    fn remaining(&self, slices: u32) -> MigResult<u32> {
        self.partition.remaining_compute_capacity(slices)
    }

    fn free(&self, partition: ComputePartition<'_>) {
        self.core.free(partition)
    }

    fn wait_policy(&self) -> WaitPolicy {
        self.core.wait_policy()
    }
}
