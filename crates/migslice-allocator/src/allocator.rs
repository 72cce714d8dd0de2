//! Allocator contract and the locking shared by every strategy

use migslice_core::{AllocatorConfig, MigError, MigResult, Strategy, WaitPolicy};
use migslice_device::{ComputePartition, Device, ReleaseSignal};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::isolated::IsolatedAllocator;
use crate::shared::SharedAllocator;

/// Hands out compute partitions of a single device
///
/// `allocate` and `free` are serialized per allocator. Two allocators on the
/// same device are not coordinated with each other.
pub trait Allocator: Send + Sync {
    /// Which strategy this allocator implements
    fn strategy(&self) -> Strategy;

    /// The device partitions are carved from
    fn device(&self) -> &Arc<Device>;

    /// Allocate a compute partition of `slices` slices
    ///
    /// Fails with `InvalidSliceCount` before taking the lock if `slices` is
    /// not in the device's profile table. On exhaustion, either fails or
    /// waits for a `free` depending on the configured wait policy.
    fn allocate(&self, slices: u32) -> MigResult<ComputePartition<'_>>;

    /// Advisory count of further `slices`-sized allocations that would fit
    ///
    /// Does not take the allocator lock, so the value may be stale as soon as
    /// it is returned.
    fn remaining(&self, slices: u32) -> MigResult<u32>;

    /// Release a partition and wake blocked allocations
    ///
    /// Dropping a partition this allocator handed out has the same effect.
    /// Freeing an empty partition only wakes waiters.
    fn free(&self, partition: ComputePartition<'_>);

    /// What `allocate` does when the device is full
    fn wait_policy(&self) -> WaitPolicy;
}

/// Create an allocator for `device` as described by `config`
pub fn create_allocator(
    device: Arc<Device>,
    config: &AllocatorConfig,
) -> MigResult<Box<dyn Allocator>> {
    let wait = config.wait_policy();
    Ok(match config.strategy {
        Strategy::Isolated => Box::new(IsolatedAllocator::new(device, wait)?),
        Strategy::Shared => Box::new(SharedAllocator::new(device, wait)?),
    })
}

/// Lock, wake-up condition and wait policy shared by the strategies
pub(crate) struct AllocatorCore {
    device: Arc<Device>,
    signal: Arc<ReleaseSignal>,
    wait: WaitPolicy,
}

impl AllocatorCore {
    /// Fails unless the device is completely unpartitioned
    pub(crate) fn new(device: Arc<Device>, wait: WaitPolicy) -> MigResult<Self> {
        let total = device.profile().total_slices;
        let available = device.remaining_device_partition_capacity(1)?;
        if available != total {
            return Err(MigError::Precondition(format!(
                "device {} can host {} of {} single-slice partitions; is it already in use?",
                device.index(),
                available,
                total
            )));
        }

        Ok(Self {
            device,
            signal: Arc::new(ReleaseSignal::new()),
            wait,
        })
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }

    /// Run `attempt` under the allocator lock, applying the wait policy
    ///
    /// Only `ResourceExhausted` is waited on; the lock is released while
    /// waiting and every wake-up retries. Waiters are not ordered: whichever
    /// reacquires the lock first retries first. Partitions are returned
    /// attached to the allocator's release signal.
    pub(crate) fn allocate<'a, F>(
        &self,
        strategy: Strategy,
        slices: u32,
        mut attempt: F,
    ) -> MigResult<ComputePartition<'a>>
    where
        F: FnMut() -> MigResult<ComputePartition<'a>>,
    {
        self.device.profile().check_slices(slices)?;

        let mut guard = self.signal.lock();
        let started = Instant::now();
        let (blocking, deadline) = match self.wait {
            WaitPolicy::FailFast => (false, None),
            WaitPolicy::Blocking { timeout } => (true, timeout.map(|t| started + t)),
        };

        loop {
            match attempt() {
                Ok(partition) => {
                    let partition = partition.notify_on_release(Arc::clone(&self.signal));
                    info!(
                        device = self.device.index(),
                        strategy = %strategy,
                        slices,
                        id = ?partition.id(),
                        "Allocated compute partition"
                    );
                    return Ok(partition);
                }
                Err(MigError::ResourceExhausted(reason)) if blocking => {
                    debug!(
                        device = self.device.index(),
                        slices,
                        reason = %reason,
                        "Waiting for capacity"
                    );
                    match deadline {
                        None => self.signal.wait(&mut guard),
                        Some(deadline) => {
                            if self.signal.wait_until(&mut guard, deadline) {
                                warn!(device = self.device.index(), slices, "Allocation timed out");
                                return Err(MigError::Timeout(format!(
                                    "no capacity for {} slices after {:?}",
                                    slices,
                                    started.elapsed()
                                )));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        device = self.device.index(),
                        strategy = %strategy,
                        slices,
                        error = %e,
                        "Allocation failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Release `partition` and wake waiters
    ///
    /// A live partition takes the lock and notifies as it drops; an empty one
    /// still notifies so waiters get to retry.
    pub(crate) fn free(&self, partition: ComputePartition<'_>) {
        let id = partition.id();
        let slices = partition.slices();
        drop(partition);

        match id {
            Some(id) => {
                info!(device = self.device.index(), id = %id, slices = ?slices, "Freed compute partition")
            }
            None => {
                let _guard = self.signal.lock();
                self.signal.notify();
            }
        }
    }
}
