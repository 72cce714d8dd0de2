//! Device-level and compute-level partition handles
//!
//! Each handle owns exactly one native resource or nothing. Taking from a
//! handle leaves an empty one behind whose drop releases nothing, so a native
//! partition is never released twice.

use migslice_core::{MigError, MigResult};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::backend::{NativeHandle, PartitionIdentity, Placement};
use crate::device::Device;
use crate::signal::ReleaseSignal;

struct LiveDevicePartition {
    device: Arc<Device>,
    handle: NativeHandle,
    slices: u32,
}

/// A device-level partition ("GPU instance")
#[derive(Default)]
pub struct DevicePartition {
    live: Option<LiveDevicePartition>,
}

impl DevicePartition {
    /// Create a partition occupying `slices` slices of `device`
    pub fn new(device: &Arc<Device>, slices: u32) -> MigResult<Self> {
        let profile = device.profile().device_partition_profile(slices)?;
        let handle = device
            .backend()
            .create_device_partition(device.index(), profile)?;

        debug!(
            device = device.index(),
            slices,
            profile = profile.0,
            handle = handle.raw(),
            "Device partition created"
        );

        Ok(Self {
            live: Some(LiveDevicePartition {
                device: Arc::clone(device),
                handle,
                slices,
            }),
        })
    }

    /// A partition holding no resource
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.live.is_some()
    }

    /// Slice count, if valid
    pub fn slices(&self) -> Option<u32> {
        self.live.as_ref().map(|live| live.slices)
    }

    /// Move the resource out, leaving `self` empty
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    fn live(&self) -> MigResult<&LiveDevicePartition> {
        self.live
            .as_ref()
            .ok_or_else(|| MigError::InvalidPartition("device partition is empty".to_string()))
    }

    /// How many more compute partitions of `slices` this partition could host
    pub fn remaining_compute_capacity(&self, slices: u32) -> MigResult<u32> {
        let live = self.live()?;
        let profile = live.device.profile().compute_partition_profile(slices)?;
        live.device
            .backend()
            .compute_partition_capacity(live.handle, profile)
    }

    /// Where this partition sits on its device
    pub fn placement(&self) -> MigResult<Placement> {
        let live = self.live()?;
        live.device.backend().device_partition_placement(live.handle)
    }
}

impl Drop for DevicePartition {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            if let Err(e) = live.device.backend().destroy_device_partition(live.handle) {
                error!(
                    device = live.device.index(),
                    handle = live.handle.raw(),
                    error = %e,
                    "Failed to release device partition"
                );
                std::process::abort();
            }
            debug!(
                device = live.device.index(),
                slices = live.slices,
                handle = live.handle.raw(),
                "Device partition released"
            );
        }
    }
}

impl std::fmt::Debug for DevicePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.live {
            Some(live) => f
                .debug_struct("DevicePartition")
                .field("device", &live.device.index())
                .field("slices", &live.slices)
                .finish(),
            None => f.write_str("DevicePartition(empty)"),
        }
    }
}

/// The device partition a compute partition lives on
enum Parent<'a> {
    /// Created for this compute partition and released with it
    Owned(DevicePartition),
    /// Owned elsewhere
    Borrowed(&'a DevicePartition),
}

impl Parent<'_> {
    fn get(&self) -> &DevicePartition {
        match self {
            Parent::Owned(partition) => partition,
            Parent::Borrowed(partition) => partition,
        }
    }
}

struct LiveComputePartition<'a> {
    id: Uuid,
    device: Arc<Device>,
    handle: NativeHandle,
    slices: u32,
    parent: Parent<'a>,
    signal: Option<Arc<ReleaseSignal>>,
}

/// A compute-level partition ("compute instance"), the unit handed to callers
///
/// A shared compute partition borrows its parent and so cannot outlive it.
#[derive(Default)]
pub struct ComputePartition<'a> {
    live: Option<LiveComputePartition<'a>>,
}

impl<'a> ComputePartition<'a> {
    /// Create a compute partition that takes over `parent`
    ///
    /// The parent is released together with the compute partition. If
    /// creation fails the parent is released before returning.
    pub fn owning(parent: DevicePartition, slices: u32) -> MigResult<Self> {
        Self::create(Parent::Owned(parent), slices)
    }

    /// Create a compute partition on a device partition owned elsewhere
    pub fn shared(parent: &'a DevicePartition, slices: u32) -> MigResult<Self> {
        Self::create(Parent::Borrowed(parent), slices)
    }

    fn create(parent: Parent<'a>, slices: u32) -> MigResult<Self> {
        let (device, parent_handle) = {
            let live = parent.get().live()?;
            (Arc::clone(&live.device), live.handle)
        };
        let profile = device.profile().compute_partition_profile(slices)?;
        let handle = device
            .backend()
            .create_compute_partition(parent_handle, profile)?;

        let id = Uuid::new_v4();
        debug!(
            id = %id,
            device = device.index(),
            slices,
            owning = matches!(parent, Parent::Owned(_)),
            handle = handle.raw(),
            "Compute partition created"
        );

        Ok(Self {
            live: Some(LiveComputePartition {
                id,
                device,
                handle,
                slices,
                parent,
                signal: None,
            }),
        })
    }

    /// Release under `signal`'s lock and notify it once released
    ///
    /// Dropping the partition then wakes anything waiting for capacity, the
    /// same as handing it back to its allocator.
    pub fn notify_on_release(mut self, signal: Arc<ReleaseSignal>) -> Self {
        if let Some(live) = self.live.as_mut() {
            live.signal = Some(signal);
        }
        self
    }

    /// A partition holding no resource
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.live.is_some()
    }

    /// Whether this partition also owns its device partition
    pub fn is_owning(&self) -> bool {
        matches!(
            self.live.as_ref().map(|live| &live.parent),
            Some(Parent::Owned(_))
        )
    }

    /// Slice count, if valid
    pub fn slices(&self) -> Option<u32> {
        self.live.as_ref().map(|live| live.slices)
    }

    /// Identifier used in logs, if valid
    pub fn id(&self) -> Option<Uuid> {
        self.live.as_ref().map(|live| live.id)
    }

    /// Device index, if valid
    pub fn device_index(&self) -> Option<u32> {
        self.live.as_ref().map(|live| live.device.index())
    }

    /// Placement of the device partition this lives on
    pub fn parent_placement(&self) -> MigResult<Placement> {
        match &self.live {
            Some(live) => live.parent.get().placement(),
            None => Err(MigError::InvalidPartition(
                "compute partition is empty".to_string(),
            )),
        }
    }

    /// Move the resource out, leaving `self` empty
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Native identity, or `None` if empty or unresolvable
    pub fn identity(&self) -> Option<PartitionIdentity> {
        let live = self.live.as_ref()?;
        match live.device.backend().resolve_identity(live.handle) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(id = %live.id, error = %e, "Could not resolve compute partition identity");
                None
            }
        }
    }

    /// Value for CUDA_VISIBLE_DEVICES selecting this partition
    pub fn cuda_visible_device(&self) -> Option<String> {
        self.identity().map(|identity| identity.visible_device_string())
    }
}

impl Drop for ComputePartition<'_> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            let signal = live.signal.clone();
            let guard = signal.as_ref().map(|signal| signal.lock());

            if let Err(e) = live.device.backend().destroy_compute_partition(live.handle) {
                error!(
                    id = %live.id,
                    handle = live.handle.raw(),
                    error = %e,
                    "Failed to release compute partition"
                );
                std::process::abort();
            }
            debug!(id = %live.id, slices = live.slices, "Compute partition released");
            // An owned parent goes only after the compute resource is gone
            drop(live.parent);

            if let Some(signal) = &signal {
                signal.notify();
            }
            drop(guard);
        }
    }
}

impl std::fmt::Debug for ComputePartition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.live {
            Some(live) => f
                .debug_struct("ComputePartition")
                .field("id", &live.id)
                .field("device", &live.device.index())
                .field("slices", &live.slices)
                .field("owning", &matches!(live.parent, Parent::Owned(_)))
                .finish(),
            None => f.write_str("ComputePartition(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PartitionContext;
    use crate::simulated::SimulatedBackend;
    use migslice_core::DeviceProfile;

    const A100_N_SLICES: u32 = 7;

    fn setup() -> (Arc<SimulatedBackend>, Arc<Device>) {
        let sim = Arc::new(SimulatedBackend::new(vec![DeviceProfile::a100()]));
        let ctx = PartitionContext::with_backend(sim.clone());
        let device = Arc::new(Device::open(&ctx, 0, DeviceProfile::a100()).unwrap());
        (sim, device)
    }

    #[test]
    fn test_device_partition_all_sizes() {
        let (sim, device) = setup();
        for slices in (1..=A100_N_SLICES).rev() {
            let result = DevicePartition::new(&device, slices);
            if slices == 5 || slices == 6 {
                assert!(matches!(result, Err(MigError::InvalidSliceCount(_))));
            } else {
                let partition = result.unwrap();
                assert_eq!(partition.slices(), Some(slices));
            }
        }
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_device_partition_churn_beyond_capacity() {
        let (sim, device) = setup();
        // Each partition is released before the next, so this never runs out
        for _ in 0..A100_N_SLICES * 2 {
            let _partition = DevicePartition::new(&device, 1).unwrap();
        }
        assert_eq!(sim.live_device_partitions(), 0);
        assert_eq!(device.remaining_device_partition_capacity(1).unwrap(), 7);
    }

    #[test]
    fn test_device_partition_over_capacity() {
        let (_sim, device) = setup();
        let _full = DevicePartition::new(&device, 7).unwrap();
        let result = DevicePartition::new(&device, 1);
        assert!(matches!(result, Err(MigError::ResourceExhausted(_))));
    }

    #[test]
    fn test_device_partition_take() {
        let (sim, device) = setup();
        let mut source = DevicePartition::new(&device, 2).unwrap();
        let moved = source.take();

        assert!(!source.is_valid());
        assert!(moved.is_valid());
        assert!(matches!(
            source.remaining_compute_capacity(1),
            Err(MigError::InvalidPartition(_))
        ));

        drop(source);
        assert_eq!(sim.live_device_partitions(), 1);
        drop(moved);
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_empty_partitions_release_nothing() {
        let (sim, _device) = setup();
        drop(DevicePartition::empty());
        let empty = ComputePartition::empty();
        assert!(empty.identity().is_none());
        assert!(empty.cuda_visible_device().is_none());
        drop(empty);
        assert_eq!(sim.live_device_partitions(), 0);
        assert_eq!(sim.live_compute_partitions(), 0);
    }

    #[test]
    fn test_shared_compute_partitions() {
        let (sim, device) = setup();
        let parent = DevicePartition::new(&device, 7).unwrap();

        let first = ComputePartition::shared(&parent, 1).unwrap();
        assert!(!first.is_owning());
        assert_eq!(parent.remaining_compute_capacity(1).unwrap(), 6);

        drop(first);
        assert_eq!(sim.live_compute_partitions(), 0);
        assert_eq!(sim.live_device_partitions(), 1);
        assert_eq!(parent.remaining_compute_capacity(1).unwrap(), 7);
    }

    #[test]
    fn test_shared_churn_beyond_capacity() {
        let (sim, device) = setup();
        let parent = DevicePartition::new(&device, 7).unwrap();
        for _ in 0..A100_N_SLICES * 2 {
            let _ci = ComputePartition::shared(&parent, 1).unwrap();
        }
        assert_eq!(sim.live_compute_partitions(), 0);
    }

    #[test]
    fn test_shared_over_capacity() {
        let (_sim, device) = setup();
        let parent = DevicePartition::new(&device, 7).unwrap();
        let _full = ComputePartition::shared(&parent, 7).unwrap();
        let result = ComputePartition::shared(&parent, 1);
        assert!(matches!(result, Err(MigError::ResourceExhausted(_))));
    }

    #[test]
    fn test_different_visible_device_strings() {
        let (_sim, device) = setup();
        let parent = DevicePartition::new(&device, 7).unwrap();
        let a = ComputePartition::shared(&parent, 3).unwrap();
        let b = ComputePartition::shared(&parent, 4).unwrap();

        let a_str = a.cuda_visible_device().unwrap();
        let b_str = b.cuda_visible_device().unwrap();
        assert!(a_str.starts_with("MIG-GPU-"));
        assert_ne!(a_str, b_str);
    }

    #[test]
    fn test_owning_releases_both() {
        let (sim, device) = setup();
        let parent = DevicePartition::new(&device, 3).unwrap();
        let ci = ComputePartition::owning(parent, 3).unwrap();

        assert!(ci.is_owning());
        assert_eq!(ci.parent_placement().unwrap().size, 4);
        assert_eq!(sim.live_device_partitions(), 1);
        assert_eq!(sim.live_compute_partitions(), 1);

        drop(ci);
        assert_eq!(sim.live_device_partitions(), 0);
        assert_eq!(sim.live_compute_partitions(), 0);
    }

    #[test]
    fn test_owning_failure_releases_parent() {
        let (sim, device) = setup();
        let parent = DevicePartition::new(&device, 2).unwrap();
        sim.set_fail_creates(true);

        let result = ComputePartition::owning(parent, 2);
        assert!(matches!(result, Err(MigError::Native(_))));
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_owning_empty_parent_rejected() {
        let result = ComputePartition::owning(DevicePartition::empty(), 1);
        assert!(matches!(result, Err(MigError::InvalidPartition(_))));
    }

    #[test]
    fn test_compute_partition_take() {
        let (sim, device) = setup();
        let mut source = ComputePartition::owning(DevicePartition::new(&device, 1).unwrap(), 1).unwrap();
        let id = source.id();
        let moved = source.take();

        assert!(!source.is_valid());
        assert_eq!(moved.id(), id);
        drop(source);
        assert_eq!(sim.live_compute_partitions(), 1);
        drop(moved);
        assert_eq!(sim.live_compute_partitions(), 0);
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_drop_notifies_release_signal() {
        let (sim, device) = setup();
        let signal = Arc::new(ReleaseSignal::new());
        let partition = ComputePartition::owning(DevicePartition::new(&device, 7).unwrap(), 7)
            .unwrap()
            .notify_on_release(Arc::clone(&signal));

        std::thread::scope(|s| {
            let mut guard = signal.lock();
            s.spawn(move || drop(partition));
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
            assert!(!signal.wait_until(&mut guard, deadline));
        });
        assert_eq!(sim.live_compute_partitions(), 0);
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_empty_partition_ignores_release_signal() {
        let partition = ComputePartition::empty().notify_on_release(Arc::new(ReleaseSignal::new()));
        assert!(!partition.is_valid());
    }
}
