//! In-process partition backend
//!
//! Models MIG placement geometry without hardware. A partition of `n` slices
//! occupies `n.next_power_of_two()` placement units, starts at a multiple of
//! that size, and must end within the parent's slice count. The same rule is
//! applied to device partitions on a device and to compute partitions inside a
//! device partition, which reproduces the fragmentation seen on real parts:
//! a 4-slice partition only fits at the start of an A100, a 3-slice one fits
//! at unit 0 or 4, and single slices never use the eighth unit. Free
//! placements are taken from the highest start downwards.

use migslice_core::{DeviceProfile, MigError, MigResult, ProfileId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{NativeHandle, PartitionBackend, PartitionIdentity, Placement};

/// Find the highest free placement for `slices` within `units`
fn find_placement(units: &[bool], total_slices: u32, slices: u32) -> Option<Placement> {
    let size = slices.next_power_of_two();
    (0..units.len() as u32)
        .step_by(size as usize)
        .rev()
        .filter(|start| start + slices <= total_slices && (start + size) as usize <= units.len())
        .find(|&start| {
            units[start as usize..(start + size) as usize]
                .iter()
                .all(|used| !used)
        })
        .map(|start| Placement { start, size })
}

fn mark(units: &mut [bool], placement: Placement, used: bool) {
    for unit in &mut units[placement.start as usize..(placement.start + placement.size) as usize] {
        *unit = used;
    }
}

/// Greedy count of how many more `slices`-sized partitions fit
fn count_placements(units: &[bool], total_slices: u32, slices: u32) -> u32 {
    let mut scratch = units.to_vec();
    let mut count = 0;
    while let Some(placement) = find_placement(&scratch, total_slices, slices) {
        mark(&mut scratch, placement, true);
        count += 1;
    }
    count
}

fn lowest_free_id(used: impl Iterator<Item = u32>) -> u32 {
    let mut used: Vec<u32> = used.collect();
    used.sort_unstable();
    let mut id = 0;
    for taken in used {
        if taken == id {
            id += 1;
        } else if taken > id {
            break;
        }
    }
    id
}

fn units_for(total_slices: u32) -> Vec<bool> {
    vec![false; total_slices.next_power_of_two() as usize]
}

struct SimDevice {
    profile: DeviceProfile,
    uuid: String,
    units: Vec<bool>,
}

struct SimDevicePartition {
    device: u32,
    id: u32,
    slices: u32,
    placement: Placement,
    units: Vec<bool>,
}

struct SimComputePartition {
    parent: NativeHandle,
    id: u32,
    placement: Placement,
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimDevice>,
    device_partitions: HashMap<NativeHandle, SimDevicePartition>,
    compute_partitions: HashMap<NativeHandle, SimComputePartition>,
    next_handle: u64,
    fail_creates: bool,
}

impl SimState {
    fn device(&self, device: u32) -> MigResult<&SimDevice> {
        self.devices
            .get(device as usize)
            .ok_or(MigError::DeviceNotFound(device))
    }

    fn device_partition(&self, handle: NativeHandle) -> MigResult<&SimDevicePartition> {
        self.device_partitions
            .get(&handle)
            .ok_or_else(|| MigError::Native(format!("unknown device partition {:#x}", handle.raw())))
    }

    fn compute_partition(&self, handle: NativeHandle) -> MigResult<&SimComputePartition> {
        self.compute_partitions
            .get(&handle)
            .ok_or_else(|| MigError::Native(format!("unknown compute partition {:#x}", handle.raw())))
    }

    fn next_handle(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle::from_raw(self.next_handle)
    }

    fn device_slices(&self, device: u32, profile: ProfileId) -> MigResult<(u32, u32)> {
        let dev = self.device(device)?;
        let slices = dev.profile.slices_for_device_profile(profile).ok_or_else(|| {
            MigError::Native(format!("invalid device partition profile {}", profile))
        })?;
        Ok((slices, dev.profile.total_slices))
    }

    fn compute_slices(&self, parent: &SimDevicePartition, profile: ProfileId) -> MigResult<u32> {
        let dev = self.device(parent.device)?;
        match dev.profile.slices_for_compute_profile(profile) {
            Some(slices) if slices <= parent.slices => Ok(slices),
            _ => Err(MigError::Native(format!(
                "invalid compute partition profile {} for a {}-slice partition",
                profile, parent.slices
            ))),
        }
    }
}

/// Partition backend backed by an in-memory model of each device
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    /// One simulated device per profile, indexed in order
    pub fn new(profiles: Vec<DeviceProfile>) -> Self {
        let devices = profiles
            .into_iter()
            .map(|profile| SimDevice {
                uuid: format!("GPU-{}", Uuid::new_v4()),
                units: units_for(profile.total_slices),
                profile,
            })
            .collect();

        Self {
            state: Mutex::new(SimState {
                devices,
                ..SimState::default()
            }),
        }
    }

    /// Number of device partitions currently alive
    pub fn live_device_partitions(&self) -> usize {
        self.state.lock().device_partitions.len()
    }

    /// Number of compute partitions currently alive
    pub fn live_compute_partitions(&self) -> usize {
        self.state.lock().compute_partitions.len()
    }

    /// Make every subsequent create call fail with a non-exhaustion error
    pub fn set_fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }
}

impl PartitionBackend for SimulatedBackend {
    fn device_count(&self) -> MigResult<u32> {
        Ok(self.state.lock().devices.len() as u32)
    }

    fn device_uuid(&self, device: u32) -> MigResult<String> {
        Ok(self.state.lock().device(device)?.uuid.clone())
    }

    fn create_device_partition(&self, device: u32, profile: ProfileId) -> MigResult<NativeHandle> {
        let mut state = self.state.lock();
        let (slices, total_slices) = state.device_slices(device, profile)?;
        if state.fail_creates {
            return Err(MigError::Native("simulated create failure".to_string()));
        }

        let placement = find_placement(&state.device(device)?.units, total_slices, slices)
            .ok_or_else(|| {
                MigError::ResourceExhausted(format!(
                    "no placement left for profile {} on device {}",
                    profile, device
                ))
            })?;

        let id = lowest_free_id(
            state
                .device_partitions
                .values()
                .filter(|p| p.device == device)
                .map(|p| p.id),
        );
        let handle = state.next_handle();
        mark(&mut state.devices[device as usize].units, placement, true);
        state.device_partitions.insert(
            handle,
            SimDevicePartition {
                device,
                id,
                slices,
                placement,
                units: units_for(slices),
            },
        );

        debug!(device, id, slices, start = placement.start, "Simulated device partition created");
        Ok(handle)
    }

    fn destroy_device_partition(&self, handle: NativeHandle) -> MigResult<()> {
        let mut state = self.state.lock();
        state.device_partition(handle)?;
        if state.compute_partitions.values().any(|c| c.parent == handle) {
            return Err(MigError::Native(format!(
                "device partition {:#x} still hosts compute partitions",
                handle.raw()
            )));
        }

        if let Some(partition) = state.device_partitions.remove(&handle) {
            mark(
                &mut state.devices[partition.device as usize].units,
                partition.placement,
                false,
            );
            debug!(device = partition.device, id = partition.id, "Simulated device partition destroyed");
        }
        Ok(())
    }

    fn create_compute_partition(
        &self,
        parent: NativeHandle,
        profile: ProfileId,
    ) -> MigResult<NativeHandle> {
        let mut state = self.state.lock();
        let gi = state.device_partition(parent)?;
        let slices = state.compute_slices(gi, profile)?;
        if state.fail_creates {
            return Err(MigError::Native("simulated create failure".to_string()));
        }

        let placement = find_placement(&gi.units, gi.slices, slices).ok_or_else(|| {
            MigError::ResourceExhausted(format!(
                "no compute placement left for profile {} in device partition {}",
                profile, gi.id
            ))
        })?;

        let id = lowest_free_id(
            state
                .compute_partitions
                .values()
                .filter(|c| c.parent == parent)
                .map(|c| c.id),
        );
        let handle = state.next_handle();
        if let Some(gi) = state.device_partitions.get_mut(&parent) {
            mark(&mut gi.units, placement, true);
        }
        state.compute_partitions.insert(
            handle,
            SimComputePartition {
                parent,
                id,
                placement,
            },
        );

        debug!(id, slices, start = placement.start, "Simulated compute partition created");
        Ok(handle)
    }

    fn destroy_compute_partition(&self, handle: NativeHandle) -> MigResult<()> {
        let mut state = self.state.lock();
        let ci = state.compute_partitions.remove(&handle).ok_or_else(|| {
            MigError::Native(format!("unknown compute partition {:#x}", handle.raw()))
        })?;
        if let Some(gi) = state.device_partitions.get_mut(&ci.parent) {
            mark(&mut gi.units, ci.placement, false);
        }
        debug!(id = ci.id, "Simulated compute partition destroyed");
        Ok(())
    }

    fn device_partition_capacity(&self, device: u32, profile: ProfileId) -> MigResult<u32> {
        let state = self.state.lock();
        let (slices, total_slices) = state.device_slices(device, profile)?;
        Ok(count_placements(
            &state.device(device)?.units,
            total_slices,
            slices,
        ))
    }

    fn compute_partition_capacity(
        &self,
        parent: NativeHandle,
        profile: ProfileId,
    ) -> MigResult<u32> {
        let state = self.state.lock();
        let gi = state.device_partition(parent)?;
        let slices = state.compute_slices(gi, profile)?;
        Ok(count_placements(&gi.units, gi.slices, slices))
    }

    fn device_partition_placement(&self, handle: NativeHandle) -> MigResult<Placement> {
        Ok(self.state.lock().device_partition(handle)?.placement)
    }

    fn resolve_identity(&self, handle: NativeHandle) -> MigResult<PartitionIdentity> {
        let state = self.state.lock();
        let ci = state.compute_partition(handle)?;
        let gi = state.device_partition(ci.parent)?;
        Ok(PartitionIdentity {
            device_uuid: state.device(gi.device)?.uuid.clone(),
            device_partition_id: gi.id,
            compute_partition_id: ci.id,
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a100() -> (SimulatedBackend, DeviceProfile) {
        let profile = DeviceProfile::a100();
        (SimulatedBackend::new(vec![profile.clone()]), profile)
    }

    fn capacity(sim: &SimulatedBackend, profile: &DeviceProfile, slices: u32) -> u32 {
        sim.device_partition_capacity(0, profile.device_partition_profile(slices).unwrap())
            .unwrap()
    }

    #[test]
    fn test_empty_a100_capacity() {
        let (sim, profile) = a100();
        assert_eq!(capacity(&sim, &profile, 1), 7);
        assert_eq!(capacity(&sim, &profile, 2), 3);
        assert_eq!(capacity(&sim, &profile, 3), 2);
        assert_eq!(capacity(&sim, &profile, 4), 1);
        assert_eq!(capacity(&sim, &profile, 7), 1);
    }

    #[test]
    fn test_full_device_exhausts() {
        let (sim, profile) = a100();
        let full = sim
            .create_device_partition(0, profile.device_partition_profile(7).unwrap())
            .unwrap();
        assert_eq!(capacity(&sim, &profile, 1), 0);

        let result = sim.create_device_partition(0, profile.device_partition_profile(1).unwrap());
        assert!(matches!(result, Err(MigError::ResourceExhausted(_))));

        sim.destroy_device_partition(full).unwrap();
        assert_eq!(capacity(&sim, &profile, 1), 7);
    }

    #[test]
    fn test_highest_placement_first() {
        let (sim, profile) = a100();
        let one = sim
            .create_device_partition(0, profile.device_partition_profile(1).unwrap())
            .unwrap();
        assert_eq!(
            sim.device_partition_placement(one).unwrap(),
            Placement { start: 6, size: 1 }
        );
        // Unit 0 is still free, so the 4-slice placement survives
        assert_eq!(capacity(&sim, &profile, 4), 1);
    }

    #[test]
    fn test_fragmentation() {
        let (sim, profile) = a100();
        sim.create_device_partition(0, profile.device_partition_profile(1).unwrap())
            .unwrap();
        sim.create_device_partition(0, profile.device_partition_profile(3).unwrap())
            .unwrap();
        // Three slices are unused but the 3-slice partition spans four units
        assert_eq!(capacity(&sim, &profile, 1), 2);
        assert_eq!(capacity(&sim, &profile, 2), 1);
    }

    #[test]
    fn test_compute_partitions_in_full_partition() {
        let (sim, profile) = a100();
        let gi = sim
            .create_device_partition(0, profile.device_partition_profile(7).unwrap())
            .unwrap();
        let ci_profile = |n| profile.compute_partition_profile(n).unwrap();

        assert_eq!(sim.compute_partition_capacity(gi, ci_profile(1)).unwrap(), 7);
        assert_eq!(sim.compute_partition_capacity(gi, ci_profile(2)).unwrap(), 3);
        assert_eq!(sim.compute_partition_capacity(gi, ci_profile(3)).unwrap(), 2);

        let first = sim.create_compute_partition(gi, ci_profile(3)).unwrap();
        let second = sim.create_compute_partition(gi, ci_profile(2)).unwrap();
        let a = sim.resolve_identity(first).unwrap();
        let b = sim.resolve_identity(second).unwrap();
        assert_eq!(a.device_partition_id, b.device_partition_id);
        assert_ne!(a.compute_partition_id, b.compute_partition_id);
    }

    #[test]
    fn test_destroy_in_use_partition_fails() {
        let (sim, profile) = a100();
        let gi = sim
            .create_device_partition(0, profile.device_partition_profile(2).unwrap())
            .unwrap();
        let ci = sim
            .create_compute_partition(gi, profile.compute_partition_profile(2).unwrap())
            .unwrap();

        assert!(matches!(sim.destroy_device_partition(gi), Err(MigError::Native(_))));
        sim.destroy_compute_partition(ci).unwrap();
        sim.destroy_device_partition(gi).unwrap();
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_compute_larger_than_parent_rejected() {
        let (sim, profile) = a100();
        let gi = sim
            .create_device_partition(0, profile.device_partition_profile(2).unwrap())
            .unwrap();
        let result = sim.create_compute_partition(gi, profile.compute_partition_profile(3).unwrap());
        assert!(matches!(result, Err(MigError::Native(_))));
    }

    #[test]
    fn test_ids_are_reused() {
        let (sim, profile) = a100();
        let one = profile.device_partition_profile(1).unwrap();
        let a = sim.create_device_partition(0, one).unwrap();
        let b = sim.create_device_partition(0, one).unwrap();
        sim.destroy_device_partition(a).unwrap();
        let c = sim.create_device_partition(0, one).unwrap();

        let state = sim.state.lock();
        assert_eq!(state.device_partitions[&b].id, 1);
        assert_eq!(state.device_partitions[&c].id, 0);
    }

    #[test]
    fn test_injected_failure() {
        let (sim, profile) = a100();
        sim.set_fail_creates(true);
        let result = sim.create_device_partition(0, profile.device_partition_profile(1).unwrap());
        assert!(matches!(result, Err(MigError::Native(_))));
        assert_eq!(sim.live_device_partitions(), 0);
    }

    #[test]
    fn test_unknown_device() {
        let (sim, profile) = a100();
        let result = sim.create_device_partition(3, profile.device_partition_profile(1).unwrap());
        assert!(matches!(result, Err(MigError::DeviceNotFound(3))));
    }

    #[test]
    fn test_a30_geometry() {
        let profile = DeviceProfile::a30();
        let sim = SimulatedBackend::new(vec![profile.clone()]);
        assert_eq!(capacity(&sim, &profile, 1), 4);
        assert_eq!(capacity(&sim, &profile, 2), 2);
        assert_eq!(capacity(&sim, &profile, 4), 1);
    }
}
