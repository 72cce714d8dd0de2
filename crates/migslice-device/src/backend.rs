//! Native partition-management seam

use migslice_core::{MigResult, ProfileId};

/// Opaque token for a native partition resource
///
/// Backends decide what the value means; callers only pass it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where a device partition sits on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// First placement unit
    pub start: u32,
    /// Number of placement units occupied
    pub size: u32,
}

/// Metadata identifying a compute partition to the outside world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIdentity {
    /// Hardware UUID of the parent device
    pub device_uuid: String,
    /// Id of the device partition within the device
    pub device_partition_id: u32,
    /// Id of the compute partition within its device partition
    pub compute_partition_id: u32,
}

impl PartitionIdentity {
    /// The `CUDA_VISIBLE_DEVICES` form: `MIG-<uuid>/<gi>/<ci>`
    pub fn visible_device_string(&self) -> String {
        format!(
            "MIG-{}/{}/{}",
            self.device_uuid, self.device_partition_id, self.compute_partition_id
        )
    }
}

/// Native partition-management library
///
/// Implementations only record and sequence calls; ownership rules are
/// enforced by the partition handle types built on top.
pub trait PartitionBackend: Send + Sync {
    /// Number of devices visible to the backend
    fn device_count(&self) -> MigResult<u32>;

    /// Hardware UUID of a device
    fn device_uuid(&self, device: u32) -> MigResult<String>;

    /// Create a device-level partition
    fn create_device_partition(&self, device: u32, profile: ProfileId) -> MigResult<NativeHandle>;

    /// Destroy a device-level partition
    fn destroy_device_partition(&self, handle: NativeHandle) -> MigResult<()>;

    /// Create a compute-level partition inside a device partition
    fn create_compute_partition(
        &self,
        parent: NativeHandle,
        profile: ProfileId,
    ) -> MigResult<NativeHandle>;

    /// Destroy a compute-level partition
    fn destroy_compute_partition(&self, handle: NativeHandle) -> MigResult<()>;

    /// How many more device partitions of `profile` the device could host
    fn device_partition_capacity(&self, device: u32, profile: ProfileId) -> MigResult<u32>;

    /// How many more compute partitions of `profile` a device partition could host
    fn compute_partition_capacity(&self, parent: NativeHandle, profile: ProfileId)
        -> MigResult<u32>;

    /// Placement of a device partition
    fn device_partition_placement(&self, handle: NativeHandle) -> MigResult<Placement>;

    /// Resolve the identity of a compute partition
    fn resolve_identity(&self, handle: NativeHandle) -> MigResult<PartitionIdentity>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_device_string() {
        let identity = PartitionIdentity {
            device_uuid: "GPU-5f2c".to_string(),
            device_partition_id: 3,
            compute_partition_id: 0,
        };
        assert_eq!(identity.visible_device_string(), "MIG-GPU-5f2c/3/0");
    }

    #[test]
    fn test_handle_round_trip() {
        let handle = NativeHandle::from_raw(0xdead_beef);
        assert_eq!(handle.raw(), 0xdead_beef);
    }
}
