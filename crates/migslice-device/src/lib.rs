//! migslice-device: Device and partition handles
//!
//! This crate wraps the native partition-management library:
//! - The `PartitionBackend` seam and its simulated and NVML implementations
//! - The explicit library context
//! - `Device`, `DevicePartition` and `ComputePartition` ownership types
//! - `ReleaseSignal`, which wakes allocations waiting for capacity

pub mod backend;
pub mod context;
pub mod device;
#[cfg(feature = "nvml")]
pub mod nvml;
pub mod partition;
pub mod signal;
pub mod simulated;

pub use backend::{NativeHandle, PartitionBackend, PartitionIdentity, Placement};
pub use context::PartitionContext;
pub use device::Device;
#[cfg(feature = "nvml")]
pub use nvml::NvmlBackend;
pub use partition::{ComputePartition, DevicePartition};
pub use signal::ReleaseSignal;
pub use simulated::SimulatedBackend;
