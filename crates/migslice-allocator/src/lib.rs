//! migslice-allocator: Partition allocators for migslice
//!
//! This crate turns a requested slice count into a compute partition:
//! - The `Allocator` contract with per-allocator locking and wait policy
//! - The isolated strategy (one device partition per allocation)
//! - The shared strategy (one device partition for all allocations)
//! - Allocation-order sweeps

pub mod allocator;
pub mod isolated;
pub mod shared;
pub mod sweep;

pub use allocator::{create_allocator, Allocator};
pub use isolated::IsolatedAllocator;
pub use shared::SharedAllocator;
pub use sweep::{sweep_allocation_orders, SweepOutcome, SweepRun};
