//! migslice-core: Core types for the migslice partition allocator
//!
//! This crate provides the types shared by every other migslice crate:
//! - Error handling
//! - Hardware profile tables mapping slice counts to native profile ids
//! - Configuration types

pub mod config;
pub mod error;
pub mod profile;

pub use config::*;
pub use error::*;
pub use profile::*;
