//! gpulet-core: Core types for the gpulet job runner
//!
//! This crate provides the fundamental types used throughout gpulet:
//! - Device readings, aggregated free resources and status-report parsing
//! - Job specifications and queue ordering
//! - Machine registry entries
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;
pub mod machine;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
pub use machine::*;
