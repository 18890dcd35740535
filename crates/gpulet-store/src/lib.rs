//! gpulet-store: Shared scheduler state
//!
//! This crate provides the collaborators shared between scheduler processes:
//! - Cooperative locking of named resources (filesystem or in-process markers)
//! - Job queues (flat text file or in-process)
//! - The machine registry (TOML file or in-process)

pub mod lock;
pub mod queue;
pub mod registry;

pub use lock::{FsLockStore, LockCoordinator, LockStore, MemoryLockStore};
pub use queue::{FileJobQueue, JobQueue, MemoryJobQueue};
pub use registry::{FileRegistry, MachineRegistry, MemoryRegistry};
