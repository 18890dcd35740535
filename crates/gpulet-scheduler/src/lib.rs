//! gpulet-scheduler: GPU-aware job scheduling for gpulet
//!
//! This crate provides the per-machine scheduling loop and its parts:
//! - Device sampling and multi-pass aggregation
//! - Reservations for jobs that were launched but are not visible yet
//! - Device placement decisions
//! - The scheduling loop that drains a machine's queue

pub mod placement;
pub mod reservation;
pub mod sampler;
pub mod scheduler;

pub use placement::{MostIdleStrategy, PlacementStrategy};
pub use reservation::{Reservation, ReservationLedger};
pub use sampler::{aggregate_readings, ResourceSampler};
pub use scheduler::{
    Dispatch, MachineScheduler, SchedulerState, SharedServices, StopReason, TickReport,
};
