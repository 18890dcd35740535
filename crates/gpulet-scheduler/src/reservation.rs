//! Reservation ledger for jobs that were launched but are not visible yet

use gpulet_core::AggregatedDevice;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Resources claimed by a dispatched job
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Rendered command that was launched
    pub command: String,
    /// Device the job was placed on
    pub device_id: u32,
    /// Memory claimed, in MiB
    pub mem_needed: u64,
    /// Utilization claimed
    pub util_needed: u32,
    /// When the job was dispatched
    pub created_at: Instant,
}

/// Per-machine set of in-flight dispatches.
///
/// Owned by one scheduling loop; each tick runs `reconcile` and `expire`
/// before `adjust` so that the matcher never sees stale numbers.
#[derive(Debug)]
pub struct ReservationLedger {
    keep_time: Duration,
    reservations: Vec<Reservation>,
}

impl ReservationLedger {
    /// Create a ledger whose reservations lapse after `keep_time`
    pub fn new(keep_time: Duration) -> Self {
        Self {
            keep_time,
            reservations: Vec::new(),
        }
    }

    /// Track a freshly dispatched job
    pub fn record(&mut self, reservation: Reservation) {
        info!(
            device = reservation.device_id,
            mem = reservation.mem_needed,
            util = reservation.util_needed,
            command = %reservation.command,
            "Reserved resources"
        );
        self.reservations.push(reservation);
    }

    /// Drop reservations whose command shows up in `status_text`.
    ///
    /// A substring match in the raw process listing stands in for "the job is
    /// running"; a command embedded in another command's text matches too.
    pub fn reconcile(&mut self, status_text: &str) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|r| {
            let running = status_text.contains(&r.command);
            if running {
                debug!(device = r.device_id, command = %r.command, "Job visible, releasing reservation");
            }
            !running
        });
        before - self.reservations.len()
    }

    /// Drop reservations older than the keep time
    pub fn expire(&mut self, now: Instant) -> usize {
        let keep_time = self.keep_time;
        let before = self.reservations.len();
        self.reservations.retain(|r| {
            let live = now.saturating_duration_since(r.created_at) < keep_time;
            if !live {
                debug!(device = r.device_id, command = %r.command, "Reservation expired");
            }
            live
        });
        before - self.reservations.len()
    }

    /// Subtract live reservations from the observed free resources, clamping at zero
    pub fn adjust(&self, devices: &[AggregatedDevice]) -> Vec<AggregatedDevice> {
        devices
            .iter()
            .map(|device| {
                let mut adjusted = *device;
                for r in self.reservations.iter().filter(|r| r.device_id == device.id) {
                    adjusted.mem_free = adjusted.mem_free.saturating_sub(r.mem_needed);
                    adjusted.util_free = adjusted
                        .util_free
                        .map(|free| (free - f64::from(r.util_needed)).max(0.0));
                }
                adjusted
            })
            .collect()
    }

    /// Live reservations
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}
