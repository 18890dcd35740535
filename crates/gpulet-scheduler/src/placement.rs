//! Device placement decisions

use gpulet_core::{AggregatedDevice, JobSpec};

/// Strategy for choosing a device for a job
pub trait PlacementStrategy: Send + Sync {
    /// Pick a device among `devices`, or `None` if no device can take the job
    fn place(&self, job: &JobSpec, devices: &[AggregatedDevice]) -> Option<u32>;

    fn name(&self) -> &'static str;
}

/// Picks the qualifying device with the most free utilization.
///
/// Ties go to the lowest device id.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostIdleStrategy;

impl PlacementStrategy for MostIdleStrategy {
    fn place(&self, job: &JobSpec, devices: &[AggregatedDevice]) -> Option<u32> {
        devices
            .iter()
            .filter(|d| d.fits(job.mem_threshold, job.util_threshold))
            .min_by(|a, b| {
                let a_free = a.util_free.unwrap_or(0.0);
                let b_free = b.util_free.unwrap_or(0.0);
                b_free.total_cmp(&a_free).then(a.id.cmp(&b.id))
            })
            .map(|d| d.id)
    }

    fn name(&self) -> &'static str {
        "most-idle"
    }
}
