//! Device sampling and aggregation

use gpulet_core::{
    parse_status_report, AggregatedDevice, DeviceReading, GpuletError, GpuletResult, SamplerConfig,
};
use gpulet_runtime::{MachineSession, RunMode};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Queries device status on a machine
#[derive(Debug, Clone)]
pub struct ResourceSampler {
    config: SamplerConfig,
    keep_all: bool,
}

impl ResourceSampler {
    pub fn new(config: SamplerConfig, keep_all: bool) -> Self {
        Self { config, keep_all }
    }

    /// One status query, parsed into per-device readings
    pub async fn sample(&self, machine: &MachineSession) -> GpuletResult<Vec<DeviceReading>> {
        let output = machine
            .run(&self.config.status_command, RunMode::Blocking)
            .await?;
        if output.failed() {
            return Err(GpuletError::Unavailable(format!(
                "status query exited with {:?}: {}",
                output.status,
                output.text.trim()
            )));
        }
        let readings = parse_status_report(&output.text, machine.skip_gpus(), self.keep_all)?;
        trace!(machine = %machine.id(), ?readings, "Sampled devices");
        Ok(readings)
    }

    /// `n_passes` sequential samples folded into one estimate per device
    pub async fn aggregate(
        &self,
        machine: &MachineSession,
        n_passes: u32,
    ) -> GpuletResult<Vec<AggregatedDevice>> {
        let mut passes = Vec::with_capacity(n_passes as usize);
        for _ in 0..n_passes.max(1) {
            passes.push(self.sample(machine).await?);
        }
        let devices = aggregate_readings(&passes);
        debug!(machine = %machine.id(), passes = passes.len(), ?devices, "Aggregated devices");
        Ok(devices)
    }

    /// Raw process listing used to notice that dispatched jobs are running
    pub async fn process_listing(&self, machine: &MachineSession) -> GpuletResult<String> {
        let output = machine
            .run(&self.config.process_command, RunMode::Blocking)
            .await?;
        if output.failed() {
            return Err(GpuletError::Unavailable(format!(
                "process query exited with {:?}",
                output.status
            )));
        }
        Ok(output.text)
    }
}

/// Fold several passes of readings into free resources per device.
///
/// Free memory is the smallest seen (usage spikes are assumed to persist);
/// free utilization is 100 minus the mean usage. A device missing from any
/// pass is left out. Utilization is unknown if any pass lacked it.
pub fn aggregate_readings(passes: &[Vec<DeviceReading>]) -> Vec<AggregatedDevice> {
    let mut by_device: BTreeMap<u32, Vec<&DeviceReading>> = BTreeMap::new();
    for pass in passes {
        for reading in pass {
            by_device.entry(reading.id).or_default().push(reading);
        }
    }

    by_device
        .into_iter()
        .filter(|(_, readings)| readings.len() == passes.len())
        .map(|(id, readings)| {
            let mem_free = readings
                .iter()
                .map(|r| r.mem_free())
                .min()
                .unwrap_or(0);

            let utils: Option<Vec<u32>> = readings.iter().map(|r| r.util_used).collect();
            let util_free = utils.map(|utils| {
                let mean = utils.iter().map(|&u| f64::from(u)).sum::<f64>() / utils.len() as f64;
                100.0 - mean
            });

            AggregatedDevice {
                id,
                mem_free,
                util_free,
            }
        })
        .collect()
}
