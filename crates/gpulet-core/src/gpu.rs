//! GPU device readings and status-report parsing

use serde::{Deserialize, Serialize};

use crate::{GpuletError, GpuletResult};

/// One device as seen by a single status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Device index
    pub id: u32,
    /// Total memory in MiB
    pub mem_total: u64,
    /// Used memory in MiB
    pub mem_used: u64,
    /// Utilization in use (0-100), `None` when the device does not report it
    pub util_used: Option<u32>,
}

impl DeviceReading {
    /// Free memory in MiB
    pub fn mem_free(&self) -> u64 {
        self.mem_total.saturating_sub(self.mem_used)
    }

    /// Free utilization (0-100), `None` when unknown
    pub fn util_free(&self) -> Option<u32> {
        self.util_used.map(|u| 100u32.saturating_sub(u))
    }
}

/// Free resources of one device, folded over several readings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedDevice {
    /// Device index
    pub id: u32,
    /// Free memory in MiB
    pub mem_free: u64,
    /// Free utilization (0-100); `None` means unknown
    pub util_free: Option<f64>,
}

impl AggregatedDevice {
    /// Whether this device can take a job with the given thresholds.
    ///
    /// Unknown utilization only qualifies when the job asks for none.
    pub fn fits(&self, mem_threshold: u64, util_threshold: u32) -> bool {
        if self.mem_free < mem_threshold {
            return false;
        }
        match self.util_free {
            Some(free) => free >= f64::from(util_threshold),
            None => util_threshold == 0,
        }
    }
}

/// Parse a tabular device-status report.
///
/// The report has one header line and one row per device with the columns
/// `index, memory.used, memory.total, utilization.gpu`, each value optionally
/// followed by a unit (`1024 MiB`, `35 %`). Devices listed in `skip` are left out.
/// A device whose utilization is not numeric is dropped unless `keep_all` is set,
/// in which case it is kept with unknown utilization.
pub fn parse_status_report(
    report: &str,
    skip: &[u32],
    keep_all: bool,
) -> GpuletResult<Vec<DeviceReading>> {
    let mut rows = report
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    if rows.next().is_none() {
        return Err(GpuletError::Unavailable(
            "empty device status report".to_string(),
        ));
    }

    let mut readings = Vec::new();
    let mut reported = 0usize;

    for row in rows {
        let columns: Vec<&str> = row.split(',').map(str::trim).collect();
        if columns.len() != 4 {
            return Err(GpuletError::Unavailable(format!(
                "malformed device status row: {}",
                row
            )));
        }
        reported += 1;

        let id: u32 = parse_value(columns[0], row)?;
        if skip.contains(&id) {
            continue;
        }
        let mem_used: u64 = parse_value(columns[1], row)?;
        let mem_total: u64 = parse_value(columns[2], row)?;

        let util_used = match strip_unit(columns[3]).parse::<u32>() {
            Ok(util) => Some(util.min(100)),
            Err(_) if keep_all => None,
            Err(_) => continue,
        };

        readings.push(DeviceReading {
            id,
            mem_total,
            mem_used,
            util_used,
        });
    }

    if reported == 0 {
        return Err(GpuletError::Unavailable(
            "device status report lists no devices".to_string(),
        ));
    }

    Ok(readings)
}

fn strip_unit(value: &str) -> &str {
    value.split_whitespace().next().unwrap_or("")
}

fn parse_value<T: std::str::FromStr>(value: &str, row: &str) -> GpuletResult<T> {
    strip_unit(value).parse().map_err(|_| {
        GpuletError::Unavailable(format!("unparsable value '{}' in row: {}", value, row))
    })
}
