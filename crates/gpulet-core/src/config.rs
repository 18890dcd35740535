//! Configuration types for gpulet

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::QueueOrder;

/// Main runner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Scheduling loop configuration
    pub scheduler: SchedulerConfig,
    /// Device status query configuration
    pub sampler: SamplerConfig,
    /// Execution session configuration
    pub session: SessionConfig,
    /// Queue lock configuration
    pub lock: LockConfig,
    /// Job queue configuration
    pub queue: QueueConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl RunnerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GpuletError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpuletError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::GpuletError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<(), crate::GpuletError> {
        if self.scheduler.n_passes == 0 {
            return Err(crate::GpuletError::Config(
                "scheduler.n_passes must be at least 1".to_string(),
            ));
        }
        check_interval("scheduler.poll_interval_secs", self.scheduler.poll_interval_secs)?;
        check_interval("scheduler.keep_time_secs", self.scheduler.keep_time_secs)?;
        if self.session.command_timeout_secs == 0 {
            return Err(crate::GpuletError::Config(
                "session.command_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Longest interval accepted for sleeps and reservation lifetimes (one year)
const MAX_INTERVAL_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn check_interval(name: &str, secs: f64) -> Result<(), crate::GpuletError> {
    if !secs.is_finite() || !(0.0..=MAX_INTERVAL_SECS).contains(&secs) {
        return Err(crate::GpuletError::Config(format!(
            "{} must be between 0 and {} seconds, got {}",
            name, MAX_INTERVAL_SECS, secs
        )));
    }
    Ok(())
}

/// Seconds as a `Duration`, clamped into the accepted range
fn clamped_secs(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_INTERVAL_SECS))
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of status queries folded into one estimate
    pub n_passes: u32,
    /// Seconds to sleep when nothing could be placed
    pub poll_interval_secs: f64,
    /// Seconds a dispatched job may stay invisible before its reservation lapses
    pub keep_time_secs: f64,
    /// Keep devices that do not report utilization
    pub keep_all: bool,
    /// Which queued job is attempted first
    pub queue_order: QueueOrder,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            n_passes: 4,
            poll_interval_secs: 60.0,
            keep_time_secs: 120.0,
            keep_all: false,
            queue_order: QueueOrder::Fifo,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        clamped_secs(self.poll_interval_secs)
    }

    pub fn keep_time(&self) -> Duration {
        clamped_secs(self.keep_time_secs)
    }
}

/// Device status query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Query producing the per-device table
    pub status_command: String,
    /// Query whose output lists running processes, used to spot started jobs
    pub process_command: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            status_command:
                "nvidia-smi --query-gpu=index,memory.used,memory.total,utilization.gpu --format=csv"
                    .to_string(),
            process_command: "nvidia-smi".to_string(),
        }
    }
}

/// Execution session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How commands reach a machine
    pub transport: TransportKind,
    /// Upper bound on a blocking command, in seconds
    pub command_timeout_secs: u64,
    /// Line printed after each blocking command; random per session when unset
    pub boundary_marker: Option<String>,
    /// File on the target machine that detached jobs append their output to
    pub dispatch_log: String,
    /// ssh client binary
    pub ssh_program: String,
    /// Extra ssh options, e.g. `["-p", "2222"]`
    pub ssh_options: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Shell,
            command_timeout_secs: 30,
            boundary_marker: None,
            dispatch_log: "~/.gpu_log".to_string(),
            ssh_program: "ssh".to_string(),
            ssh_options: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One long-lived shell per machine
    Shell,
    /// A fresh process per command
    Oneshot,
}

/// Queue lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How often a waiting `acquire` re-checks for markers, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding `<machine>.jobs` files
    pub dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text or compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
