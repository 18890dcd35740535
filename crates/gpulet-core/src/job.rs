//! Job specifications and queue ordering

use serde::{Deserialize, Serialize};

use crate::{GpuletError, GpuletResult};

/// Placeholder in a command template that is replaced by the device index
pub const DEVICE_PLACEHOLDER: &str = "{}";

/// A queued job waiting for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Free memory the device must have, in MiB
    pub mem_threshold: u64,
    /// Free utilization the device must have (0-100)
    pub util_threshold: u32,
    /// Command to launch; contains one device placeholder
    pub command_template: String,
    /// Lower runs first when the queue is priority ordered
    #[serde(default)]
    pub priority: i32,
}

impl JobSpec {
    /// Create a job, validating the thresholds and the placeholder
    pub fn new(
        mem_threshold: u64,
        util_threshold: u32,
        command_template: impl Into<String>,
    ) -> GpuletResult<Self> {
        let command_template = command_template.into();
        if util_threshold > 100 {
            return Err(GpuletError::Queue(format!(
                "utilization threshold {} is above 100",
                util_threshold
            )));
        }
        if command_template.matches(DEVICE_PLACEHOLDER).count() != 1 {
            return Err(GpuletError::Queue(format!(
                "command must contain exactly one '{}' placeholder: {}",
                DEVICE_PLACEHOLDER, command_template
            )));
        }
        Ok(Self {
            mem_threshold,
            util_threshold,
            command_template,
            priority: 0,
        })
    }

    /// Set the priority of the job
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Parse the flat-text form `mem_threshold|util_threshold|command_template`.
    ///
    /// Only the first two `|` separate fields; the command may contain more.
    pub fn parse_line(line: &str) -> GpuletResult<Self> {
        let mut fields = line.trim().splitn(3, '|');
        let (Some(mem), Some(util), Some(command)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(GpuletError::Queue(format!(
                "expected mem|util|command, got: {}",
                line
            )));
        };

        let mem = mem
            .trim()
            .parse()
            .map_err(|_| GpuletError::Queue(format!("invalid memory threshold: {}", mem)))?;
        let util = util
            .trim()
            .parse()
            .map_err(|_| GpuletError::Queue(format!("invalid utilization threshold: {}", util)))?;

        Self::new(mem, util, command.trim())
    }

    /// Flat-text form of the job
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}",
            self.mem_threshold, self.util_threshold, self.command_template
        )
    }

    /// Command with the device placeholder filled in
    pub fn render(&self, device_id: u32) -> String {
        self.command_template
            .replacen(DEVICE_PLACEHOLDER, &device_id.to_string(), 1)
    }
}

/// Order in which a queue hands out jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    /// Oldest first
    #[default]
    Fifo,
    /// Lowest `priority` first, oldest first among equals
    Priority,
    /// Lowest utilization threshold first, oldest first among equals
    UtilThreshold,
}

impl QueueOrder {
    /// Position of the job that should be attempted next
    pub fn head(&self, jobs: &[JobSpec]) -> Option<usize> {
        let indexed = jobs.iter().enumerate();
        match self {
            QueueOrder::Fifo => indexed.map(|(i, _)| i).next(),
            QueueOrder::Priority => indexed.min_by_key(|(i, j)| (j.priority, *i)).map(|(i, _)| i),
            QueueOrder::UtilThreshold => indexed
                .min_by_key(|(i, j)| (j.util_threshold, *i))
                .map(|(i, _)| i),
        }
    }
}

impl std::fmt::Display for QueueOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOrder::Fifo => write!(f, "fifo"),
            QueueOrder::Priority => write!(f, "priority"),
            QueueOrder::UtilThreshold => write!(f, "util-threshold"),
        }
    }
}
