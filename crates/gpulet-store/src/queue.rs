//! Job queues
//!
//! Queues are plain containers; callers that read and then modify one must hold
//! its lock (see [`crate::lock`]) for the whole sequence.

use async_trait::async_trait;
use gpulet_core::{GpuletError, GpuletResult, JobSpec};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Queue of pending jobs for one machine
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Name of the resource to lock around read-modify-write sequences
    fn resource(&self) -> String;

    /// Pending jobs, oldest first
    async fn pending(&self) -> GpuletResult<Vec<JobSpec>>;

    /// Append a job
    async fn push(&self, job: &JobSpec) -> GpuletResult<()>;

    /// Remove the oldest entry equal to `job`. Returns whether one was found.
    async fn remove(&self, job: &JobSpec) -> GpuletResult<bool>;
}

/// Queue stored as a flat text file, one `mem|util|command` job per line.
///
/// Lines that do not parse are reported and left untouched.
#[derive(Debug, Clone)]
pub struct FileJobQueue {
    path: PathBuf,
}

impl FileJobQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> GpuletResult<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file contents through a temporary file and a rename
    async fn write_lines(&self, lines: &[String]) -> GpuletResult<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for FileJobQueue {
    fn resource(&self) -> String {
        self.path.display().to_string()
    }

    async fn pending(&self) -> GpuletResult<Vec<JobSpec>> {
        let mut jobs = Vec::new();
        for (n, line) in self.read_lines().await?.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match JobSpec::parse_line(line) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(
                    queue = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "Skipping malformed job line"
                ),
            }
        }
        Ok(jobs)
    }

    async fn push(&self, job: &JobSpec) -> GpuletResult<()> {
        let mut lines = self.read_lines().await?;
        lines.retain(|l| !l.trim().is_empty());
        lines.push(job.to_line());
        self.write_lines(&lines).await?;
        debug!(queue = %self.path.display(), job = %job.to_line(), "Job queued");
        Ok(())
    }

    async fn remove(&self, job: &JobSpec) -> GpuletResult<bool> {
        let mut lines = self.read_lines().await?;
        let target = job.to_line();
        let Some(pos) = lines
            .iter()
            .position(|l| JobSpec::parse_line(l).map_or(false, |j| j.to_line() == target))
        else {
            return Ok(false);
        };
        lines.remove(pos);
        self.write_lines(&lines).await?;
        debug!(queue = %self.path.display(), job = %target, "Job removed");
        Ok(true)
    }
}

/// In-process queue
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    name: String,
    jobs: Mutex<Vec<JobSpec>>,
}

impl MemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    fn jobs(&self) -> GpuletResult<std::sync::MutexGuard<'_, Vec<JobSpec>>> {
        self.jobs
            .lock()
            .map_err(|_| GpuletError::Internal("queue mutex poisoned".to_string()))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn resource(&self) -> String {
        self.name.clone()
    }

    async fn pending(&self) -> GpuletResult<Vec<JobSpec>> {
        Ok(self.jobs()?.clone())
    }

    async fn push(&self, job: &JobSpec) -> GpuletResult<()> {
        self.jobs()?.push(job.clone());
        Ok(())
    }

    async fn remove(&self, job: &JobSpec) -> GpuletResult<bool> {
        let mut jobs = self.jobs()?;
        match jobs.iter().position(|j| j == job) {
            Some(pos) => {
                jobs.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
