//! CLI commands implementation

use anyhow::{Context, Result};
use gpulet_core::{AggregatedDevice, JobSpec, MachineSpec, RunnerConfig};
use gpulet_runtime::{DefaultConnector, MachineSession};
use gpulet_scheduler::ResourceSampler;
use gpulet_store::{FileJobQueue, FileRegistry, JobQueue, LockCoordinator, MachineRegistry};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where machines, queues and locks live
pub struct Workspace {
    config: RunnerConfig,
    registry: Option<FileRegistry>,
    job_file: Option<PathBuf>,
    locks: LockCoordinator,
}

impl Workspace {
    pub fn new(config: RunnerConfig, machines: Option<PathBuf>, job_file: Option<PathBuf>) -> Self {
        let locks = LockCoordinator::filesystem(config.lock.poll_interval());
        Self {
            registry: machines.map(FileRegistry::new),
            job_file,
            locks,
            config,
        }
    }

    /// Registry entry for `id`; without a registry every id names this host
    pub async fn machine(&self, id: &str) -> Result<MachineSpec> {
        match &self.registry {
            Some(registry) => registry
                .get(id)
                .await?
                .with_context(|| format!("Machine '{}' is not registered", id)),
            None => Ok(MachineSpec::local(id)),
        }
    }

    /// Job queue of machine `id`
    pub async fn queue(&self, id: &str) -> Result<FileJobQueue> {
        if let Some(path) = &self.job_file {
            return Ok(FileJobQueue::new(path));
        }
        let machine = self.machine(id).await?;
        Ok(FileJobQueue::new(machine.job_file_in(&self.config.queue.dir)))
    }

    /// Lock `queue`, run `f`, then unlock whatever `f` returned.
    ///
    /// An error from `f` wins over an error releasing the lock.
    async fn with_queue_lock<T, F, Fut>(&self, queue: &FileJobQueue, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let resource = queue.resource();
        let suffix = self.locks.acquire(&resource, None).await?;
        let result = f().await;
        match self.locks.release(&resource, &suffix).await {
            Ok(()) => result,
            Err(e) if result.is_err() => {
                warn!(resource = %resource, error = %e, "Failed to release queue lock");
                result
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every lock marker this process still holds
    pub async fn release_all(&self) {
        self.locks.release_all().await;
    }
}

/// Queue a job
pub async fn submit(
    ws: &Workspace,
    machine: &str,
    mem: u64,
    util: u32,
    command: Vec<String>,
) -> Result<()> {
    let job = JobSpec::new(mem, util, command.join(" "))?;
    let queue = ws.queue(machine).await?;

    let (queue_ref, job_ref) = (&queue, &job);
    ws.with_queue_lock(&queue, move || async move {
        queue_ref.push(job_ref).await?;
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    println!("Queued on '{}': {}", machine, job.to_line());
    Ok(())
}

/// List queued jobs
pub async fn jobs(ws: &Workspace, machine: &str) -> Result<()> {
    let queue = ws.queue(machine).await?;
    let jobs = queue.pending().await?;

    if jobs.is_empty() {
        println!("No jobs queued for '{}'", machine);
        return Ok(());
    }

    println!("{:<5} {:>10} {:>6}  {}", "#", "MEM (MiB)", "UTIL", "COMMAND");
    println!("{}", "-".repeat(60));
    for (i, job) in jobs.iter().enumerate() {
        println!(
            "{:<5} {:>10} {:>6}  {}",
            i + 1,
            job.mem_threshold,
            job.util_threshold,
            job.command_template
        );
    }
    Ok(())
}

/// Remove the job at 1-based `position`
pub async fn remove(ws: &Workspace, machine: &str, position: usize) -> Result<()> {
    let queue = ws.queue(machine).await?;

    let queue_ref = &queue;
    let removed = ws
        .with_queue_lock(&queue, move || async move {
            let jobs = queue_ref.pending().await?;
            let job = position
                .checked_sub(1)
                .and_then(|i| jobs.get(i))
                .with_context(|| {
                    format!("No job #{} (queue has {} jobs)", position, jobs.len())
                })?
                .clone();
            queue_ref.remove(&job).await?;
            Ok::<_, anyhow::Error>(job)
        })
        .await?;

    println!("Removed from '{}': {}", machine, removed.to_line());
    Ok(())
}

#[derive(Debug, Serialize)]
struct GpuReport<'a> {
    machine: &'a str,
    passes: u32,
    devices: &'a [AggregatedDevice],
}

/// Sample a machine's devices and show what is free
pub async fn gpus(
    ws: &Workspace,
    machine: &str,
    passes: Option<u32>,
    keep_all: bool,
    json: bool,
) -> Result<()> {
    let spec = ws.machine(machine).await?;
    let passes = passes.unwrap_or(ws.config.scheduler.n_passes);
    let keep_all = keep_all || ws.config.scheduler.keep_all;

    let connector = DefaultConnector::new(ws.config.session.clone());
    let session = MachineSession::open(spec, &connector).await?;
    let sampler = ResourceSampler::new(ws.config.sampler.clone(), keep_all);
    let result = sampler.aggregate(&session, passes).await;
    session.close().await;
    let devices = result?;

    if json {
        let report = GpuReport {
            machine,
            passes,
            devices: &devices,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print!("{}", format_devices(&devices));
    Ok(())
}

fn format_devices(devices: &[AggregatedDevice]) -> String {
    let mut out = format!("{:<5} {:>14} {:>10}\n", "GPU", "MEM FREE (MiB)", "UTIL FREE");
    for device in devices {
        let util = match device.util_free {
            Some(free) => format!("{:.1}%", free),
            None => "unknown".to_string(),
        };
        out.push_str(&format!("{:<5} {:>14} {:>10}\n", device.id, device.mem_free, util));
    }
    out
}

/// Show lock markers on a machine's queue
pub async fn locks(ws: &Workspace, machine: &str) -> Result<()> {
    let queue = ws.queue(machine).await?;
    let markers = ws.locks.markers(&queue.resource()).await?;

    if markers.is_empty() {
        println!("{} is not locked", queue.path().display());
    } else {
        for suffix in markers {
            println!("{}.lock_{}", queue.path().display(), suffix);
        }
    }
    Ok(())
}

/// Remove a stale lock marker from a machine's queue
pub async fn unlock(ws: &Workspace, machine: &str, suffix: &str) -> Result<()> {
    let queue = ws.queue(machine).await?;
    let resource = queue.resource();
    debug!(resource = %resource, suffix, "Releasing lock");
    ws.locks.release(&resource, suffix).await?;
    println!("Released {}.lock_{}", resource, suffix);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &std::path::Path) -> Workspace {
        let mut config = RunnerConfig::default();
        config.queue.dir = dir.to_path_buf();
        config.lock.poll_interval_ms = 5;
        Workspace::new(config, None, None)
    }

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_submit_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());

        submit(&ws, "box", 1000, 10, words("train.py --device={}")).await.unwrap();
        submit(&ws, "box", 2000, 20, words("eval.py --device={}")).await.unwrap();

        let queue = ws.queue("box").await.unwrap();
        assert_eq!(queue.path(), dir.path().join("box.jobs"));
        assert_eq!(queue.pending().await.unwrap().len(), 2);

        remove(&ws, "box", 1).await.unwrap();
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_template, "eval.py --device={}");

        assert!(remove(&ws, "box", 0).await.is_err());
        assert!(remove(&ws, "box", 5).await.is_err());

        // Lock markers never outlive a command, even a failed one.
        assert!(ws.locks.markers(&queue.resource()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        assert!(submit(&ws, "box", 1000, 10, words("train.py")).await.is_err());
        assert!(ws.queue("box").await.unwrap().pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_stale_marker() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let queue = ws.queue("box").await.unwrap();

        let stale = dir.path().join("box.jobs.lock_dead-beef");
        std::fs::write(&stale, "").unwrap();
        assert_eq!(
            ws.locks.markers(&queue.resource()).await.unwrap(),
            vec!["dead-beef".to_string()]
        );

        unlock(&ws, "box", "dead-beef").await.unwrap();
        assert!(!stale.exists());
        unlock(&ws, "box", "dead-beef").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("machines.toml");
        std::fs::write(
            &registry,
            "[[machines]]\nid = \"gpu1\"\naddress = \"10.0.0.5\"\njob_file = \"/srv/gpu1.jobs\"\n",
        )
        .unwrap();

        let ws = Workspace::new(RunnerConfig::default(), Some(registry), None);
        assert_eq!(
            ws.queue("gpu1").await.unwrap().path(),
            std::path::Path::new("/srv/gpu1.jobs")
        );
        assert!(ws.machine("gpu2").await.is_err());
    }

    #[test]
    fn test_format_devices() {
        let out = format_devices(&[
            AggregatedDevice {
                id: 0,
                mem_free: 2000,
                util_free: Some(50.0),
            },
            AggregatedDevice {
                id: 1,
                mem_free: 100,
                util_free: None,
            },
        ]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("2000") && lines[1].ends_with("50.0%"));
        assert!(lines[2].ends_with("unknown"));
    }

    #[tokio::test]
    async fn test_failed_command_keeps_its_error_and_unlocks() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let queue = ws.queue("box").await.unwrap();

        let result: Result<()> = ws
            .with_queue_lock(&queue, || async { Err::<(), _>(anyhow::anyhow!("queue rewrite failed")) })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "queue rewrite failed");
        assert!(ws.locks.markers(&queue.resource()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_command_lock_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let queue = ws.queue("box").await.unwrap();

        // Dropped while holding the lock, as on Ctrl-C.
        let interrupted = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ws.with_queue_lock(&queue, || std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(interrupted.is_err());
        assert_eq!(ws.locks.markers(&queue.resource()).await.unwrap().len(), 1);

        ws.release_all().await;
        assert!(ws.locks.markers(&queue.resource()).await.unwrap().is_empty());
        assert_eq!(ws.locks.held_count(), 0);
    }
}
