//! Per-machine scheduling loop

use gpulet_core::{
    AggregatedDevice, GpuletError, GpuletResult, JobSpec, MachineSpec, SamplerConfig,
    SchedulerConfig,
};
use gpulet_runtime::{Connector, MachineSession, RunMode};
use gpulet_store::{JobQueue, LockCoordinator, MachineRegistry};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::placement::{MostIdleStrategy, PlacementStrategy};
use crate::reservation::{Reservation, ReservationLedger};
use crate::sampler::ResourceSampler;

/// Where a scheduling loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for a job, or sleeping between ticks
    Idle,
    /// Sampling devices and looking for one that fits the head job
    Matching,
    /// Launching the job on the chosen device
    Dispatching,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Matching => write!(f, "matching"),
            SchedulerState::Dispatching => write!(f, "dispatching"),
        }
    }
}

/// Collaborators shared by every machine's loop
#[derive(Clone)]
pub struct SharedServices {
    pub connector: Arc<dyn Connector>,
    pub registry: Arc<dyn MachineRegistry>,
    pub locks: Arc<LockCoordinator>,
}

/// A job that was launched during a tick
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub job: JobSpec,
    pub device_id: u32,
    pub command: String,
}

/// Why a tick stopped draining the queue
#[derive(Debug)]
pub enum StopReason {
    /// Machine is disabled or no longer registered
    Disabled,
    /// Nothing pending
    QueueEmpty,
    /// The head job fits no device right now
    NoFit,
    /// Sampling, transport, or dispatch went wrong; retried next tick
    Failed(GpuletError),
    /// Shutdown was requested before the next job was committed
    Shutdown,
}

/// Outcome of one tick
#[derive(Debug)]
pub struct TickReport {
    pub dispatched: Vec<Dispatch>,
    pub stop: StopReason,
}

enum Attempt {
    Dispatched(Dispatch),
    Stop(StopReason),
}

/// Scheduling loop for one machine.
///
/// Owns the machine's session and reservation ledger; nothing else touches
/// either while the loop runs.
pub struct MachineScheduler {
    machine_id: String,
    config: SchedulerConfig,
    sampler: ResourceSampler,
    ledger: ReservationLedger,
    placement: Arc<dyn PlacementStrategy>,
    queue: Arc<dyn JobQueue>,
    services: SharedServices,
    session: Option<MachineSession>,
    state: SchedulerState,
}

impl MachineScheduler {
    /// Create a loop for `machine_id` that drains `queue`
    pub fn new(
        machine_id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        services: SharedServices,
        config: SchedulerConfig,
        sampler: SamplerConfig,
    ) -> Self {
        let machine_id = machine_id.into();
        info!(
            machine = %machine_id,
            n_passes = config.n_passes,
            poll_interval = ?config.poll_interval(),
            keep_time = ?config.keep_time(),
            queue_order = %config.queue_order,
            "Scheduler initialized"
        );

        Self {
            sampler: ResourceSampler::new(sampler, config.keep_all),
            ledger: ReservationLedger::new(config.keep_time()),
            placement: Arc::new(MostIdleStrategy),
            machine_id,
            config,
            queue,
            services,
            session: None,
            state: SchedulerState::Idle,
        }
    }

    /// Replace the placement strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// In-flight reservations on this machine
    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    /// Dispatch as many queued jobs as currently fit.
    ///
    /// Stops at the first job that cannot be placed, so the queue's order is
    /// preserved. Failures never escape: they end the tick and are reported.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_until(&CancellationToken::new()).await
    }

    /// Like `tick`, but gives up between jobs once `shutdown` fires.
    ///
    /// Waiting for the lock and sampling are abandoned on shutdown. A launch
    /// that has started always runs on until its job is removed from the queue.
    pub async fn tick_until(&mut self, shutdown: &CancellationToken) -> TickReport {
        let mut dispatched = Vec::new();
        let stop = loop {
            if shutdown.is_cancelled() {
                break StopReason::Shutdown;
            }
            match self.attempt(shutdown).await {
                Ok(Attempt::Dispatched(dispatch)) => dispatched.push(dispatch),
                Ok(Attempt::Stop(reason)) => break reason,
                Err(e) => {
                    self.handle_failure(&e).await;
                    break StopReason::Failed(e);
                }
            }
        };
        self.state = SchedulerState::Idle;

        debug!(
            machine = %self.machine_id,
            dispatched = dispatched.len(),
            stop = ?stop,
            reservations = self.ledger.len(),
            "Tick finished"
        );
        TickReport { dispatched, stop }
    }

    /// Tick until `shutdown` fires, sleeping between ticks
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(machine = %self.machine_id, "Scheduling loop started");

        loop {
            let report = self.tick_until(&shutdown).await;
            if matches!(report.stop, StopReason::Shutdown) {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.state = SchedulerState::Idle;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        info!(machine = %self.machine_id, "Scheduling loop stopped");
    }

    /// Try to place and launch the next job, holding the queue lock throughout
    async fn attempt(&mut self, shutdown: &CancellationToken) -> GpuletResult<Attempt> {
        self.state = SchedulerState::Idle;
        let spec = match self.services.registry.get(&self.machine_id).await? {
            Some(spec) if spec.enabled => spec,
            Some(_) => {
                debug!(machine = %self.machine_id, "Machine disabled");
                return Ok(Attempt::Stop(StopReason::Disabled));
            }
            None => {
                warn!(machine = %self.machine_id, "Machine no longer registered");
                return Ok(Attempt::Stop(StopReason::Disabled));
            }
        };

        let resource = self.queue.resource();
        let locks = self.services.locks.clone();
        // A marker left by an interrupted acquire is removed by `release_all`.
        let suffix = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Attempt::Stop(StopReason::Shutdown)),
            suffix = locks.acquire(&resource, None) => suffix?,
        };
        let result = self.attempt_locked(spec, shutdown).await;
        if let Err(e) = locks.release(&resource, &suffix).await {
            warn!(resource = %resource, error = %e, "Failed to release queue lock");
        }
        result
    }

    async fn attempt_locked(
        &mut self,
        spec: MachineSpec,
        shutdown: &CancellationToken,
    ) -> GpuletResult<Attempt> {
        let jobs = self.queue.pending().await?;
        let Some(head) = self.config.queue_order.head(&jobs) else {
            return Ok(Attempt::Stop(StopReason::QueueEmpty));
        };
        let job = jobs[head].clone();

        self.state = SchedulerState::Matching;
        let sampled = tokio::select! {
            _ = shutdown.cancelled() => None,
            sampled = self.sample(spec) => Some(sampled),
        };
        let Some(sampled) = sampled else {
            return Ok(Attempt::Stop(StopReason::Shutdown));
        };
        let (devices, listing) = sampled?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| GpuletError::Internal("no session after connect".to_string()))?;

        self.ledger.reconcile(&listing);
        self.ledger.expire(Instant::now());
        let devices = self.ledger.adjust(&devices);

        let Some(device_id) = self.placement.place(&job, &devices) else {
            debug!(
                machine = %self.machine_id,
                mem = job.mem_threshold,
                util = job.util_threshold,
                strategy = self.placement.name(),
                ?devices,
                "No device fits head job"
            );
            return Ok(Attempt::Stop(StopReason::NoFit));
        };

        self.state = SchedulerState::Dispatching;
        let command = job.render(device_id);
        let output = session.run(&command, RunMode::Detached).await?;
        if output.failed() {
            return Err(GpuletError::Dispatch(format!(
                "launch exited with {:?}: {}",
                output.status,
                output.text.trim()
            )));
        }

        self.ledger.record(Reservation {
            command: command.clone(),
            device_id,
            mem_needed: job.mem_threshold,
            util_needed: job.util_threshold,
            created_at: Instant::now(),
        });
        if !self.queue.remove(&job).await? {
            warn!(machine = %self.machine_id, job = %job.to_line(), "Dispatched job was already gone from the queue");
        }

        info!(machine = %self.machine_id, device = device_id, command = %command, "Dispatched job");
        Ok(Attempt::Dispatched(Dispatch {
            job,
            device_id,
            command,
        }))
    }

    /// Connect if needed, then read device status and the process listing
    async fn sample(&mut self, spec: MachineSpec) -> GpuletResult<(Vec<AggregatedDevice>, String)> {
        self.ensure_session(spec).await?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| GpuletError::Internal("no session after connect".to_string()))?;

        let devices = self.sampler.aggregate(session, self.config.n_passes).await?;
        let listing = self.sampler.process_listing(session).await?;
        Ok((devices, listing))
    }

    /// Open a session if there is none, or reopen it if the machine's address changed
    async fn ensure_session(&mut self, spec: MachineSpec) -> GpuletResult<()> {
        if let Some(session) = self.session.as_mut() {
            let current = session.spec();
            if current.ssh_target() == spec.ssh_target()
                && current.identity_file == spec.identity_file
            {
                session.update_spec(spec);
                return Ok(());
            }
            info!(machine = %self.machine_id, "Machine address changed, reconnecting");
            session.close().await;
            self.session = None;
        }

        let session = MachineSession::open(spec, self.services.connector.as_ref()).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn handle_failure(&mut self, e: &GpuletError) {
        match e {
            GpuletError::Dispatch(_) | GpuletError::Timeout(_) => {
                error!(machine = %self.machine_id, state = %self.state, error = %e, "Job dispatch failed, job stays queued");
            }
            GpuletError::Unavailable(_) => {
                warn!(machine = %self.machine_id, error = %e, "No schedulable devices this tick");
            }
            _ => {
                warn!(machine = %self.machine_id, state = %self.state, error = %e, "Tick failed");
            }
        }

        if e.is_connection_lost() {
            if let Some(session) = self.session.take() {
                session.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpulet_core::QueueOrder;
    use gpulet_runtime::{CommandOutput, Session};
    use gpulet_store::{MemoryJobQueue, MemoryLockStore, MemoryRegistry};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const HEADER: &str = "index, memory.used [MiB], memory.total [MiB], utilization.gpu [%]";

    /// A machine the fake sessions talk to
    #[derive(Default)]
    struct FakeMachine {
        rows: Mutex<String>,
        listing: Mutex<String>,
        sent: Mutex<Vec<(String, RunMode)>>,
        hang_status: AtomicBool,
        fail_dispatch: AtomicBool,
        refuse_connect: AtomicBool,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeMachine {
        fn with_rows(rows: &str) -> Arc<Self> {
            let machine = Self::default();
            *machine.rows.lock().unwrap() = rows.to_string();
            *machine.listing.lock().unwrap() = "No running processes found\n".to_string();
            Arc::new(machine)
        }

        fn detached(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, mode)| *mode == RunMode::Detached)
                .map(|(cmd, _)| cmd.clone())
                .collect()
        }

        fn was_sent(&self, command: &str) -> bool {
            self.sent.lock().unwrap().iter().any(|(cmd, _)| cmd == command)
        }
    }

    struct FakeSession {
        machine: Arc<FakeMachine>,
        sampler: SamplerConfig,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn run(&mut self, command: &str, mode: RunMode) -> GpuletResult<CommandOutput> {
            self.machine
                .sent
                .lock()
                .unwrap()
                .push((command.to_string(), mode));

            if mode == RunMode::Detached {
                if self.machine.fail_dispatch.load(Ordering::SeqCst) {
                    return Err(GpuletError::Dispatch("exit status 1".to_string()));
                }
                return Ok(CommandOutput::default());
            }
            if command == self.sampler.status_command && self.machine.hang_status.load(Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let text = if command == self.sampler.status_command {
                format!("{}\n{}", HEADER, self.machine.rows.lock().unwrap())
            } else if command == self.sampler.process_command {
                self.machine.listing.lock().unwrap().clone()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                text,
                status: Some(0),
            })
        }

        async fn close(&mut self) -> GpuletResult<()> {
            self.machine.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    struct FakeConnector {
        machine: Arc<FakeMachine>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _machine: &MachineSpec) -> GpuletResult<Box<dyn Session>> {
            self.machine.connects.fetch_add(1, Ordering::SeqCst);
            if self.machine.refuse_connect.load(Ordering::SeqCst) {
                return Err(GpuletError::Transport("connection refused".to_string()));
            }
            Ok(Box::new(FakeSession {
                machine: self.machine.clone(),
                sampler: SamplerConfig::default(),
            }))
        }
    }

    /// Queue whose removals take a while, to widen the launch-to-remove window
    struct SlowRemoveQueue {
        inner: Arc<MemoryJobQueue>,
        delay: Duration,
    }

    #[async_trait]
    impl JobQueue for SlowRemoveQueue {
        fn resource(&self) -> String {
            self.inner.resource()
        }

        async fn pending(&self) -> GpuletResult<Vec<JobSpec>> {
            self.inner.pending().await
        }

        async fn push(&self, job: &JobSpec) -> GpuletResult<()> {
            self.inner.push(job).await
        }

        async fn remove(&self, job: &JobSpec) -> GpuletResult<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.remove(job).await
        }
    }

    struct Harness {
        machine: Arc<FakeMachine>,
        queue: Arc<MemoryJobQueue>,
        registry: Arc<MemoryRegistry>,
        locks: Arc<LockCoordinator>,
        services: SharedServices,
        config: SchedulerConfig,
        scheduler: MachineScheduler,
    }

    async fn harness(rows: &str, jobs: &[JobSpec]) -> Harness {
        let machine = FakeMachine::with_rows(rows);
        let queue = Arc::new(MemoryJobQueue::new("box.jobs"));
        for job in jobs {
            queue.push(job).await.unwrap();
        }
        let registry = Arc::new(MemoryRegistry::new(vec![MachineSpec::local("box")]));
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(MemoryLockStore::new()),
            Duration::from_millis(5),
        ));
        let services = SharedServices {
            connector: Arc::new(FakeConnector {
                machine: machine.clone(),
            }),
            registry: registry.clone(),
            locks: locks.clone(),
        };
        let config = SchedulerConfig {
            n_passes: 2,
            poll_interval_secs: 0.01,
            ..SchedulerConfig::default()
        };
        let scheduler = MachineScheduler::new(
            "box",
            queue.clone(),
            services.clone(),
            config.clone(),
            SamplerConfig::default(),
        );

        Harness {
            machine,
            queue,
            registry,
            locks,
            services,
            config,
            scheduler,
        }
    }

    fn job(mem: u64, util: u32, template: &str) -> JobSpec {
        JobSpec::new(mem, util, template).unwrap()
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_tick_dispatches_fitting_job() {
        let mut h = harness(
            "0, 6000 MiB, 8000 MiB, 50 %\n",
            &[job(1000, 10, "train --device={}")],
        ).await;

        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert!(matches!(report.stop, StopReason::QueueEmpty));

        assert!(h.queue.pending().await.unwrap().is_empty());
        let reservations = h.scheduler.ledger().reservations();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].device_id, 0);
        assert_eq!(reservations[0].mem_needed, 1000);
        assert_eq!(reservations[0].util_needed, 10);
        assert_eq!(h.machine.detached(), vec!["train --device=0".to_string()]);

        assert_eq!(h.locks.held_count(), 0);
        assert!(h.locks.markers("box.jobs").await.unwrap().is_empty());
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_job_too_large_stays_queued() {
        let mut h = harness(
            "0, 5000 MiB, 8000 MiB, 90 %\n1, 4500 MiB, 8000 MiB, 60 %\n",
            &[job(4000, 20, "big --device={}")],
        ).await;

        let report = h.scheduler.tick().await;
        assert!(report.dispatched.is_empty());
        assert!(matches!(report.stop, StopReason::NoFit));
        assert_eq!(h.queue.pending().await.unwrap().len(), 1);
        assert!(h.machine.detached().is_empty());
        assert!(h.scheduler.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_tick_drains_until_full() {
        let mut h = harness(
            "0, 5500 MiB, 8000 MiB, 10 %\n",
            &[
                job(1000, 10, "a --device={}"),
                job(1000, 10, "b --device={}"),
                job(1000, 10, "c --device={}"),
            ],
        ).await;

        let report = h.scheduler.tick().await;
        // 2500 MiB free covers two jobs; reservations hide the rest.
        assert_eq!(report.dispatched.len(), 2);
        assert!(matches!(report.stop, StopReason::NoFit));
        assert_eq!(h.queue.pending().await.unwrap(), vec![job(1000, 10, "c --device={}")]);
        assert_eq!(
            h.machine.detached(),
            vec!["a --device=0".to_string(), "b --device=0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_head_job_blocks_later_jobs() {
        let mut h = harness(
            "0, 7000 MiB, 8000 MiB, 10 %\n",
            &[job(4000, 10, "big --device={}"), job(100, 10, "small --device={}")],
        ).await;

        let report = h.scheduler.tick().await;
        assert!(report.dispatched.is_empty());
        assert!(matches!(report.stop, StopReason::NoFit));
        assert_eq!(h.queue.pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_priority_order_picks_head() {
        let mut h = harness(
            "0, 7000 MiB, 8000 MiB, 10 %\n",
            &[
                job(4000, 10, "big --device={}"),
                job(100, 10, "urgent --device={}").with_priority(-1),
            ],
        ).await;
        h.scheduler.config.queue_order = QueueOrder::Priority;

        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].command, "urgent --device=0");
        assert!(matches!(report.stop, StopReason::NoFit));
    }

    #[tokio::test]
    async fn test_disabled_machine_stays_idle() {
        let mut h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1, 0, "x {}")]).await;
        h.registry.set_enabled("box", false).unwrap();

        let report = h.scheduler.tick().await;
        assert!(matches!(report.stop, StopReason::Disabled));
        assert_eq!(h.machine.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.pending().await.unwrap().len(), 1);

        h.registry.set_enabled("box", true).unwrap();
        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_job() {
        let mut h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        h.machine.fail_dispatch.store(true, Ordering::SeqCst);

        let report = h.scheduler.tick().await;
        assert!(report.dispatched.is_empty());
        assert!(matches!(
            report.stop,
            StopReason::Failed(GpuletError::Dispatch(_))
        ));
        assert_eq!(h.queue.pending().await.unwrap().len(), 1);
        assert!(h.scheduler.ledger().is_empty());
        assert_eq!(h.locks.held_count(), 0);
        // One attempt per tick.
        assert_eq!(h.machine.detached().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_machine_reconnects_next_tick() {
        let mut h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        h.machine.refuse_connect.store(true, Ordering::SeqCst);

        let report = h.scheduler.tick().await;
        assert!(matches!(
            report.stop,
            StopReason::Failed(GpuletError::Transport(_))
        ));
        assert_eq!(h.locks.held_count(), 0);

        h.machine.refuse_connect.store(false, Ordering::SeqCst);
        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(h.machine.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        let machine = h.machine.clone();
        let queue = h.queue.clone();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.scheduler.run(shutdown.clone()));

        for _ in 0..200 {
            if queue.pending().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(queue.pending().await.unwrap().is_empty());
        assert_eq!(machine.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_running_job_releases_its_reservation() {
        let mut h = harness(
            "0, 6000 MiB, 8000 MiB, 10 %\n",
            &[job(1500, 10, "a --device={}")],
        )
        .await;

        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(h.scheduler.ledger().len(), 1);

        // 2000 MiB free minus the 1500 MiB reservation leaves too little.
        h.queue.push(&job(1500, 10, "b --device={}")).await.unwrap();
        let report = h.scheduler.tick().await;
        assert!(matches!(report.stop, StopReason::NoFit));
        assert_eq!(h.scheduler.ledger().len(), 1);

        // Once `a` shows up in the process listing its reservation goes away;
        // the status report did not change, so the full 2000 MiB count again.
        *h.machine.listing.lock().unwrap() =
            "|    0   N/A  N/A   4242   C   python a --device=0   1500MiB |\n".to_string();
        let report = h.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].command, "b --device=0");

        let reservations = h.scheduler.ledger().reservations();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].command, "b --device=0");
    }

    #[tokio::test]
    async fn test_shutdown_during_launch_still_removes_job() {
        let h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        let queue = Arc::new(SlowRemoveQueue {
            inner: h.queue.clone(),
            delay: Duration::from_millis(300),
        });
        let scheduler = MachineScheduler::new(
            "box",
            queue,
            h.services.clone(),
            h.config.clone(),
            SamplerConfig::default(),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        let machine = h.machine.clone();
        wait_for(|| !machine.detached().is_empty()).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        // Launched exactly once and no longer queued.
        assert_eq!(h.machine.detached(), vec!["train --device=0".to_string()]);
        assert!(h.queue.pending().await.unwrap().is_empty());
        assert_eq!(h.locks.held_count(), 0);
        assert!(h.locks.markers("box.jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sampling() {
        let h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        h.machine.hang_status.store(true, Ordering::SeqCst);
        let status_command = SamplerConfig::default().status_command;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.scheduler.run(shutdown.clone()));

        let machine = h.machine.clone();
        wait_for(|| machine.was_sent(&status_command)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(h.machine.detached().is_empty());
        assert_eq!(h.queue.pending().await.unwrap().len(), 1);
        assert_eq!(h.locks.held_count(), 0);
        assert!(h.locks.markers("box.jobs").await.unwrap().is_empty());
        assert_eq!(h.machine.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tick_until_cancelled_token_does_nothing() {
        let mut h = harness("0, 0 MiB, 8000 MiB, 0 %\n", &[job(1000, 10, "train --device={}")]).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = h.scheduler.tick_until(&shutdown).await;
        assert!(matches!(report.stop, StopReason::Shutdown));
        assert!(report.dispatched.is_empty());
        assert_eq!(h.machine.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_job_fails_launch_over_shell() {
        let dir = tempfile::tempdir().unwrap();
        let session = gpulet_core::SessionConfig {
            command_timeout_secs: 5,
            dispatch_log: dir.path().join("jobs.log").display().to_string(),
            ..gpulet_core::SessionConfig::default()
        };
        let sampler = SamplerConfig {
            status_command: format!("printf '%s\\n' '{}' '0, 0 MiB, 8000 MiB, 0 %'", HEADER),
            process_command: "true".to_string(),
            ..SamplerConfig::default()
        };
        let queue = Arc::new(MemoryJobQueue::new("box.jobs"));
        queue.push(&job(1000, 10, "python -c 'print({})")).await.unwrap();
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(MemoryLockStore::new()),
            Duration::from_millis(5),
        ));
        let services = SharedServices {
            connector: Arc::new(gpulet_runtime::DefaultConnector::new(session)),
            registry: Arc::new(MemoryRegistry::new(vec![MachineSpec::local("box")])),
            locks: locks.clone(),
        };
        let config = SchedulerConfig {
            n_passes: 1,
            ..SchedulerConfig::default()
        };
        let mut scheduler = MachineScheduler::new("box", queue.clone(), services, config, sampler);

        let report = scheduler.tick().await;
        assert!(report.dispatched.is_empty());
        assert!(matches!(
            report.stop,
            StopReason::Failed(GpuletError::Dispatch(_))
        ));
        assert_eq!(queue.pending().await.unwrap().len(), 1);
        assert!(scheduler.ledger().is_empty());
        assert_eq!(locks.held_count(), 0);

        // The shell is still usable: a well-formed job launches on the next tick.
        queue.remove(&job(1000, 10, "python -c 'print({})")).await.unwrap();
        queue.push(&job(1000, 10, "true --device={}")).await.unwrap();
        let report = scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);
        assert!(queue.pending().await.unwrap().is_empty());
    }
}
