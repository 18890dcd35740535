//! Per-machine execution session

use async_trait::async_trait;
use gpulet_core::{GpuletResult, MachineSpec, SessionConfig, TransportKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::OneShotSession;
use crate::shell::ShellSession;
use crate::traits::{CommandOutput, Connector, RunMode, Session};

/// A machine together with the channel used to reach it.
///
/// Commands issued through the same `MachineSession` are serialized: a caller
/// waits for the previous command to finish before its own is sent.
pub struct MachineSession {
    spec: MachineSpec,
    session: Mutex<Box<dyn Session>>,
}

impl MachineSession {
    /// Wrap an already open session
    pub fn new(spec: MachineSpec, session: Box<dyn Session>) -> Self {
        Self {
            spec,
            session: Mutex::new(session),
        }
    }

    /// Open a session to the machine through `connector`
    pub async fn open(spec: MachineSpec, connector: &dyn Connector) -> GpuletResult<Self> {
        let session = connector.connect(&spec).await?;
        info!(
            machine = %spec.id,
            transport = session.name(),
            "Machine session opened"
        );
        Ok(Self::new(spec, session))
    }

    /// Machine identifier
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Registry entry this session was opened for
    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    /// Devices excluded from scheduling
    pub fn skip_gpus(&self) -> &[u32] {
        &self.spec.skip_gpus
    }

    /// Refresh the registry entry (skip list, enabled flag)
    pub fn update_spec(&mut self, spec: MachineSpec) {
        if spec.skip_gpus != self.spec.skip_gpus {
            debug!(machine = %spec.id, skip_gpus = ?spec.skip_gpus, "Skip list changed");
        }
        self.spec = spec;
    }

    /// Run a command on the machine
    pub async fn run(&self, command: &str, mode: RunMode) -> GpuletResult<CommandOutput> {
        let mut session = self.session.lock().await;
        debug!(machine = %self.spec.id, command, ?mode, "Running command");
        session.run(command, mode).await
    }

    /// Close the underlying channel
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Err(e) = session.close().await {
            warn!(machine = %self.spec.id, error = %e, "Failed to close session cleanly");
        }
    }
}

/// Connector that picks the transport from configuration
pub struct DefaultConnector {
    config: SessionConfig,
}

impl DefaultConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, machine: &MachineSpec) -> GpuletResult<Box<dyn Session>> {
        match self.config.transport {
            TransportKind::Shell => Ok(Box::new(ShellSession::open(machine, &self.config).await?)),
            TransportKind::Oneshot => Ok(Box::new(
                OneShotSession::open(machine.clone(), self.config.clone()).await?,
            )),
        }
    }
}
