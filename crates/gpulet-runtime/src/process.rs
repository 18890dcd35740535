//! One-shot process transport
//!
//! Every command is a fresh process: `sh -c` on this host, or a single ssh
//! invocation for a remote machine. No state is carried between commands, so
//! there is no output boundary to detect.

use async_trait::async_trait;
use gpulet_core::{GpuletError, GpuletResult, MachineSpec, SessionConfig};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

use crate::traits::{detach_command, CommandOutput, RunMode, Session};

/// Exit status ssh uses for its own failures
const SSH_FAILURE_STATUS: i32 = 255;

/// Build an ssh invocation for `machine` without the remote command
pub(crate) fn ssh_command(machine: &MachineSpec, config: &SessionConfig) -> GpuletResult<Command> {
    let target = machine.ssh_target().ok_or_else(|| {
        GpuletError::Config(format!("machine {} has no address", machine.id))
    })?;

    let mut cmd = Command::new(&config.ssh_program);
    cmd.arg("-T").arg("-o").arg("BatchMode=yes");
    if let Some(identity) = &machine.identity_file {
        cmd.arg("-i").arg(identity);
    }
    for opt in &config.ssh_options {
        cmd.arg(opt);
    }
    cmd.arg(target);
    Ok(cmd)
}

/// Classify an ssh failure from what it printed on stderr
pub(crate) fn ssh_failure(machine: &str, stderr: &str) -> GpuletError {
    let stderr = stderr.trim();
    let auth_markers = [
        "Permission denied",
        "Host key verification failed",
        "Too many authentication failures",
    ];
    if auth_markers.iter().any(|m| stderr.contains(m)) {
        GpuletError::Auth(format!("{}: {}", machine, stderr))
    } else {
        GpuletError::Transport(format!("{}: {}", machine, stderr))
    }
}

/// Session that spawns one process per command
pub struct OneShotSession {
    machine: MachineSpec,
    config: SessionConfig,
}

impl OneShotSession {
    /// Create a session without touching the machine
    pub fn new(machine: MachineSpec, config: SessionConfig) -> Self {
        Self { machine, config }
    }

    /// Create a session and check that the machine accepts commands
    pub async fn open(machine: MachineSpec, config: SessionConfig) -> GpuletResult<Self> {
        let mut session = Self::new(machine, config);
        session.run("true", RunMode::Blocking).await?;
        Ok(session)
    }

    /// Build the command that runs `script` on the machine
    fn build_command(&self, script: &str) -> GpuletResult<Command> {
        let mut cmd = if self.machine.is_local() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        } else {
            let mut cmd = ssh_command(&self.machine, &self.config)?;
            cmd.arg("--");
            cmd
        };
        cmd.arg(script);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }

    async fn execute(&self, script: &str) -> GpuletResult<CommandOutput> {
        let mut cmd = self.build_command(script)?;
        let timeout = self.config.command_timeout();

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(machine = %self.machine.id, error = %e, "Failed to spawn command");
                return Err(GpuletError::Transport(format!(
                    "{}: failed to spawn command: {}",
                    self.machine.id, e
                )));
            }
            Err(_) => return Err(GpuletError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output.status.code();

        if !self.machine.is_local() && status == Some(SSH_FAILURE_STATUS) {
            return Err(ssh_failure(&self.machine.id, &stderr));
        }

        Ok(CommandOutput {
            text: format!("{}{}", stdout, stderr),
            status,
        })
    }
}

#[async_trait]
impl Session for OneShotSession {
    async fn run(&mut self, command: &str, mode: RunMode) -> GpuletResult<CommandOutput> {
        match mode {
            RunMode::Blocking => self.execute(command).await,
            RunMode::Detached => {
                let wrapped = detach_command(command, &self.config.dispatch_log);
                let output = self.execute(&wrapped).await?;
                if output.failed() {
                    return Err(GpuletError::Dispatch(format!(
                        "launch of '{}' exited with {:?}: {}",
                        command,
                        output.status,
                        output.text.trim()
                    )));
                }
                debug!(machine = %self.machine.id, command, "Detached command launched");
                Ok(CommandOutput {
                    text: String::new(),
                    status: output.status,
                })
            }
        }
    }

    async fn close(&mut self) -> GpuletResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "oneshot"
    }
}
