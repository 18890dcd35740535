//! Persistent shell transport
//!
//! One `sh` process per machine (over ssh for remote machines) is kept open and
//! fed commands on stdin. Instead of scraping the prompt, every blocking command
//! is followed by a `printf` of a boundary marker and the command's exit status;
//! output is collected until that line shows up. Detached launches go through
//! a child `sh -c` so a command that does not parse cannot swallow the marker.

use async_trait::async_trait;
use gpulet_core::{GpuletError, GpuletResult, MachineSpec, SessionConfig};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::process::{ssh_command, ssh_failure};
use crate::traits::{detach_command, shell_quote, CommandOutput, RunMode, Session};

const READ_CHUNK: usize = 4096;
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Session backed by a long-lived shell
pub struct ShellSession {
    machine_id: String,
    remote: bool,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    marker: String,
    timeout: Duration,
    dispatch_log: String,
    /// Set once the stream can no longer be trusted (timeout, EOF)
    broken: bool,
}

impl ShellSession {
    /// Start a shell on the machine and wait until it answers
    pub async fn open(machine: &MachineSpec, config: &SessionConfig) -> GpuletResult<Self> {
        let marker = match &config.boundary_marker {
            Some(marker) => validate_marker(marker)?,
            None => format!("__gpulet_done_{}", Uuid::new_v4().simple()),
        };

        let remote = !machine.is_local();
        let mut cmd = if remote {
            let mut cmd = ssh_command(machine, config)?;
            cmd.arg("sh");
            cmd
        } else {
            Command::new("sh")
        };
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GpuletError::Transport(format!("{}: failed to start shell: {}", machine.id, e))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(GpuletError::Internal(
                "shell spawned without piped stdio".to_string(),
            ));
        };
        let stderr = child.stderr.take();

        let mut session = Self {
            machine_id: machine.id.clone(),
            remote,
            child,
            stdin,
            stdout,
            stderr,
            marker,
            timeout: config.command_timeout(),
            dispatch_log: config.dispatch_log.clone(),
            broken: false,
        };

        // Discards anything printed on login as well as checking the channel.
        if let Err(e) = session.run("true", RunMode::Blocking).await {
            return Err(session.explain_failure(e).await);
        }

        if let Some(pipe) = session.stderr.take() {
            drain_stderr(session.machine_id.clone(), pipe);
        }

        debug!(machine = %session.machine_id, remote, "Shell session opened");
        Ok(session)
    }

    /// Boundary marker used by this session
    pub fn marker(&self) -> &str {
        &self.marker
    }

    async fn send(&mut self, text: &str) -> GpuletResult<()> {
        let result = async {
            self.stdin.write_all(text.as_bytes()).await?;
            self.stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            self.broken = true;
            GpuletError::Transport(format!("{}: shell input closed: {}", self.machine_id, e))
        })
    }

    async fn read_until_marker(&mut self) -> GpuletResult<CommandOutput> {
        let boundary = format!("\n{} ", self.marker).into_bytes();
        let mut buffer = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = self.stdout.read(&mut chunk).await.map_err(|e| {
                GpuletError::Transport(format!("{}: shell output failed: {}", self.machine_id, e))
            })?;
            if n == 0 {
                self.broken = true;
                return Err(GpuletError::Transport(format!(
                    "{}: shell exited",
                    self.machine_id
                )));
            }
            buffer.extend_from_slice(&chunk[..n]);

            if let Some(output) = split_at_boundary(&buffer, &boundary) {
                return Ok(output);
            }
        }
    }

    async fn run_blocking(&mut self, command: &str) -> GpuletResult<CommandOutput> {
        let script = wrap_blocking(command, &self.marker);
        self.send(&script).await?;
        match tokio::time::timeout(self.timeout, self.read_until_marker()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(machine = %self.machine_id, command, "Command timed out, dropping shell");
                self.broken = true;
                let _ = self.child.start_kill();
                Err(GpuletError::Timeout(self.timeout))
            }
        }
    }

    /// Replace a failure during `open` with what ssh said about it
    async fn explain_failure(&mut self, err: GpuletError) -> GpuletError {
        if !self.remote {
            return err;
        }
        let status = tokio::time::timeout(EXIT_GRACE, self.child.wait()).await;
        let mut stderr = String::new();
        if let Some(mut pipe) = self.stderr.take() {
            let _ = tokio::time::timeout(EXIT_GRACE, pipe.read_to_string(&mut stderr)).await;
        }
        match status {
            Ok(Ok(status)) if !status.success() => ssh_failure(&self.machine_id, &stderr),
            _ => err,
        }
    }
}

/// Log whatever the shell itself writes to stderr so the pipe never fills up
fn drain_stderr(machine_id: String, mut pipe: ChildStderr) {
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    debug!(machine = %machine_id, stderr = %text.trim_end(), "Shell stderr");
                }
            }
        }
    });
}

/// Blocking commands run with stdin detached and stderr folded into stdout,
/// then report their status after the boundary marker.
fn wrap_blocking(command: &str, marker: &str) -> String {
    format!(
        "{{ {}\n}} < /dev/null 2>&1; printf '\\n%s %d\\n' '{}' \"$?\"\n",
        command, marker
    )
}

/// Split accumulated output at the boundary line once it is complete
fn split_at_boundary(buffer: &[u8], boundary: &[u8]) -> Option<CommandOutput> {
    let start = buffer
        .windows(boundary.len())
        .position(|window| window == boundary)?;
    let rest = &buffer[start + boundary.len()..];
    let end = rest.iter().position(|&b| b == b'\n')?;

    let status = std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|s| s.trim().parse().ok());

    Some(CommandOutput {
        text: String::from_utf8_lossy(&buffer[..start]).into_owned(),
        status,
    })
}

fn validate_marker(marker: &str) -> GpuletResult<String> {
    if marker.is_empty() || marker.contains(['\'', '\n', ' ']) {
        return Err(GpuletError::Config(format!(
            "boundary marker must be a single word without quotes: {:?}",
            marker
        )));
    }
    Ok(marker.to_string())
}

#[async_trait]
impl Session for ShellSession {
    async fn run(&mut self, command: &str, mode: RunMode) -> GpuletResult<CommandOutput> {
        if self.broken {
            return Err(GpuletError::Transport(format!(
                "{}: session is closed",
                self.machine_id
            )));
        }

        match mode {
            RunMode::Blocking => self.run_blocking(command).await,
            RunMode::Detached => {
                let launcher = format!(
                    "sh -c {}",
                    shell_quote(&detach_command(command, &self.dispatch_log))
                );
                let output = self.run_blocking(&launcher).await?;
                if output.failed() {
                    return Err(GpuletError::Dispatch(format!(
                        "launch of '{}' exited with {:?}: {}",
                        command,
                        output.status,
                        output.text.trim()
                    )));
                }
                debug!(machine = %self.machine_id, command, "Detached command launched");
                Ok(CommandOutput {
                    text: String::new(),
                    status: output.status,
                })
            }
        }
    }

    async fn close(&mut self) -> GpuletResult<()> {
        if !self.broken {
            let _ = self.stdin.write_all(b"exit\n").await;
            let _ = self.stdin.flush().await;
        }
        self.broken = true;
        if tokio::time::timeout(EXIT_GRACE, self.child.wait()).await.is_err() {
            self.child.kill().await?;
        }
        debug!(machine = %self.machine_id, "Shell session closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "shell"
    }
}
