//! Session trait definitions

use async_trait::async_trait;
use gpulet_core::{GpuletResult, MachineSpec};

/// How a command is run on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for the command to finish and collect its output
    Blocking,
    /// Start the command in the background and return at once
    Detached,
}

/// What a command left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured output (stdout and stderr interleaved); empty for detached runs
    pub text: String,
    /// Exit status, when the transport could observe one
    pub status: Option<i32>,
}

impl CommandOutput {
    /// Whether the command is known to have failed
    pub fn failed(&self) -> bool {
        matches!(self.status, Some(code) if code != 0)
    }
}

/// A stateful channel to one machine
#[async_trait]
pub trait Session: Send {
    /// Run a command. Only one command is in flight at a time.
    async fn run(&mut self, command: &str, mode: RunMode) -> GpuletResult<CommandOutput>;

    /// Tear the channel down
    async fn close(&mut self) -> GpuletResult<()>;

    /// Get the transport name
    fn name(&self) -> &'static str;
}

/// Opens sessions to machines
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to the given machine
    async fn connect(&self, machine: &MachineSpec) -> GpuletResult<Box<dyn Session>>;
}

/// Wrap a command so it runs in a background subshell, detached from the
/// session's stdio, appending its output to `log`.
pub fn detach_command(command: &str, log: &str) -> String {
    format!("({{ {}; }} < /dev/null >> {} 2>&1 &)", command, log)
}

/// Quote `text` as one single-quoted shell word
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}
