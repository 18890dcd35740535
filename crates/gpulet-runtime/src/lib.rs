//! gpulet-runtime: Execution sessions
//!
//! This crate provides the channels gpulet uses to talk to machines:
//! - A persistent shell per machine, local or over ssh
//! - One-shot process execution, local or over ssh
//! - Per-machine sessions that serialize command issuance

pub mod machine;
pub mod process;
pub mod shell;
pub mod traits;

pub use machine::{DefaultConnector, MachineSession};
pub use process::OneShotSession;
pub use shell::ShellSession;
pub use traits::{detach_command, CommandOutput, Connector, RunMode, Session};
