//! Machine registry entries

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A machine jobs can be scheduled on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Unique machine identifier
    pub id: String,
    /// Host address; `None` or `localhost` means this machine
    #[serde(default)]
    pub address: Option<String>,
    /// Remote user name
    #[serde(default)]
    pub user: Option<String>,
    /// Private key used to authenticate
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Device indices never scheduled on
    #[serde(default)]
    pub skip_gpus: Vec<u32>,
    /// Whether the scheduler should place jobs on this machine
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Job queue file for this machine
    #[serde(default)]
    pub job_file: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl MachineSpec {
    /// Create a spec for the local machine
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
            user: None,
            identity_file: None,
            skip_gpus: Vec::new(),
            enabled: true,
            job_file: None,
        }
    }

    /// Create a spec for a remote machine
    pub fn remote(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::local(id)
        }
    }

    /// Whether commands run on this host rather than over ssh
    pub fn is_local(&self) -> bool {
        match self.address.as_deref() {
            None => true,
            Some(addr) => addr.is_empty() || addr == "localhost",
        }
    }

    /// `user@address` (or just the address) for ssh
    pub fn ssh_target(&self) -> Option<String> {
        let address = self.address.as_deref()?;
        Some(match &self.user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        })
    }

    /// Queue file for this machine, defaulting to `<queue_dir>/<id>.jobs`
    pub fn job_file_in(&self, queue_dir: &Path) -> PathBuf {
        self.job_file
            .clone()
            .unwrap_or_else(|| queue_dir.join(format!("{}.jobs", self.id)))
    }
}
