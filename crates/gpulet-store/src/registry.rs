//! Machine registry

use async_trait::async_trait;
use gpulet_core::{GpuletError, GpuletResult, MachineSpec};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

/// Read-only view of the registered machines
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Snapshot of every registered machine
    async fn list(&self) -> GpuletResult<Vec<MachineSpec>>;

    /// Snapshot of one machine
    async fn get(&self, id: &str) -> GpuletResult<Option<MachineSpec>> {
        Ok(self.list().await?.into_iter().find(|m| m.id == id))
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    machines: Vec<MachineSpec>,
}

/// Registry kept in a TOML file of `[[machines]]` tables, re-read on every call
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse registry contents
    pub fn parse(content: &str) -> GpuletResult<Vec<MachineSpec>> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| GpuletError::Registry(format!("Failed to parse registry: {}", e)))?;

        let mut seen = HashSet::new();
        for machine in &file.machines {
            if !seen.insert(machine.id.as_str()) {
                return Err(GpuletError::Registry(format!(
                    "duplicate machine id: {}",
                    machine.id
                )));
            }
        }
        Ok(file.machines)
    }
}

#[async_trait]
impl MachineRegistry for FileRegistry {
    async fn list(&self) -> GpuletResult<Vec<MachineSpec>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GpuletError::Registry(format!(
                "Failed to read registry {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// In-process registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    machines: RwLock<Vec<MachineSpec>>,
}

impl MemoryRegistry {
    pub fn new(machines: Vec<MachineSpec>) -> Self {
        Self {
            machines: RwLock::new(machines),
        }
    }

    /// Enable or disable scheduling on a machine
    pub fn set_enabled(&self, id: &str, enabled: bool) -> GpuletResult<()> {
        let mut machines = self
            .machines
            .write()
            .map_err(|_| GpuletError::Internal("registry lock poisoned".to_string()))?;
        let machine = machines
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| GpuletError::Registry(format!("unknown machine: {}", id)))?;
        machine.enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl MachineRegistry for MemoryRegistry {
    async fn list(&self) -> GpuletResult<Vec<MachineSpec>> {
        self.machines
            .read()
            .map(|m| m.clone())
            .map_err(|_| GpuletError::Internal("registry lock poisoned".to_string()))
    }
}
