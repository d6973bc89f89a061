use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn gib_to_bytes(gb: u64) -> Option<u64> {
    gb.checked_mul(GIB)
}

/// Lifecycle state of an environment as recorded by the registry.
///
/// NOTE: `Running` is a claim, not proof. After an agent restart it only
/// means "should be running" until recovery has re-spawned the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    #[default]
    Allocated,
    Deployed,
    Running,
    Stopped,
    Failed,
}

impl EnvStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvStatus::Allocated => "allocated",
            EnvStatus::Deployed => "deployed",
            EnvStatus::Running => "running",
            EnvStatus::Stopped => "stopped",
            EnvStatus::Failed => "failed",
        }
    }

    /// Whether the registry may move a record from `self` to `next`.
    pub fn can_transition_to(self, next: EnvStatus) -> bool {
        use EnvStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Allocated, Deployed)
                | (Stopped | Failed, Deployed)
                | (Deployed | Stopped, Running)
                | (Running, Stopped)
                | (Failed, Stopped)
        )
    }
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted state of one environment.
///
/// The live process handle is deliberately absent: it is owned by the
/// supervisor and has no meaning across agent restarts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentRecord {
    #[serde(alias = "id")]
    pub env_id: String,
    pub allocated_rom: u64,
    pub allocated_ram: u64,
    #[serde(default)]
    pub used_rom: u64,
    #[serde(default)]
    pub used_ram: u64,
    pub base_path: PathBuf,
    // 0 means "not assigned yet".
    #[serde(default)]
    pub rpc_port: u16,
    #[serde(default)]
    pub p2p_port: u16,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub status: EnvStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    /// Directory holding the materialized node tree.
    pub fn workspace_dir(&self) -> PathBuf {
        self.base_path.join("blockchain")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_path.join("data")
    }

    pub fn has_ports(&self) -> bool {
        self.rpc_port != 0 && self.p2p_port != 0
    }

    pub fn resources(&self) -> ResourceSummary {
        ResourceSummary {
            rom: ResourceUsage::from_bytes(self.allocated_rom, self.used_rom),
            ram: ResourceUsage::from_bytes(self.allocated_ram, self.used_ram),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResourceUsage {
    pub allocated_gb: u64,
    pub used_gb: u64,
    pub free_gb: u64,
}

impl ResourceUsage {
    fn from_bytes(allocated: u64, used: u64) -> Self {
        Self {
            allocated_gb: allocated / GIB,
            used_gb: used / GIB,
            free_gb: allocated.saturating_sub(used) / GIB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResourceSummary {
    pub rom: ResourceUsage,
    pub ram: ResourceUsage,
}
