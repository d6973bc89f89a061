use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use vnode_env::{EnvStatus, EnvironmentRecord};

use crate::config::AgentConfig;
use crate::error::{EnvError, EnvResult};
use crate::port_alloc::PortAllocator;
use crate::proxy::ReverseProxy;
use crate::registry::{EnvironmentRegistry, QuotaLimits};
use crate::store::RecordStore;
use crate::supervisor::{NodeState, ProcessSupervisor, StartOutcome};
use crate::workspace::{self, CloneOutcome};

#[derive(Debug, Clone)]
pub struct DeployResult {
    pub record: EnvironmentRecord,
    pub workspace: PathBuf,
    pub cloned: bool,
}

#[derive(Debug, Clone)]
pub struct StartResult {
    pub record: EnvironmentRecord,
    pub rpc_endpoint: String,
    pub public_url: String,
    /// Route configuration is best effort and never fails a start.
    pub proxy_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthSummary {
    pub environments: usize,
    pub running: usize,
}

/// Lifecycle operations that span the registry, port allocator and
/// supervisor.
///
/// Deploy, start, stop, deallocate and the liveness sync of one environment
/// are serialized by a per-environment guard.
#[derive(Debug, Clone)]
pub struct EnvService {
    cfg: Arc<AgentConfig>,
    registry: Arc<EnvironmentRegistry>,
    ports: Arc<PortAllocator>,
    supervisor: ProcessSupervisor,
    proxy: ReverseProxy,
    env_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl EnvService {
    pub fn new(
        cfg: Arc<AgentConfig>,
        registry: Arc<EnvironmentRegistry>,
        ports: Arc<PortAllocator>,
        supervisor: ProcessSupervisor,
        proxy: ReverseProxy,
    ) -> Self {
        Self {
            cfg,
            registry,
            ports,
            supervisor,
            proxy,
            env_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wires a service around `records`, seeding the port counters from them.
    pub fn assemble(
        cfg: Arc<AgentConfig>,
        store: Arc<RecordStore>,
        records: Vec<EnvironmentRecord>,
        proxy: ReverseProxy,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(cfg.rpc_port_base, cfg.p2p_port_base));
        ports.seed_from_existing(&records);
        let registry = Arc::new(EnvironmentRegistry::new(
            store,
            cfg.data_root.clone(),
            QuotaLimits {
                max_rom_gb: cfg.max_rom_gb,
                max_ram_gb: cfg.max_ram_gb,
            },
            records,
        ));
        let supervisor = ProcessSupervisor::new(cfg.clone());
        Self::new(cfg, registry, ports, supervisor, proxy)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    async fn lock_env(&self, env_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .env_locks
            .lock()
            .await
            .entry(env_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn require(&self, env_id: &str) -> EnvResult<EnvironmentRecord> {
        self.registry
            .get_stats(env_id)
            .await
            .ok_or_else(|| EnvError::NotFound(env_id.to_string()))
    }

    fn ensure_transition(record: &EnvironmentRecord, to: EnvStatus) -> EnvResult<()> {
        if record.status.can_transition_to(to) {
            return Ok(());
        }
        Err(EnvError::InvalidTransition {
            env_id: record.env_id.clone(),
            from: record.status,
            to,
        })
    }

    async fn assign_ports(&self, env_id: &str) -> EnvResult<EnvironmentRecord> {
        let rpc = self.ports.assign_rpc_port(env_id)?;
        let p2p = self.ports.assign_p2p_port(env_id)?;
        self.registry
            .modify(env_id, |r| {
                r.rpc_port = rpc;
                r.p2p_port = p2p;
            })
            .await
    }

    pub async fn allocate(&self, rom_gb: u64, ram_gb: u64, name: &str) -> EnvResult<EnvironmentRecord> {
        let record = self.registry.allocate(rom_gb, ram_gb, name).await?;
        match self.assign_ports(&record.env_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.registry.deallocate(&record.env_id).await;
                Err(e)
            }
        }
    }

    /// Materializes the workspace, charges its size to the ROM quota and
    /// validates the node binary.
    pub async fn deploy(&self, env_id: &str, repo: Option<&str>) -> EnvResult<DeployResult> {
        let _guard = self.lock_env(env_id).await;
        let record = self.require(env_id).await?;
        Self::ensure_transition(&record, EnvStatus::Deployed)?;
        tracing::info!(env_id, repo = repo.unwrap_or(""), "deploy requested");

        let ws = record.workspace_dir();
        let template = &self.cfg.template_dir;
        let mut charge = 0u64;
        if !tokio::fs::try_exists(&ws).await.unwrap_or(false)
            && tokio::fs::try_exists(template).await.unwrap_or(false)
        {
            charge = workspace::dir_size(template).await?;
            if !self.registry.validate_quota(env_id, charge).await {
                return Err(EnvError::QuotaExceeded {
                    env_id: env_id.to_string(),
                    requested: charge,
                    available: record.allocated_rom.saturating_sub(record.used_rom),
                });
            }
        }

        let outcome = self
            .supervisor
            .clone(env_id, &record.base_path, template)
            .await?;
        if outcome == CloneOutcome::Created && charge > 0 {
            self.registry.record_usage(env_id, charge, 0).await?;
        }
        self.supervisor
            .validate_binary(env_id, &record.base_path)
            .await?;

        let record = self.registry.set_status(env_id, EnvStatus::Deployed).await?;
        Ok(DeployResult {
            record,
            workspace: ws,
            cloned: outcome == CloneOutcome::Created,
        })
    }

    pub async fn start(&self, env_id: &str) -> EnvResult<StartResult> {
        let _guard = self.lock_env(env_id).await;
        let mut record = self.require(env_id).await?;
        Self::ensure_transition(&record, EnvStatus::Running)?;
        if !record.has_ports() {
            record = self.assign_ports(env_id).await?;
        }

        let outcome = self
            .supervisor
            .start(env_id, &record.base_path, record.rpc_port, record.p2p_port)
            .await?;
        if let StartOutcome::AlreadyRunning { pid } = outcome {
            tracing::info!(env_id, ?pid, "node already running; reusing it");
        }

        let public_url = self.cfg.public_url(env_id);
        let proxy_error = match self
            .proxy
            .configure(env_id, &public_url, record.rpc_port)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(env_id, error = %e, "route configuration failed; node keeps running");
                Some(e.to_string())
            }
        };

        let url = public_url.clone();
        let record = match self
            .registry
            .modify(env_id, move |r| {
                r.status = EnvStatus::Running;
                r.public_url = url;
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // The record vanished or moved on; do not leave an orphan node.
                self.supervisor.stop(env_id).await;
                return Err(e);
            }
        };

        Ok(StartResult {
            rpc_endpoint: format!("http://localhost:{}", record.rpc_port),
            record,
            public_url,
            proxy_error,
        })
    }

    /// Stops the node. Returns the updated record and whether a process was
    /// actually tracked.
    pub async fn stop(&self, env_id: &str) -> EnvResult<(EnvironmentRecord, bool)> {
        let _guard = self.lock_env(env_id).await;
        let record = self.require(env_id).await?;
        let was_tracked = self.supervisor.stop(env_id).await;
        let record = if record.status == EnvStatus::Running {
            self.registry.set_status(env_id, EnvStatus::Stopped).await?
        } else {
            record
        };
        Ok((record, was_tracked))
    }

    /// Removes the environment. A tracked node is stopped first; the
    /// workspace on disk is left in place.
    pub async fn deallocate(&self, env_id: &str) -> bool {
        let guard = self.lock_env(env_id).await;
        self.supervisor.stop(env_id).await;
        let existed = self.registry.deallocate(env_id).await;
        self.env_locks.lock().await.remove(env_id);
        drop(guard);
        existed
    }

    /// Demotes a `running` record whose node is no longer alive.
    async fn sync(&self, record: EnvironmentRecord) -> EnvironmentRecord {
        if record.status != EnvStatus::Running
            || self.supervisor.status(&record.env_id).await == NodeState::Running
        {
            return record;
        }

        let env_id = record.env_id.as_str();
        let _guard = self.lock_env(env_id).await;
        // A start may have respawned the node before the guard was taken.
        let Some(mut current) = self.registry.get_stats(env_id).await else {
            return record;
        };
        if current.status != EnvStatus::Running
            || self.supervisor.status(env_id).await == NodeState::Running
        {
            return current;
        }
        match self.registry.set_status(env_id, EnvStatus::Stopped).await {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(env_id, error = %e, "failed to record stopped node");
                current.status = EnvStatus::Stopped;
                current
            }
        }
    }

    pub async fn list(&self) -> Vec<EnvironmentRecord> {
        let mut out = Vec::new();
        for record in self.registry.list().await {
            out.push(self.sync(record).await);
        }
        out
    }

    pub async fn status(&self, env_id: &str) -> EnvResult<EnvironmentRecord> {
        let record = self.require(env_id).await?;
        Ok(self.sync(record).await)
    }

    pub async fn logs(&self, env_id: &str, lines: usize) -> EnvResult<String> {
        self.require(env_id).await?;
        self.supervisor.logs(env_id, lines).await
    }

    pub async fn health(&self) -> HealthSummary {
        HealthSummary {
            environments: self.registry.list().await.len(),
            running: self.supervisor.tracked_count().await,
        }
    }
}
