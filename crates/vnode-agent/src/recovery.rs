use std::sync::Arc;

use serde::Serialize;
use vnode_env::{EnvStatus, EnvironmentRecord};

use crate::config::AgentConfig;
use crate::proxy::ReverseProxy;
use crate::service::EnvService;
use crate::store::RecordStore;
use crate::supervisor::NodeState;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    /// `(env_id, reason)` for every record moved from `running` to `stopped`.
    pub demoted: Vec<(String, String)>,
}

/// Reconciles persisted `running` records with the empty process table of a
/// fresh boot.
pub struct RecoveryCoordinator<'a> {
    service: &'a EnvService,
}

impl<'a> RecoveryCoordinator<'a> {
    pub fn new(service: &'a EnvService) -> Self {
        Self { service }
    }

    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let candidates: Vec<EnvironmentRecord> = self
            .service
            .registry()
            .list()
            .await
            .into_iter()
            .filter(|r| r.status == EnvStatus::Running)
            .collect();

        for record in candidates {
            let env_id = record.env_id.clone();
            match self.restart(&record).await {
                Ok(()) => {
                    tracing::info!(env_id = %env_id, rpc_port = record.rpc_port, "environment recovered");
                    report.recovered.push(env_id);
                }
                Err(reason) => {
                    self.demote(&env_id, &reason).await;
                    report.demoted.push((env_id, reason));
                }
            }
        }
        report
    }

    async fn restart(&self, record: &EnvironmentRecord) -> Result<(), String> {
        if !record.has_ports() {
            return Err("ports were never assigned".to_string());
        }
        let env_id = record.env_id.as_str();
        let supervisor = self.service.supervisor();

        supervisor
            .start(env_id, &record.base_path, record.rpc_port, record.p2p_port)
            .await
            .map_err(|e| e.to_string())?;
        if supervisor.status(env_id).await == NodeState::Stopped {
            return Err("node exited immediately after start".to_string());
        }

        let public_url = if record.public_url.is_empty() {
            self.service.config().public_url(env_id)
        } else {
            record.public_url.clone()
        };
        if let Err(e) = self
            .service
            .proxy()
            .configure(env_id, &public_url, record.rpc_port)
            .await
        {
            tracing::warn!(env_id, error = %e, "route re-configuration failed during recovery");
        }
        if record.public_url.is_empty() {
            let url = public_url;
            if let Err(e) = self.service.registry().modify(env_id, move |r| r.public_url = url).await {
                tracing::warn!(env_id, error = %e, "failed to record public url");
            }
        }
        Ok(())
    }

    async fn demote(&self, env_id: &str, reason: &str) {
        tracing::warn!(env_id, reason, "cannot recover environment; marking stopped");
        self.service.supervisor().stop(env_id).await;
        if let Err(e) = self
            .service
            .registry()
            .set_status(env_id, EnvStatus::Stopped)
            .await
        {
            tracing::error!(env_id, error = %e, "failed to demote environment");
        }
    }
}

/// Builds the service from persisted state and recovers running nodes.
pub async fn bootstrap(cfg: Arc<AgentConfig>, proxy: ReverseProxy) -> (EnvService, RecoveryReport) {
    let store = Arc::new(RecordStore::new(cfg.state_file.clone()));
    let records = store.load().await;
    tracing::info!(count = records.len(), path = %store.path().display(), "loaded environment records");

    let service = EnvService::assemble(cfg, store, records, proxy);

    let report = RecoveryCoordinator::new(&service).run().await;
    (service, report)
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::Utc;
    use vnode_env::GIB;

    use super::*;
    use crate::supervisor::tests::{LONG_RUNNING, fixture};

    fn running_record(cfg: &AgentConfig, id: &str, rpc: u16, p2p: u16) -> EnvironmentRecord {
        EnvironmentRecord {
            env_id: id.to_string(),
            allocated_rom: GIB,
            allocated_ram: GIB,
            used_rom: 0,
            used_ram: 0,
            base_path: cfg.env_base_path(id),
            rpc_port: rpc,
            p2p_port: p2p,
            public_url: String::new(),
            status: EnvStatus::Running,
            created_at: Utc::now(),
        }
    }

    async fn seed(cfg: &AgentConfig, records: &[EnvironmentRecord]) {
        RecordStore::new(cfg.state_file.clone()).save(records).await.unwrap();
    }

    #[tokio::test]
    async fn running_record_is_respawned_and_ports_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fixture(dir.path(), LONG_RUNNING);
        let rec = running_record(&cfg, "alpha-testnet", 8600, 30400);
        crate::workspace::clone_template(&rec.base_path, &cfg.template_dir)
            .await
            .unwrap();
        seed(&cfg, &[rec]).await;

        let (svc, report) = bootstrap(cfg.clone(), ReverseProxy::disabled()).await;
        assert_eq!(report.recovered, vec!["alpha-testnet".to_string()]);
        assert!(report.demoted.is_empty());
        assert!(svc.supervisor().is_tracked("alpha-testnet").await);

        let after = svc.registry().get_stats("alpha-testnet").await.unwrap();
        assert_eq!(after.status, EnvStatus::Running);
        assert_eq!(after.public_url, cfg.public_url("alpha-testnet"));

        let fresh = svc.allocate(1, 1, "beta").await.unwrap();
        assert_eq!(fresh.rpc_port, 8601);
        assert_eq!(fresh.p2p_port, 30401);

        svc.stop("alpha-testnet").await.unwrap();
    }

    #[tokio::test]
    async fn unrecoverable_records_are_demoted_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fixture(dir.path(), LONG_RUNNING);
        // No workspace on disk, and one record that never got ports.
        let missing = running_record(&cfg, "gone-testnet", 8545, 30333);
        let portless = running_record(&cfg, "noports-testnet", 0, 0);
        let mut idle = running_record(&cfg, "idle-testnet", 8546, 30334);
        idle.status = EnvStatus::Deployed;
        seed(&cfg, &[missing, portless, idle]).await;

        let (svc, report) = bootstrap(cfg.clone(), ReverseProxy::disabled()).await;
        assert!(report.recovered.is_empty());
        let mut demoted: Vec<&str> = report.demoted.iter().map(|(id, _)| id.as_str()).collect();
        demoted.sort();
        assert_eq!(demoted, vec!["gone-testnet", "noports-testnet"]);

        for rec in svc.registry().list().await {
            assert_ne!(rec.status, EnvStatus::Running, "{} still running", rec.env_id);
        }
        assert_eq!(svc.health().await.running, 0);

        let reloaded = RecordStore::new(cfg.state_file.clone()).load().await;
        let idle = reloaded.iter().find(|r| r.env_id == "idle-testnet").unwrap();
        assert_eq!(idle.status, EnvStatus::Deployed);
        assert!(reloaded
            .iter()
            .filter(|r| r.env_id != "idle-testnet")
            .all(|r| r.status == EnvStatus::Stopped));
    }

    #[tokio::test]
    async fn over_quota_running_record_is_still_demoted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fixture(dir.path(), LONG_RUNNING);
        let mut legacy = running_record(&cfg, "heavy-testnet", 8545, 30333);
        legacy.used_rom = legacy.allocated_rom + 64 * 1024 * 1024;
        legacy.used_ram = legacy.allocated_ram + 1;
        seed(&cfg, &[legacy]).await;

        let (svc, report) = bootstrap(cfg.clone(), ReverseProxy::disabled()).await;
        assert_eq!(report.demoted.len(), 1);
        assert_eq!(report.demoted[0].0, "heavy-testnet");
        assert_eq!(
            svc.registry().get_stats("heavy-testnet").await.unwrap().status,
            EnvStatus::Stopped
        );

        let reloaded = RecordStore::new(cfg.state_file.clone()).load().await;
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].status, EnvStatus::Stopped);
        assert!(reloaded[0].used_rom <= reloaded[0].allocated_rom);
    }

    #[tokio::test]
    async fn node_that_dies_at_once_is_demoted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fixture(dir.path(), "exit 1");
        let rec = running_record(&cfg, "flaky-testnet", 8545, 30333);
        crate::workspace::clone_template(&rec.base_path, &cfg.template_dir)
            .await
            .unwrap();
        seed(&cfg, &[rec]).await;

        let (svc, report) = bootstrap(cfg, ReverseProxy::disabled()).await;
        // The exit may race the liveness check; either way the record must not claim
        // running without a live process.
        let mut status = EnvStatus::Running;
        for _ in 0..100 {
            status = svc.status("flaky-testnet").await.unwrap().status;
            if status == EnvStatus::Stopped {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, EnvStatus::Stopped);
        assert_eq!(report.recovered.len() + report.demoted.len(), 1);
    }
}
