use std::{
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use vnode_env::EnvironmentRecord;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

// Older state files can carry usage past the quota; usage never exceeds the
// allocation once loaded.
fn clamp_usage(rec: &mut EnvironmentRecord) {
    if rec.used_rom > rec.allocated_rom || rec.used_ram > rec.allocated_ram {
        tracing::warn!(
            env_id = %rec.env_id,
            used_rom = rec.used_rom,
            allocated_rom = rec.allocated_rom,
            used_ram = rec.used_ram,
            allocated_ram = rec.allocated_ram,
            "recorded usage exceeds quota; clamping"
        );
        rec.used_rom = rec.used_rom.min(rec.allocated_rom);
        rec.used_ram = rec.used_ram.min(rec.allocated_ram);
    }
}

/// Durable JSON snapshot of the environment registry.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    // Generation of the newest snapshot on disk.
    written: Mutex<u64>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record from disk.
    ///
    /// Never fails: a missing store is empty, a record that does not parse is
    /// skipped, and an unreadable file is moved aside as `<file>.corrupt`.
    pub async fn load(&self) -> Vec<EnvironmentRecord> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no state file yet; starting empty");
                return Vec::new();
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "failed to read state file; starting empty");
                return Vec::new();
            }
        };

        let values: Vec<serde_json::Value> = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "state file is malformed; starting empty");
                self.quarantine().await;
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(values.len());
        for (idx, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<EnvironmentRecord>(value) {
                Ok(mut rec) if seen.insert(rec.env_id.clone()) => {
                    clamp_usage(&mut rec);
                    out.push(rec);
                }
                Ok(rec) => {
                    tracing::warn!(env_id = %rec.env_id, "duplicate environment id in state file; keeping the first");
                }
                Err(e) => {
                    tracing::warn!(index = idx, error = %e, "skipping unparseable environment record");
                }
            }
        }
        out
    }

    async fn quarantine(&self) {
        let dest = sibling(&self.path, ".corrupt");
        if let Err(e) = tokio::fs::rename(&self.path, &dest).await {
            tracing::warn!(error = %e, "failed to move malformed state file aside");
        } else {
            tracing::warn!(path = %dest.display(), "malformed state file preserved");
        }
    }

    /// Atomically replaces the store with `records`.
    pub async fn save(&self, records: &[EnvironmentRecord]) -> anyhow::Result<()> {
        let _guard = self.written.lock().await;
        self.write_atomic(records).await
    }

    /// Writes the snapshot taken at `generation` unless a newer one already
    /// reached the disk. Returns whether a write happened.
    pub(crate) async fn save_generation(
        &self,
        generation: u64,
        records: &[EnvironmentRecord],
    ) -> anyhow::Result<bool> {
        let mut written = self.written.lock().await;
        if generation <= *written {
            return Ok(false);
        }
        self.write_atomic(records).await?;
        *written = generation;
        Ok(true)
    }

    async fn write_atomic(&self, records: &[EnvironmentRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(records).context("serialize environment records")?;
        let tmp = sibling(&self.path, ".tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        f.flush()
            .await
            .with_context(|| format!("flush {}", tmp.display()))?;
        f.sync_all()
            .await
            .with_context(|| format!("sync {}", tmp.display()))?;
        drop(f);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};
    use vnode_env::{EnvStatus, GIB};

    use super::*;

    fn rec(id: &str, rpc: u16, p2p: u16, status: EnvStatus) -> EnvironmentRecord {
        EnvironmentRecord {
            env_id: id.to_string(),
            allocated_rom: 10 * GIB,
            allocated_ram: 4 * GIB,
            used_rom: 42,
            used_ram: 7,
            base_path: PathBuf::from(format!("/virtual-envs/{id}")),
            rpc_port: rpc,
            p2p_port: p2p,
            public_url: format!("https://{id}-rpc.example.org"),
            status,
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn load_returns_what_save_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("state").join("environments.json"));

        let records = vec![
            rec("alpha-testnet", 8545, 30333, EnvStatus::Running),
            rec("beta-testnet", 8546, 30334, EnvStatus::Deployed),
        ];
        store.save(&records).await.unwrap();

        assert_eq!(store.load().await, records);
        assert!(!sibling(store.path(), ".tmp").exists());
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("environments.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_store_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environments.json");
        std::fs::write(&path, b"[{\"env_id\": ").unwrap();

        let store = RecordStore::new(&path);
        assert!(store.load().await.is_empty());
        assert!(!path.exists());
        assert!(sibling(&path, ".corrupt").exists());
    }

    #[tokio::test]
    async fn bad_records_are_skipped_individually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environments.json");
        let good = serde_json::to_value(rec("ok-testnet", 8545, 30333, EnvStatus::Stopped)).unwrap();
        let raw = serde_json::json!([good, {"env_id": 17}, good]);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let loaded = RecordStore::new(&path).load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].env_id, "ok-testnet");
    }

    #[tokio::test]
    async fn over_quota_usage_is_clamped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("environments.json"));
        let mut legacy = rec("legacy-testnet", 8545, 30333, EnvStatus::Running);
        legacy.used_rom = legacy.allocated_rom + 10 * 1024 * 1024;
        legacy.used_ram = legacy.allocated_ram + 1;
        store.save(&[legacy.clone()]).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded[0].used_rom, legacy.allocated_rom);
        assert_eq!(loaded[0].used_ram, legacy.allocated_ram);
    }

    #[tokio::test]
    async fn stale_generation_does_not_overwrite_newer_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("environments.json"));

        let newer = vec![rec("a-testnet", 8545, 30333, EnvStatus::Running)];
        let older: Vec<EnvironmentRecord> = Vec::new();

        assert!(store.save_generation(2, &newer).await.unwrap());
        assert!(!store.save_generation(1, &older).await.unwrap());
        assert_eq!(store.load().await, newer);
    }
}
