use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use vnode_env::{EnvStatus, EnvironmentRecord, gib_to_bytes};

use crate::error::{EnvError, EnvResult};
use crate::store::RecordStore;

const MAX_NAME_LEN: usize = 48;
const ID_SUFFIX: &str = "-testnet";

#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub max_rom_gb: u64,
    pub max_ram_gb: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, EnvironmentRecord>,
    // Bumped on every mutation; orders snapshots handed to the store.
    generation: u64,
}

impl Inner {
    fn snapshot(&mut self) -> (u64, Vec<EnvironmentRecord>) {
        self.generation = self.generation.saturating_add(1);
        (self.generation, self.records.values().cloned().collect())
    }
}

/// Authoritative map of environment records.
///
/// Every operation holds the map lock only for in-memory work; the resulting
/// snapshot is written to the store after the lock is released.
#[derive(Debug)]
pub struct EnvironmentRegistry {
    inner: Mutex<Inner>,
    store: Arc<RecordStore>,
    data_root: PathBuf,
    limits: QuotaLimits,
}

fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(MAX_NAME_LEN).collect();
    let trimmed = trimmed.trim_end_matches('-');
    if trimmed.is_empty() {
        "env".to_string()
    } else {
        trimmed.to_string()
    }
}

fn generate_id(base: &str, taken: &HashMap<String, EnvironmentRecord>) -> String {
    if !taken.contains_key(base) {
        return base.to_string();
    }
    let mut rng = rand::thread_rng();
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        // Three digits first; widen once the short space looks crowded.
        let n: u32 = if attempt <= 64 {
            rng.gen_range(100..=999)
        } else {
            rng.gen_range(1000..=999_999)
        };
        let candidate = format!("{base}-{n}");
        if !taken.contains_key(&candidate) {
            return candidate;
        }
    }
}

/// Validates `proposed` against `current` and applies the allowed changes.
fn apply(current: &mut EnvironmentRecord, proposed: &EnvironmentRecord) -> EnvResult<bool> {
    if !current.status.can_transition_to(proposed.status) {
        return Err(EnvError::InvalidTransition {
            env_id: current.env_id.clone(),
            from: current.status,
            to: proposed.status,
        });
    }

    let used_rom = proposed.used_rom.max(current.used_rom);
    let used_ram = proposed.used_ram.max(current.used_ram);
    // Only growth is checked: a record already over quota must still be able
    // to change status.
    if used_rom > current.used_rom && used_rom > current.allocated_rom {
        return Err(EnvError::QuotaExceeded {
            env_id: current.env_id.clone(),
            requested: used_rom - current.used_rom,
            available: current.allocated_rom.saturating_sub(current.used_rom),
        });
    }
    if used_ram > current.used_ram && used_ram > current.allocated_ram {
        return Err(EnvError::QuotaExceeded {
            env_id: current.env_id.clone(),
            requested: used_ram - current.used_ram,
            available: current.allocated_ram.saturating_sub(current.used_ram),
        });
    }

    let before = current.clone();
    current.used_rom = used_rom;
    current.used_ram = used_ram;
    if current.rpc_port == 0 {
        current.rpc_port = proposed.rpc_port;
    }
    if current.p2p_port == 0 {
        current.p2p_port = proposed.p2p_port;
    }
    current.public_url = proposed.public_url.clone();
    current.status = proposed.status;

    Ok(*current != before)
}

impl EnvironmentRegistry {
    pub fn new(
        store: Arc<RecordStore>,
        data_root: impl Into<PathBuf>,
        limits: QuotaLimits,
        records: Vec<EnvironmentRecord>,
    ) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.env_id.clone(), r))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                records,
                generation: 0,
            }),
            store,
            data_root: data_root.into(),
            limits,
        }
    }

    async fn persist(&self, generation: u64, records: Vec<EnvironmentRecord>) {
        if let Err(e) = self.store.save_generation(generation, &records).await {
            // The in-memory registry stays authoritative; the next mutation
            // writes a full snapshot again.
            tracing::error!(generation, error = %format!("{e:#}"), "failed to persist environment registry");
        }
    }

    pub async fn allocate(&self, rom_gb: u64, ram_gb: u64, name: &str) -> EnvResult<EnvironmentRecord> {
        if rom_gb == 0 || ram_gb == 0 {
            return Err(EnvError::InvalidQuota(
                "rom_gb and ram_gb must be positive".to_string(),
            ));
        }
        if rom_gb > self.limits.max_rom_gb || ram_gb > self.limits.max_ram_gb {
            return Err(EnvError::InvalidQuota(format!(
                "requested {rom_gb}GB ROM / {ram_gb}GB RAM exceeds the limit of {}GB / {}GB",
                self.limits.max_rom_gb, self.limits.max_ram_gb
            )));
        }
        let allocated_rom = gib_to_bytes(rom_gb)
            .ok_or_else(|| EnvError::InvalidQuota(format!("rom_gb too large: {rom_gb}")))?;
        let allocated_ram = gib_to_bytes(ram_gb)
            .ok_or_else(|| EnvError::InvalidQuota(format!("ram_gb too large: {ram_gb}")))?;

        let base = format!("{}{ID_SUFFIX}", sanitize_name(name));

        let (record, (generation, snapshot)) = {
            let mut inner = self.inner.lock().await;
            let env_id = generate_id(&base, &inner.records);
            let record = EnvironmentRecord {
                base_path: self.data_root.join(&env_id),
                env_id: env_id.clone(),
                allocated_rom,
                allocated_ram,
                used_rom: 0,
                used_ram: 0,
                rpc_port: 0,
                p2p_port: 0,
                public_url: String::new(),
                status: EnvStatus::Allocated,
                created_at: Utc::now(),
            };
            inner.records.insert(env_id, record.clone());
            (record, inner.snapshot())
        };

        self.persist(generation, snapshot).await;
        tracing::info!(env_id = %record.env_id, rom_gb, ram_gb, "environment allocated");
        Ok(record)
    }

    pub async fn deallocate(&self, env_id: &str) -> bool {
        let (generation, snapshot) = {
            let mut inner = self.inner.lock().await;
            if inner.records.remove(env_id).is_none() {
                return false;
            }
            inner.snapshot()
        };
        self.persist(generation, snapshot).await;
        tracing::info!(env_id, "environment deallocated");
        true
    }

    /// Upserts an existing record. Returns `Ok(false)` when the id is unknown.
    ///
    /// Only mutable fields are taken from `record`: ports are written while
    /// unassigned, usage only grows, and the status must follow the
    /// lifecycle state machine.
    pub async fn update(&self, record: &EnvironmentRecord) -> EnvResult<bool> {
        let pending = {
            let mut inner = self.inner.lock().await;
            let Some(current) = inner.records.get_mut(&record.env_id) else {
                return Ok(false);
            };
            if apply(current, record)? {
                Some(inner.snapshot())
            } else {
                None
            }
        };
        if let Some((generation, snapshot)) = pending {
            self.persist(generation, snapshot).await;
        }
        Ok(true)
    }

    /// Read-modify-write of one record under the registry lock.
    pub async fn modify<F>(&self, env_id: &str, f: F) -> EnvResult<EnvironmentRecord>
    where
        F: FnOnce(&mut EnvironmentRecord),
    {
        let (record, pending) = {
            let mut inner = self.inner.lock().await;
            let current = inner
                .records
                .get_mut(env_id)
                .ok_or_else(|| EnvError::NotFound(env_id.to_string()))?;
            let mut proposed = current.clone();
            f(&mut proposed);
            let changed = apply(current, &proposed)?;
            let record = current.clone();
            (record, changed.then(|| inner.snapshot()))
        };
        if let Some((generation, snapshot)) = pending {
            self.persist(generation, snapshot).await;
        }
        Ok(record)
    }

    pub async fn set_status(&self, env_id: &str, status: EnvStatus) -> EnvResult<EnvironmentRecord> {
        let record = self.modify(env_id, |r| r.status = status).await?;
        tracing::info!(env_id, %status, "environment status changed");
        Ok(record)
    }

    /// Charges bookkeeping usage against the environment's quota.
    pub async fn record_usage(&self, env_id: &str, rom_bytes: u64, ram_bytes: u64) -> EnvResult<EnvironmentRecord> {
        self.modify(env_id, |r| {
            r.used_rom = r.used_rom.saturating_add(rom_bytes);
            r.used_ram = r.used_ram.saturating_add(ram_bytes);
        })
        .await
    }

    pub async fn get_stats(&self, env_id: &str) -> Option<EnvironmentRecord> {
        self.inner.lock().await.records.get(env_id).cloned()
    }

    pub async fn list(&self) -> Vec<EnvironmentRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    pub async fn validate_quota(&self, env_id: &str, required_bytes: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.records.get(env_id).is_some_and(|r| {
            r.used_rom
                .checked_add(required_bytes)
                .is_some_and(|total| total <= r.allocated_rom)
        })
    }
}
