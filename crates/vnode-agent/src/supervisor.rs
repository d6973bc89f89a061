use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::Mutex,
};

use crate::config::AgentConfig;
use crate::error::{EnvError, EnvResult};
use crate::logs;
use crate::workspace::{self, CloneOutcome};

/// Liveness as observed by the supervisor, never read from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    Stopped,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Spawned { pid: Option<u32> },
    AlreadyRunning { pid: Option<u32> },
}

#[derive(Debug)]
struct TrackedProcess {
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    rpc_port: u16,
    p2p_port: u16,
}

/// Environment ids double as directory and file names.
pub fn validate_env_id(env_id: &str) -> EnvResult<()> {
    let ok = !env_id.is_empty()
        && env_id.len() <= 128
        && env_id != "."
        && env_id != ".."
        && env_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(EnvError::InvalidId(env_id.to_string()))
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the node gets SIGTERM; recovery re-spawns it on boot.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: i32) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _sig: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Returns the pid of a live tracked node, dropping the entry if it exited.
fn live_pid(
    table: &mut HashMap<String, TrackedProcess>,
    env_id: &str,
    rpc_port: u16,
    p2p_port: u16,
) -> Option<Option<u32>> {
    let existing = table.get_mut(env_id)?;
    match existing.child.try_wait() {
        Ok(None) => {
            if existing.rpc_port != rpc_port || existing.p2p_port != p2p_port {
                tracing::warn!(
                    env_id,
                    running_rpc = existing.rpc_port,
                    requested_rpc = rpc_port,
                    "node already running on different ports"
                );
            }
            Some(existing.pid)
        }
        _ => {
            table.remove(env_id);
            None
        }
    }
}

/// Owns the workspace, binary and OS process of every environment node.
///
/// The process table lives only in memory: it starts empty on every boot and
/// is the sole source of truth for "is this node alive". Workspace paths come
/// from the caller's record, never from the current data root.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    cfg: Arc<AgentConfig>,
    table: Arc<Mutex<HashMap<String, TrackedProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self {
            cfg,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn clone(&self, env_id: &str, base_path: &Path, template: &Path) -> EnvResult<CloneOutcome> {
        validate_env_id(env_id)?;
        let outcome = workspace::clone_template(base_path, template).await?;
        match outcome {
            CloneOutcome::Created => {
                tracing::info!(env_id, template = %template.display(), "workspace materialized")
            }
            CloneOutcome::AlreadyPresent => {
                tracing::info!(env_id, "workspace already present; skipping copy")
            }
        }
        Ok(outcome)
    }

    pub async fn validate_binary(&self, env_id: &str, base_path: &Path) -> EnvResult<PathBuf> {
        validate_env_id(env_id)?;
        workspace::validate_binary(&workspace::workspace_dir(base_path), &self.cfg.node_binary).await
    }

    /// Spawns the node for `env_id` from the workspace under `base_path`
    /// unless it is already alive.
    ///
    /// Success means the process was spawned, not that the node is serving.
    pub async fn start(
        &self,
        env_id: &str,
        base_path: &Path,
        rpc_port: u16,
        p2p_port: u16,
    ) -> EnvResult<StartOutcome> {
        validate_env_id(env_id)?;
        if let Some(pid) = live_pid(&mut *self.table.lock().await, env_id, rpc_port, p2p_port) {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let ws = workspace::workspace_dir(base_path);
        let bin = ws.join(&self.cfg.node_binary);
        let data_dir = base_path.join("data");
        let log_path = self.cfg.env_log_path(env_id);

        let spawn_failure = |detail: String| EnvError::SpawnFailure {
            env_id: env_id.to_string(),
            detail,
        };

        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| spawn_failure(format!("create data dir {}: {e}", data_dir.display())))?;
        let mut log = open_log(&log_path)
            .await
            .map_err(|e| spawn_failure(format!("open log {}: {e}", log_path.display())))?;

        let args = vec![
            "--testnet".to_string(),
            "--rpc-addr".to_string(),
            format!("0.0.0.0:{rpc_port}"),
            "--p2p-port".to_string(),
            p2p_port.to_string(),
            "--data-dir".to_string(),
            data_dir.display().to_string(),
            "--log-level".to_string(),
            "debug".to_string(),
        ];
        let header = format!(
            "[vnode-agent] {} exec: {} {}\n",
            chrono::Utc::now().to_rfc3339(),
            bin.display(),
            args.join(" ")
        );
        let written = match log.write_all(header.as_bytes()).await {
            Ok(()) => log.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(env_id, error = %e, "failed to write exec header to node log");
        }

        let stdout = log.into_std().await;
        let stderr = stdout
            .try_clone()
            .map_err(|e| spawn_failure(format!("dup log handle: {e}")))?;
        let mut cmd = Command::new(&bin);
        cmd.args(&args)
            .current_dir(&ws)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(stdout))
            .stderr(std::process::Stdio::from(stderr))
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // Own session, so stop can signal the whole process tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut table = self.table.lock().await;
        // A concurrent start may have won while the workspace was prepared.
        if let Some(pid) = live_pid(&mut table, env_id, rpc_port, p2p_port) {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        let child = cmd
            .spawn()
            .map_err(|e| spawn_failure(format!("exec {}: {e}", bin.display())))?;
        let pid = child.id();

        table.insert(
            env_id.to_string(),
            TrackedProcess {
                child,
                pid,
                pgid: pid.map(|p| p as i32),
                rpc_port,
                p2p_port,
            },
        );
        drop(table);

        tracing::info!(env_id, ?pid, rpc_port, p2p_port, "node spawned");
        Ok(StartOutcome::Spawned { pid })
    }

    /// Sends SIGTERM to the tracked node and forgets it. Returns false when
    /// nothing was tracked for `env_id`.
    pub async fn stop(&self, env_id: &str) -> bool {
        let Some(mut tracked) = self.table.lock().await.remove(env_id) else {
            return false;
        };

        if let Some(pgid) = tracked.pgid {
            signal_group(pgid, SIGTERM);
        }
        tracing::info!(env_id, pid = ?tracked.pid, "sent SIGTERM to node");

        // Reap in the background; escalate if the node ignores SIGTERM.
        let grace = self.cfg.stop_grace;
        let env_id = env_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(grace, tracked.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(env_id = %env_id, code = ?status.code(), "node exited after stop");
                }
                Ok(Err(e)) => {
                    tracing::warn!(env_id = %env_id, error = %e, "failed to reap stopped node");
                }
                Err(_) => {
                    if let Some(pgid) = tracked.pgid {
                        signal_group(pgid, SIGKILL);
                    }
                    tracing::warn!(env_id = %env_id, grace_ms = grace.as_millis() as u64, "node ignored SIGTERM; sent SIGKILL");
                    let _ = tracked.child.wait().await;
                }
            }
        });
        true
    }

    /// Non-blocking liveness check. An exited node is dropped from the table.
    pub async fn status(&self, env_id: &str) -> NodeState {
        let mut table = self.table.lock().await;
        let Some(tracked) = table.get_mut(env_id) else {
            return NodeState::Stopped;
        };
        match tracked.child.try_wait() {
            Ok(None) => NodeState::Running,
            Ok(Some(status)) => {
                tracing::warn!(env_id, code = ?status.code(), "node exited");
                table.remove(env_id);
                NodeState::Stopped
            }
            Err(e) => {
                tracing::warn!(env_id, error = %e, "liveness check failed; treating node as stopped");
                table.remove(env_id);
                NodeState::Stopped
            }
        }
    }

    pub async fn logs(&self, env_id: &str, lines: usize) -> EnvResult<String> {
        validate_env_id(env_id)?;
        Ok(logs::tail_file(&self.cfg.env_log_path(env_id), lines).await?)
    }

    pub async fn tracked_count(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_tracked(&self, env_id: &str) -> bool {
        self.table.lock().await.contains_key(env_id)
    }
}
