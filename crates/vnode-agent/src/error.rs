use std::path::PathBuf;

use vnode_env::EnvStatus;

pub type EnvResult<T> = Result<T, EnvError>;

/// Failure of a single registry or supervisor call.
///
/// Every error travels with the call that produced it; nothing is stashed on
/// the component for a later "last error" lookup.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("quota exceeded for {env_id}: requested {requested} bytes, {available} bytes available")]
    QuotaExceeded {
        env_id: String,
        requested: u64,
        available: u64,
    },

    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("invalid environment id: {0}")]
    InvalidId(String),

    #[error("environment {env_id} cannot move from {from} to {to}")]
    InvalidTransition {
        env_id: String,
        from: EnvStatus,
        to: EnvStatus,
    },

    #[error("template directory {} not found", .0.display())]
    TemplateMissing(PathBuf),

    #[error("failed to copy template into {}: {detail}", .dest.display())]
    CopyFailure { dest: PathBuf, detail: String },

    #[error("node binary not found at {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("node binary {} has unresolved libraries: {}", .path.display(), .missing.join(", "))]
    LinkageError { path: PathBuf, missing: Vec<String> },

    #[error("failed to spawn node for {env_id}: {detail}")]
    SpawnFailure { env_id: String, detail: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("reverse proxy configuration failed for {url}: {detail}")]
    ProxyConfigFailure { url: String, detail: String },

    #[error("{0} port range exhausted")]
    PortsExhausted(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Stable machine-readable code used in API error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EnvError::NotFound(_) => "not_found",
            EnvError::QuotaExceeded { .. } => "quota_exceeded",
            EnvError::InvalidQuota(_) => "invalid_quota",
            EnvError::InvalidId(_) => "invalid_id",
            EnvError::InvalidTransition { .. } => "invalid_transition",
            EnvError::TemplateMissing(_) => "template_missing",
            EnvError::CopyFailure { .. } => "copy_failure",
            EnvError::BinaryMissing(_) => "binary_missing",
            EnvError::LinkageError { .. } => "linkage_error",
            EnvError::SpawnFailure { .. } => "spawn_failure",
            EnvError::ParseError(_) => "parse_error",
            EnvError::ProxyConfigFailure { .. } => "proxy_config_failure",
            EnvError::PortsExhausted(_) => "ports_exhausted",
            EnvError::Io(_) => "io_error",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            EnvError::QuotaExceeded { .. } => {
                Some("Allocate a larger environment or free space in this one.")
            }
            EnvError::InvalidTransition { .. } => {
                Some("Deploy before starting; stop before redeploying.")
            }
            EnvError::TemplateMissing(_) => {
                Some("Check VNODE_TEMPLATE_DIR points at the node template tree.")
            }
            EnvError::BinaryMissing(_) => {
                Some("Build the node binary into the template, or set VNODE_NODE_BINARY.")
            }
            EnvError::LinkageError { .. } => {
                Some("Install the listed libraries on the host, or ship a static build.")
            }
            EnvError::PortsExhausted(_) => {
                Some("Lower VNODE_RPC_PORT_BASE / VNODE_P2P_PORT_BASE or prune the state file.")
            }
            _ => None,
        }
    }
}
