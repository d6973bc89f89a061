use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_DATA_ROOT: &str = "/virtual-envs";
const DEFAULT_TEMPLATE_DIR: &str = "/app/blockchain-template";
const DEFAULT_LOG_DIR: &str = "/logs";
const DEFAULT_NODE_BINARY: &str = "kortana-blockchain-rust/target/release/kortana-blockchain";
const DEFAULT_PROXY_SCRIPT: &str = "/app/scripts/configure-nginx.sh";
const DEFAULT_DOMAIN: &str = "worchsester.xyz";

pub const DEFAULT_RPC_PORT_BASE: u16 = 8545;
pub const DEFAULT_P2P_PORT_BASE: u16 = 30333;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

fn absolute(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

/// Runtime settings for the agent, sourced from `VNODE_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Parent of every environment's `base_path`.
    pub data_root: PathBuf,
    pub state_file: PathBuf,
    pub template_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Node executable, relative to an environment's workspace.
    pub node_binary: PathBuf,
    pub proxy_script: Option<PathBuf>,
    pub domain: String,
    pub rpc_port_base: u16,
    pub p2p_port_base: u16,
    pub stop_grace: Duration,
    pub max_rom_gb: u64,
    pub max_ram_gb: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_root = PathBuf::from(DEFAULT_DATA_ROOT);
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9000))),
            state_file: data_root.join("environments.json"),
            data_root,
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            node_binary: PathBuf::from(DEFAULT_NODE_BINARY),
            proxy_script: Some(PathBuf::from(DEFAULT_PROXY_SCRIPT)),
            domain: DEFAULT_DOMAIN.to_string(),
            rpc_port_base: DEFAULT_RPC_PORT_BASE,
            p2p_port_base: DEFAULT_P2P_PORT_BASE,
            stop_grace: Duration::from_secs(10),
            max_rom_gb: 2048,
            max_ram_gb: 32,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(raw) = env_string("VNODE_LISTEN_ADDR") {
            cfg.listen_addr = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid VNODE_LISTEN_ADDR {raw:?}: {e}"))?;
        }
        if let Some(raw) = env_string("VNODE_DATA_ROOT") {
            cfg.data_root = absolute(PathBuf::from(raw));
        }
        cfg.state_file = env_string("VNODE_STATE_FILE")
            .map(|raw| absolute(PathBuf::from(raw)))
            .unwrap_or_else(|| cfg.data_root.join("environments.json"));
        if let Some(raw) = env_string("VNODE_TEMPLATE_DIR") {
            cfg.template_dir = absolute(PathBuf::from(raw));
        }
        if let Some(raw) = env_string("VNODE_LOG_DIR") {
            cfg.log_dir = absolute(PathBuf::from(raw));
        }
        if let Some(raw) = env_string("VNODE_NODE_BINARY") {
            let p = PathBuf::from(raw);
            if p.is_absolute() {
                anyhow::bail!("VNODE_NODE_BINARY must be relative to the environment workspace");
            }
            cfg.node_binary = p;
        }
        // An explicitly empty value disables route configuration.
        match std::env::var("VNODE_PROXY_SCRIPT") {
            Ok(v) if v.trim().is_empty() => cfg.proxy_script = None,
            Ok(v) => cfg.proxy_script = Some(absolute(PathBuf::from(v.trim()))),
            Err(_) => {}
        }
        if let Some(domain) = env_string("VNODE_DOMAIN").or_else(|| env_string("DOMAIN")) {
            cfg.domain = domain;
        }
        if let Some(v) = env_u16("VNODE_RPC_PORT_BASE") {
            cfg.rpc_port_base = v.max(1024);
        }
        if let Some(v) = env_u16("VNODE_P2P_PORT_BASE") {
            cfg.p2p_port_base = v.max(1024);
        }
        if let Some(v) = env_u64("VNODE_STOP_GRACE_SEC") {
            cfg.stop_grace = Duration::from_secs(v.clamp(1, 120));
        }
        if let Some(v) = env_u64("VNODE_MAX_ROM_GB") {
            cfg.max_rom_gb = v.clamp(1, 64 * 1024);
        }
        if let Some(v) = env_u64("VNODE_MAX_RAM_GB") {
            cfg.max_ram_gb = v.clamp(1, 4 * 1024);
        }

        Ok(cfg)
    }

    /// Config rooted in a scratch directory, for tests and local runs.
    pub fn rooted_at(root: &Path) -> Self {
        let data_root = root.join("virtual-envs");
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            state_file: data_root.join("environments.json"),
            data_root,
            template_dir: root.join("template"),
            log_dir: root.join("logs"),
            proxy_script: None,
            ..Self::default()
        }
    }

    pub fn env_base_path(&self, env_id: &str) -> PathBuf {
        self.data_root.join(env_id)
    }

    pub fn env_log_path(&self, env_id: &str) -> PathBuf {
        self.log_dir.join(format!("{env_id}.log"))
    }

    pub fn public_url(&self, env_id: &str) -> String {
        format!("https://{env_id}-rpc.{}", self.domain)
    }
}
