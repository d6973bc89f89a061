use std::path::PathBuf;

use crate::command;
use crate::error::{EnvError, EnvResult};

/// Maps an environment's public URL to its RPC port via an external script.
///
/// The script is invoked as `<script> <public_url> <port>`; its exit status
/// is the only success signal.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    script: Option<PathBuf>,
}

impl ReverseProxy {
    pub fn new(script: Option<PathBuf>) -> Self {
        Self { script }
    }

    pub fn disabled() -> Self {
        Self { script: None }
    }

    pub async fn configure(&self, env_id: &str, public_url: &str, port: u16) -> EnvResult<()> {
        let Some(script) = &self.script else {
            tracing::debug!(env_id, public_url, "reverse proxy disabled; skipping route");
            return Ok(());
        };

        let failure = |detail: String| EnvError::ProxyConfigFailure {
            url: public_url.to_string(),
            detail,
        };

        let out = command::run(script, [public_url.to_string(), port.to_string()])
            .await
            .map_err(|e| failure(format!("run {}: {e}", script.display())))?;
        if !out.success() {
            return Err(failure(out.describe()));
        }

        tracing::info!(env_id, public_url, port, "reverse proxy route configured");
        Ok(())
    }
}
