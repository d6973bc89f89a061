use std::path::Path;
use std::sync::Arc;

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vnode_agent::api;
use vnode_agent::config::AgentConfig;
use vnode_agent::proxy::ReverseProxy;
use vnode_agent::recovery;
use vnode_agent::state::AppState;

/// Stdout plus a daily-rolling `vnode-agent.log` under `log_dir`. The guard
/// must outlive the runtime or buffered lines are lost.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let appender = rolling::RollingFileAppender::builder()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("vnode-agent")
        .filename_suffix("log")
        .build(log_dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            tracing::warn!(log_dir = %log_dir.display(), error = %e, "file logging disabled");
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(AgentConfig::from_env()?);
    let _log_guard = init_tracing(&cfg.log_dir);

    tracing::info!(
        data_root = %cfg.data_root.display(),
        template = %cfg.template_dir.display(),
        domain = %cfg.domain,
        "vnode-agent starting"
    );

    let proxy = ReverseProxy::new(cfg.proxy_script.clone());
    let (service, report) = recovery::bootstrap(cfg.clone(), proxy).await;
    tracing::info!(
        recovered = report.recovered.len(),
        demoted = report.demoted.len(),
        "recovery complete"
    );

    let app = api::router(AppState { service });
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(addr = %cfg.listen_addr, "vnode-agent HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
