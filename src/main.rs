//! modelserverd entry point.
//!
//! Bootstraps the orchestrator: configuration (env + flags), logging,
//! the config store, GPU probing, and the control API; shuts down
//! gracefully on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use modelserver_core::config::{self, ServiceConfig};
use modelserver_core::resources::{GpuProbe, NvidiaSmiProbe, StaticGpuProbe};
use modelserver_core::store::FileConfigStore;
use modelserver_core::telemetry::{init_logging, LogConfig, LogFormat};
use modelserver_core::{api, Orchestrator, OrchestratorOptions};

/// Multi-tenant inference-server orchestrator.
#[derive(Debug, Parser)]
#[command(name = "modelserverd", version, about)]
struct Cli {
    /// Config-store DSN; a plain path selects the file-backed store.
    #[arg(long)]
    database_url: Option<String>,

    /// Control API bind address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// State directory for the store and its backups.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "modelserver_core=debug".
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: json or pretty.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Environment config with CLI flags layered on top.
    fn resolve(self) -> ServiceConfig {
        let mut config = config::load();
        if let Some(data_dir) = self.data_dir {
            config.database_url = data_dir.join("models.json").display().to_string();
            config.data_dir = data_dir;
        }
        if let Some(database_url) = self.database_url {
            config.database_url = database_url;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Cli::parse().resolve();

    let log_config = LogConfig {
        format: config
            .log_format
            .parse::<LogFormat>()
            .unwrap_or(LogFormat::Json),
        level: config.log_level.clone(),
        output_path: None,
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("fatal: logging init failed: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(config = ?config.effective_config(), "starting modelserverd");

    let store = match FileConfigStore::open(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "fatal: config store init failed");
            return ExitCode::FAILURE;
        }
    };

    let probe = detect_probe().await;
    let adapters = Orchestrator::default_adapters(&config);
    let orchestrator = Orchestrator::new(
        config.clone(),
        store,
        probe,
        adapters,
        OrchestratorOptions::default(),
    );
    if let Err(e) = orchestrator.start().await {
        tracing::error!(error = %e, "fatal: orchestrator start failed");
        return ExitCode::FAILURE;
    }

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.bind_addr, "fatal: bind failed");
            orchestrator.stop().await;
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %config.bind_addr, "control API listening");

    let app = api::router(orchestrator.clone());
    let shutdown = wait_for_signal();
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown);

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        orchestrator.stop().await;
        return ExitCode::FAILURE;
    }

    orchestrator.stop().await;
    tracing::info!("modelserverd exited cleanly");
    ExitCode::SUCCESS
}

/// Prefer the nvidia-smi probe when the tool is present; otherwise run
/// with an empty device table (scheduling will report exhaustion).
async fn detect_probe() -> Arc<dyn GpuProbe> {
    let probe = NvidiaSmiProbe::new();
    match probe.detect().await {
        Ok(devices) => {
            tracing::info!(count = devices.len(), "gpu probe: nvidia-smi");
            Arc::new(probe)
        }
        Err(e) => {
            tracing::warn!(error = %e, "gpu probe unavailable; starting with no devices");
            Arc::new(StaticGpuProbe::empty())
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
