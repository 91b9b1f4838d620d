//! `llamafarmd`: loads a project configuration, assembles the runtime
//! (model cache, detector manager, MCP service, chat orchestrator), and
//! serves the HTTP API until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use llamafarm_core::api::models::list_models_on_disk;
use llamafarm_core::api::{create_router, AppState};
use llamafarm_core::config::ProjectConfig;
use llamafarm_core::mcp::McpService;
use llamafarm_core::orchestrator::ChatOrchestrator;
use llamafarm_core::runtime::cache::ModelCache;
use llamafarm_core::runtime::detector::DetectorManager;
use llamafarm_core::runtime::wrappers::ModelHandle;

#[derive(Parser, Debug)]
#[command(name = "llamafarmd", about = "LlamaFarm project runtime daemon")]
struct Cli {
    /// Path to the project's `llamafarm.yaml`.
    #[arg(long, env = "LF_PROJECT_FILE", global = true)]
    project_file: PathBuf,

    /// Verbosity: -v, -vv, -vvv.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP daemon. The default when no subcommand is given.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, env = "LF_BIND_ADDR", default_value = "127.0.0.1:8242")]
        bind_addr: String,
    },
    /// Send one message to a configured model and print the reply, without
    /// starting the HTTP server.
    Chat {
        /// Name of a model declared in the project's runtime config.
        model: String,
        message: String,
        #[arg(long, default_value = "cli")]
        session_id: String,
    },
    /// List models present in the local model cache directory.
    Models,
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

/// Runs `pop_expired` on the model cache every `poll_interval`, unloading
/// each drained wrapper outside the cache's internal lock. Cancelled by
/// dropping the returned `JoinHandle`'s owning task on shutdown.
fn spawn_model_cache_janitor(
    cache: Arc<ModelCache<ModelHandle>>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            for (key, wrapper) in cache.pop_expired() {
                tracing::info!(key = %key, "model cache janitor: unloading idle model");
                wrapper.unload();
            }
        }
    })
}

/// On shutdown: one final sweep with TTL=0, unloading everything still
/// resident.
fn final_cache_sweep(cache: &ModelCache<ModelHandle>) {
    for (key, wrapper) in cache.pop_expired_with_ttl(Duration::ZERO) {
        tracing::info!(key = %key, "shutdown sweep: unloading model");
        wrapper.unload();
    }
}

/// Runs `FileCache::pop_expired` every `poll_interval`, dropping idle
/// upload metadata from memory (the blob on disk is left in place).
fn spawn_file_cache_janitor(
    files: Arc<llamafarm_core::api::FileCache>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            for hash in files.pop_expired() {
                tracing::debug!(file_hash = %hash, "file cache janitor: dropped idle upload metadata");
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = llamafarm_common::init_tracing("llamafarm_core", cli.verbose)?;

    let config = ProjectConfig::load(&cli.project_file)
        .with_context(|| format!("loading project file {}", cli.project_file.display()))?;
    let project_dir = cli
        .project_file
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command.unwrap_or(Commands::Serve {
        bind_addr: "127.0.0.1:8242".to_string(),
    }) {
        Commands::Serve { bind_addr } => run_serve(config, project_dir, bind_addr).await,
        Commands::Chat {
            model,
            message,
            session_id,
        } => run_chat(config, project_dir, &model, &session_id, &message).await,
        Commands::Models => run_models(),
    }
}

async fn run_serve(config: ProjectConfig, project_dir: PathBuf, bind_addr: String) -> anyhow::Result<()> {
    let ttl = env_duration_secs("MODEL_UNLOAD_TIMEOUT", 300);
    let poll_interval = env_duration_secs("CLEANUP_CHECK_INTERVAL", 30);

    let model_cache = Arc::new(ModelCache::<ModelHandle>::new(ttl, 32));
    let detectors = Arc::new(DetectorManager::new());
    let mcp = Arc::new(McpService::new(config.mcp.clone().unwrap_or_default()));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        project_dir.clone(),
        config.clone(),
        mcp.clone(),
        None,
    ));

    let file_ttl = env_duration_secs("FILE_CACHE_TTL", 3600);
    let state = AppState::new(
        config,
        project_dir,
        model_cache.clone(),
        detectors,
        mcp.clone(),
        orchestrator,
        file_ttl,
    );

    let janitor = spawn_model_cache_janitor(model_cache.clone(), poll_interval);
    let file_janitor = spawn_file_cache_janitor(state.files.clone(), poll_interval);

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "llamafarmd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    janitor.abort();
    file_janitor.abort();
    final_cache_sweep(&model_cache);
    if let Err(e) = mcp.close_all_persistent_sessions().await {
        tracing::warn!(error = %e, "error closing mcp sessions during shutdown");
    }

    Ok(())
}

/// Drives one chat turn through the same `ChatOrchestrator` the daemon uses,
/// without binding a socket: convenient for scripting and smoke-testing a
/// project file.
async fn run_chat(
    config: ProjectConfig,
    project_dir: PathBuf,
    model: &str,
    session_id: &str,
    message: &str,
) -> anyhow::Result<()> {
    let mcp = Arc::new(McpService::new(config.mcp.clone().unwrap_or_default()));
    let orchestrator = ChatOrchestrator::new(project_dir, config, mcp.clone(), None);

    let reply = orchestrator.chat(model, session_id, message, None).await?;
    println!("{reply}");

    mcp.close_all_persistent_sessions().await.ok();
    Ok(())
}

fn run_models() -> anyhow::Result<()> {
    let models = list_models_on_disk();
    if models.is_empty() {
        println!("no models cached locally");
        return Ok(());
    }
    for entry in models {
        println!("{}\t{} bytes\t{}", entry.id, entry.size_bytes, entry.path);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
