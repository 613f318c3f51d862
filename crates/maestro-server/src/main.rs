//! The maestro orchestrator binary.
//!
//! Startup order: open the store, run migrations, construct the
//! components, recover pending missions (interrupted `running` rows
//! re-queue with a cleared execution id), start the timeout enforcer and
//! control-plane loops, then serve the submission API. Shutdown reverses
//! it: stop accepting submissions, cancel the loops, drain, close the
//! store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use maestro_core::llm::{HttpLanguageModel, LanguageModel};
use maestro_core::orchestrator::{Orchestrator, OrchestratorConfig};
use maestro_core::runtime::claude_session::ClaudeSessionRuntime;
use maestro_db::pool;
use maestro_server::api;
use maestro_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // 1. Store: ensure, connect, migrate.
    pool::ensure_database_exists(&config.db).await?;
    let pg = pool::create_pool(&config.db).await?;
    pool::run_migrations(&pg, resolve_migrations_path()?.as_path()).await?;

    // 2. Capabilities.
    let runtime = Arc::new(ClaudeSessionRuntime::with_binary(&config.worker_binary));
    let llm: Option<Arc<dyn LanguageModel>> = config.llm.as_ref().map(|cfg| {
        tracing::info!(model = %cfg.model, "LLM routing enabled");
        Arc::new(HttpLanguageModel::new(&cfg.base_url, &cfg.model, &cfg.api_key))
            as Arc<dyn LanguageModel>
    });
    if llm.is_none() {
        tracing::info!("no LLM provider configured; routing runs heuristically");
    }

    // 3. The root orchestrator. The semantic index collaborator plugs in
    //    through maestro_core::index::SemanticIndex; without one the
    //    learning loop falls back to store-backed retrieval.
    let orchestrator = Arc::new(Orchestrator::new(
        pg.clone(),
        runtime,
        llm,
        None,
        config.queue.clone(),
        config.triggers.clone(),
        OrchestratorConfig {
            timeout_check_interval: ServerConfig::timeout_check_interval()?,
            ..OrchestratorConfig::default()
        },
    ));

    // 4. Recovery, enforcer, control plane.
    let recovered = orchestrator.start().await?;
    tracing::info!(recovered, "pending missions recovered");

    let cancel = CancellationToken::new();
    let control_plane = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(cancel).await })
    };

    // 5. The submission API blocks until ctrl-c.
    api::run_serve(Arc::clone(&orchestrator), &config.bind, config.port).await?;

    // 6. Orderly teardown: no new submissions (the listener is gone),
    //    stop the loops, drain, close the store.
    cancel.cancel();
    control_plane
        .await
        .context("control plane task panicked")??;
    pg.close().await;
    tracing::info!("maestro stopped");
    Ok(())
}

/// Locate the migrations shipped with `maestro-db`.
///
/// Development builds resolve through the crate source tree; installed
/// binaries can point `MAESTRO_MIGRATIONS_DIR` elsewhere.
fn resolve_migrations_path() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("MAESTRO_MIGRATIONS_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(pool::default_migrations_path().to_path_buf())
}
