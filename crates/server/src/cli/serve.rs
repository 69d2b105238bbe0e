use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::cli::{GlobalArgs, ServeArgs, open_engine};
use crate::config::AppConfig;
use crate::routes;
use crate::state::AppState;

pub async fn execute(global: GlobalArgs, serve_args: ServeArgs) -> anyhow::Result<()> {
    //  Config / store
    let mut cfg = AppConfig::load_or_default()?;
    if let Some(host) = serve_args.host {
        cfg.host = host;
    }
    if let Some(port) = serve_args.port {
        cfg.port = port;
    }
    if global.models_dir.is_some() {
        cfg.models_dir = global.models_dir.clone();
    }
    let prune = cfg.prune_on_start && !serve_args.no_prune;
    let engine = tokio::task::spawn_blocking({
        let global = global.clone();
        let cfg = cfg.clone();
        move || open_engine(&global, &cfg, prune)
    })
    .await??;
    let engine = Arc::new(engine);

    //  Shared state / router
    let state = AppState::new(cfg.clone(), Arc::clone(&engine));
    let app = routes::app(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(engine))
        .await?;

    Ok(())
}

/// Resolves on Ctrl-C after asking every running transfer to stop.
async fn shutdown(engine: Arc<model_store::Engine>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    let running = engine.sessions().snapshots();
    for snapshot in &running {
        engine.cancel(snapshot.id);
    }
    info!(cancelled = running.len(), "Shutting down");
}
