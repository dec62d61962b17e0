use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use deskmate_backend::core::config::AppPaths;
use deskmate_backend::core::logging;
use deskmate_backend::server;
use deskmate_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = AppPaths::new();
    logging::init(&paths);

    let state = AppState::initialize(paths).await?;

    if state.settings.server.warm_up_on_start {
        state.pipeline.warm_up().await;
    }

    let bind_addr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!("listening on {}", addr);

    let app: Router = server::router::router(state);
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
