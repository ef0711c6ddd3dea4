use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use mailsweep::config::Config;
use mailsweep::db;
use mailsweep::mailbox::ProtocolFactory;
use mailsweep::routes::{self, AppState};
use mailsweep::services::job_queue::JobQueue;
use mailsweep::services::progress::ProgressPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mailsweep=debug")),
        )
        .init();

    let config = Config::from_env();

    if !std::path::Path::new("migrations").exists() {
        anyhow::bail!("migrations folder not found");
    }
    let pool = db::connect(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let publisher = ProgressPublisher::new();
    let factory = Arc::new(ProtocolFactory::new(
        config.sync.connect_timeout,
        config.sync.fetch_timeout,
    ));
    let queue = JobQueue::new(
        pool.clone(),
        publisher.clone(),
        factory,
        config.sync.clone(),
    );
    queue.start();

    let state = AppState {
        pool,
        queue,
        publisher,
    };

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(routes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
}
