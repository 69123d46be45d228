use clap::Parser;
use cvd_fleet::api;
use cvd_fleet::config::Config;
use cvd_fleet::cra::DockerRuntime;
use cvd_fleet::kvs::SledKvs;
use cvd_fleet::utils::cli::Args;
use cvd_fleet::utils::state::AppState;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args));

    let runtime = Arc::new(DockerRuntime::connect()?);
    let kvs = Arc::new(SledKvs::open(config.kvs_path())?);

    let state = Arc::new(AppState::new(runtime, kvs, config.clone()));
    state.vmm.reconcile_indices().await?;

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = api::create_router(state).layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
}
