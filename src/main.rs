use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use orchest_api::config::Config;
use orchest_api::cra::docker::DockerRuntime;
use orchest_api::store::{AppState, pool};
use orchest_api::taskbus::TaskRegistry;
use orchest_api::{api, gc, scheduler, workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("ORCHEST_API_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cfg = Config::load();

    let db_pool = pool::connect(&cfg.database_url).await?;
    let cra: Arc<dyn orchest_api::cra::ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let state = AppState {
        pool: db_pool,
        cra,
        tasks: Arc::new(TaskRegistry::new()),
        config: Arc::new(cfg.clone()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let dispatcher = tokio::spawn(workers::run(
        state.clone(),
        cfg.dispatch_poll_interval,
        shutdown_rx.clone(),
    ));

    let mut recurring_scheduler = scheduler::RecurringScheduler::new(state.pool.clone());
    recurring_scheduler.register_defaults(&cfg);
    let recurring = tokio::spawn(recurring_scheduler.run(shutdown_rx.clone()));

    let gc_sweep_interval = std::time::Duration::from_secs(
        u64::try_from(cfg.gc_sweep_interval_minutes.max(1)).unwrap_or(15) * 60,
    );
    let gc_sweep = tokio::spawn(gc::run(state.clone(), gc_sweep_interval, shutdown_rx.clone()));

    let app = api::router().with_state(state);

    let addr: SocketAddr = cfg.listen.parse()?;
    tracing::info!(%addr, "starting orchest-api");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(());
    let _ = tokio::join!(dispatcher, recurring, gc_sweep);

    tracing::info!("orchest-api stopped");
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
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
