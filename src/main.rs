use std::sync::Arc;

use tracing::info;

use bookhold::catalog::MemoryCatalog;
use bookhold::clock::{Clock, WallClock};
use bookhold::config::Config;
use bookhold::engine::{Collaborators, Engine};
use bookhold::notify::{LogNotifier, NotifyHub};
use bookhold::seed::Seed;
use bookhold::standing::{CachedStanding, MemoryStanding};
use bookhold::sweeper::{self, SweepTrigger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    bookhold::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let catalog = Arc::new(MemoryCatalog::new());
    let directory = Arc::new(MemoryStanding::new());
    if let Some(path) = &config.seed_path {
        Seed::load(path)?.install(&catalog, &directory);
    }
    let clock: Arc<dyn Clock> = Arc::new(WallClock);
    let standing = CachedStanding::new(directory, clock.clone(), config.standing_cache_ms());

    let engine = Engine::new(
        config.wal_path(),
        config.engine_settings(),
        Collaborators {
            catalog,
            standing: Arc::new(standing),
            notifier: Arc::new(LogNotifier),
            clock,
        },
        Arc::new(NotifyHub::new()),
    )?;

    // Catalog counts come from the seed, not the WAL; hand out copies that
    // are available while readers still wait.
    let startup = sweeper::sweep_once(&engine).await;
    info!(
        "startup sweep: {} expired, {} allocated",
        startup.expired.len(),
        startup.reallocated.len()
    );

    let trigger = SweepTrigger::new();
    let sweeper_task = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        trigger.clone(),
    ));
    let compactor_task = tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    info!("bookhold running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold_ttl: {:?}", config.hold_ttl);
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown on SIGTERM/ctrl-c; SIGHUP requests a sweep
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => trigger.fire(),
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received, stopping background tasks");
    sweeper_task.abort();
    compactor_task.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("bookhold stopped");
    Ok(())
}
