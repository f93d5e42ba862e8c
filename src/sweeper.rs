use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::engine::{Engine, SweepReport};

/// On-demand sweep request, e.g. from an admin endpoint or SIGHUP.
#[derive(Debug, Clone, Default)]
pub struct SweepTrigger(Arc<Notify>);

impl SweepTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a sweep. Requests made while one is pending coalesce.
    pub fn fire(&self) {
        self.0.notify_one();
    }

    pub async fn fired(&self) {
        self.0.notified().await;
    }
}

/// One sweep: expire due holds, reallocate, then refresh stale scores.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let now = engine.now();
    let report = engine.sweep_expired(now).await;
    let refreshed = engine.refresh_priorities(now).await;
    if refreshed > 0 {
        tracing::debug!("re-scored {refreshed} waitlist(s)");
    }
    report
}

/// Background task that sweeps every `period` and whenever `trigger` fires.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, trigger: SweepTrigger) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = trigger.fired() => info!("on-demand sweep requested"),
        }
        sweep_once(&engine).await;
    }
}

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
