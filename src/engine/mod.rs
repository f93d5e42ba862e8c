mod allocation;
mod error;
mod mutations;
mod queries;

pub use allocation::SweepReport;
pub use error::EngineError;
pub use mutations::{RemovalReport, RetireReport};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::{Notifier, NotifyHub};
use crate::priority::{PriorityConfig, PriorityModel, DAY_MS};
use crate::standing::StandingProvider;
use crate::waitlist::Scoring;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop the writer; every later append fails.
    #[cfg(test)]
    Shutdown,
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until a command arrives.
/// 2. For an Append, drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// 4. A non-append command found while draining runs right after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
            }
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
            #[cfg(test)]
            WalCommand::Shutdown => break,
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} event(s) failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

// ── Settings and collaborators ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Collection window of a hold.
    pub hold_ttl_ms: Ms,
    /// Per-position factor of the advisory wait estimate.
    pub average_hold_ms: Ms,
    pub priority: PriorityConfig,
    /// Queues whose scores are at least this old are re-scored by the sweeper.
    pub refresh_after_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl_ms: DAY_MS,
            average_hold_ms: 7 * DAY_MS,
            priority: PriorityConfig::default(),
            refresh_after_ms: 3_600_000,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(&self.hold_ttl_ms) {
            return Err("hold TTL out of range");
        }
        if self.average_hold_ms <= 0 {
            return Err("average hold duration must be positive");
        }
        if self.refresh_after_ms <= 0 {
            return Err("priority refresh age must be positive");
        }
        self.priority.validate()
    }
}

/// The external systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn Catalog>,
    pub standing: Arc<dyn StandingProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (entry/hold) id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) standing: Arc<dyn StandingProvider>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    pub(super) model: PriorityModel,
    /// Mutations hold it shared from before their resource lock until the
    /// event is applied; compaction holds it exclusively while snapshotting.
    pub(super) commit_gate: RwLock<()>,
    pub(super) me: Weak<Engine>,
}

/// Apply an event directly to a ResourceState. The caller holds the lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::EntryJoined {
            id,
            resource_id,
            requester_id,
            joined_at,
            attributes,
        } => {
            rs.queue.insert(WaitlistEntry::new(
                *id,
                *requester_id,
                *resource_id,
                *joined_at,
                *attributes,
            ));
            rs.last_joined_at = rs.last_joined_at.max(*joined_at);
            entity_map.insert(*id, *resource_id);
        }
        Event::EntryLeft { id, .. } => {
            rs.queue.deactivate(*id);
            entity_map.remove(id);
        }
        Event::HoldOpened {
            id,
            resource_id,
            requester_id,
            entry_id,
            reserved_at,
            expires_at,
        } => {
            // Live allocation already popped the entry; replay has not.
            rs.queue.deactivate(*entry_id);
            entity_map.remove(entry_id);
            rs.ledger.open(*id, *resource_id, *requester_id, *entry_id, *reserved_at, *expires_at);
            entity_map.insert(*id, *resource_id);
        }
        Event::HoldExpired { id, at, .. } => {
            rs.ledger.close(*id, HoldStatus::Expired, *at, None);
        }
        Event::HoldCancelled { id, at, reason, .. } => {
            rs.ledger.close(*id, HoldStatus::Cancelled, *at, Some(*reason));
        }
        Event::HoldConverted { id, at, .. } => {
            rs.ledger.close(*id, HoldStatus::Converted, *at, None);
        }
        Event::HoldNotified { id, .. } => {
            rs.ledger.mark_notified(*id);
        }
        Event::ResourceRetired { at, .. } => {
            let active: Vec<Ulid> = rs.ledger.active().iter().map(|h| h.id).collect();
            for id in active {
                rs.ledger.close(id, HoldStatus::Cancelled, *at, Some(CancelReason::Administrative));
            }
            for entry in rs.queue.clear() {
                entity_map.remove(&entry.id);
            }
            for hold in rs.ledger.history() {
                entity_map.remove(&hold.id);
            }
            rs.retired = true;
        }
    }
    for id in rs.ledger.drain_evicted() {
        entity_map.remove(&id);
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        settings: EngineSettings,
        collaborators: Collaborators,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Arc<Self>> {
        settings
            .validate()
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        // Replay into plain states first; nothing else can see them yet.
        let entity_to_resource = DashMap::new();
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            let id = event.resource_id();
            let rs = resources.entry(id).or_insert_with(|| ResourceState::new(id));
            apply_to_resource(rs, event, &entity_to_resource);
            if rs.retired {
                resources.remove(&id);
            }
        }

        let model = PriorityModel::new(settings.priority);
        let now = collaborators.clock.now();
        let scoring = Scoring {
            model: &model,
            standing: collaborators.standing.as_ref(),
            average_hold_ms: settings.average_hold_ms,
        };
        let state = DashMap::new();
        for (id, mut rs) in resources {
            rs.queue.renumber(&scoring, now);
            state.insert(id, Arc::new(RwLock::new(rs)));
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(state.len() as f64);
        info!("replayed {} events into {} resources", events.len(), state.len());

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let Collaborators {
            catalog,
            standing,
            notifier,
            clock,
        } = collaborators;
        Ok(Arc::new_cyclic(|me| Self {
            state,
            wal_tx,
            notify,
            entity_to_resource,
            catalog,
            standing,
            notifier,
            clock,
            settings,
            model,
            commit_gate: RwLock::new(()),
            me: me.clone(),
        }))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub(super) fn scoring(&self) -> Scoring<'_> {
        Scoring {
            model: &self.model,
            standing: self.standing.as_ref(),
            average_hold_ms: self.settings.average_hold_ms,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn get_or_create_resource(&self, id: Ulid) -> Result<SharedResourceState, EngineError> {
        if let Some(rs) = self.get_resource(&id) {
            return Ok(rs);
        }
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let rs = self
            .state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .value()
            .clone();
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(rs)
    }

    /// Apply an already-durable event and publish it.
    pub(super) fn apply_committed(&self, rs: &mut ResourceState, event: &Event) {
        apply_to_resource(rs, event, &self.entity_to_resource);
        if event.reorders_queue() {
            rs.queue.renumber(&self.scoring(), self.now());
        }
        self.notify.send(rs.id, event);
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_committed(rs, event);
        Ok(())
    }

    /// Lookup entity → resource, get resource, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(*entity_id));
        }
        Ok((resource_id, guard))
    }
}
