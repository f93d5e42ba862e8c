use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::HoldNotice;
use crate::observability::{rejection_label, JOINS_TOTAL, JOIN_REJECTIONS_TOTAL, LEAVES_TOTAL};

use super::allocation::{ready_notices, Closing, Notices};
use super::{Engine, EngineError, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetireReport {
    pub resource_id: Ulid,
    pub cancelled_holds: Vec<ReservationHold>,
    pub removed_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Resources the requester was waiting for.
    pub left: Vec<Ulid>,
    pub cancelled_holds: Vec<ReservationHold>,
    /// Holds handed to other requesters with the freed units.
    pub reallocated: Vec<ReservationHold>,
}

impl Engine {
    /// Put a requester on a resource's waitlist.
    ///
    /// Only allowed while the resource has no available units.
    pub async fn join_waitlist(
        &self,
        requester_id: Ulid,
        resource_id: Ulid,
    ) -> Result<WaitlistEntry, EngineError> {
        let result = self.try_join(requester_id, resource_id).await;
        match &result {
            Ok(entry) => {
                metrics::counter!(JOINS_TOTAL).increment(1);
                info!(
                    "{requester_id} joined waitlist of {resource_id} at position {}",
                    entry.queue_position
                );
            }
            Err(e) => {
                metrics::counter!(JOIN_REJECTIONS_TOTAL, "reason" => rejection_label(e)).increment(1);
            }
        }
        result
    }

    async fn try_join(&self, requester_id: Ulid, resource_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let attributes = self.standing.attributes(requester_id)?;
        let available = self.catalog.available_units(resource_id)?;
        if available > 0 && self.get_resource(&resource_id).is_none() {
            return Err(EngineError::ResourceAvailable { resource: resource_id, available });
        }

        let _gate = self.commit_gate.read().await;
        let rs = self.get_or_create_resource(resource_id)?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        if guard.queue.active_for(requester_id).is_some() {
            return Err(EngineError::AlreadyQueued { requester: requester_id, resource: resource_id });
        }
        if guard.ledger.active_for(requester_id).is_some() {
            return Err(EngineError::AlreadyHeld { requester: requester_id, resource: resource_id });
        }
        let available = self.catalog.available_units(resource_id)?;
        if available > 0 {
            return Err(EngineError::ResourceAvailable { resource: resource_id, available });
        }
        if guard.queue.len() >= MAX_WAITLIST_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }

        let id = Ulid::new();
        let event = Event::EntryJoined {
            id,
            resource_id,
            requester_id,
            joined_at: guard.next_join_stamp(self.now()),
            attributes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.queue.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Remove a requester from a waitlist. `Ok(false)` when they were not on it.
    pub async fn leave_waitlist(&self, requester_id: Ulid, resource_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(rs) = self.get_resource(&resource_id) else {
            self.catalog.available_units(resource_id)?;
            return Ok(false);
        };
        let mut guard = rs.write().await;
        if guard.retired {
            return Ok(false);
        }
        let Some(entry_id) = guard.queue.active_for(requester_id).map(|e| e.id) else {
            return Ok(false);
        };
        let event = Event::EntryLeft { id: entry_id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(LEAVES_TOTAL).increment(1);
        info!("{requester_id} left waitlist of {resource_id}");
        Ok(true)
    }

    /// Give up a hold before collection; the unit goes to the next waiter.
    pub async fn cancel_hold(
        &self,
        hold_id: Ulid,
        reason: CancelReason,
    ) -> Result<ReservationHold, EngineError> {
        let gate = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let now = self.now();
        let closed = self
            .close_and_release_locked(&mut guard, hold_id, Closing::Cancel(reason), now)
            .await?;
        let outcome = self.allocate_locked(&mut guard, now).await;
        drop(guard);
        drop(gate);

        if let Some(e) = &outcome.failure {
            warn!("reallocation after cancelling {hold_id} on {resource_id} stopped: {e}");
        }
        let mut notices = ready_notices(&outcome.opened);
        if reason == CancelReason::Administrative {
            notices.push((closed.requester_id, HoldNotice::cancelled(closed.clone())));
        }
        self.dispatch_notices(notices);
        info!("hold {hold_id} cancelled ({reason:?})");
        Ok(closed)
    }

    /// The requester collected the unit. It leaves the pool for the borrow,
    /// so the catalog is not touched.
    pub async fn convert_hold(&self, hold_id: Ulid) -> Result<ReservationHold, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let now = self.now();
        guard.ledger.check_transition(hold_id, HoldStatus::Converted, now)?;
        let event = Event::HoldConverted { id: hold_id, resource_id, at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::HOLDS_CLOSED_TOTAL, "status" => HoldStatus::Converted.as_str())
            .increment(1);
        info!("hold {hold_id} converted to a borrow");
        guard.ledger.get(hold_id).cloned().ok_or(EngineError::NotFound(hold_id))
    }

    /// Record that the collection notice for a hold went out.
    /// `Ok(false)` if it was already recorded.
    pub async fn mark_notified(&self, hold_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let already = guard
            .ledger
            .get(hold_id)
            .map(|h| h.notification_sent)
            .ok_or(EngineError::NotFound(hold_id))?;
        if already {
            return Ok(false);
        }
        let event = Event::HoldNotified { id: hold_id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Take a resource out of circulation: cancel its active holds, drop its
    /// waitlist and forget it. Units of cancelled holds go back to the
    /// catalog on a best-effort basis.
    pub async fn retire_resource(&self, resource_id: Ulid) -> Result<RetireReport, EngineError> {
        let gate = self.commit_gate.read().await;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        let active: Vec<Ulid> = guard.ledger.active().iter().map(|h| h.id).collect();
        let removed_entries = guard.queue.len();

        let event = Event::ResourceRetired { id: resource_id, at: self.now() };
        self.persist_and_apply(&mut guard, &event).await?;

        let cancelled_holds: Vec<ReservationHold> = active
            .iter()
            .filter_map(|id| guard.ledger.get(*id).cloned())
            .collect();
        for _ in &cancelled_holds {
            if let Err(e) = self.catalog.increment_available(resource_id) {
                warn!("returning a unit of retired resource {resource_id} failed: {e}");
            }
        }
        self.state.remove(&resource_id);
        self.notify.remove(&resource_id);
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        drop(guard);
        drop(gate);

        let notices: Notices = cancelled_holds
            .iter()
            .map(|h| (h.requester_id, HoldNotice::cancelled(h.clone())))
            .collect();
        self.dispatch_notices(notices);
        info!(
            "retired {resource_id}: {} hold(s) cancelled, {removed_entries} waiter(s) removed",
            cancelled_holds.len()
        );
        Ok(RetireReport {
            resource_id,
            cancelled_holds,
            removed_entries,
        })
    }

    /// Drop a requester everywhere: leave every waitlist and cancel every
    /// active hold, reallocating the freed units.
    ///
    /// Each resource commits on its own; on error, the resources already
    /// processed stay processed and a retry picks up the rest.
    pub async fn remove_requester(&self, requester_id: Ulid) -> Result<RemovalReport, EngineError> {
        let mut report = RemovalReport::default();
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for rs in resources {
            let gate = self.commit_gate.read().await;
            let mut guard = rs.write().await;
            if guard.retired {
                continue;
            }
            let resource_id = guard.id;
            if let Some(entry_id) = guard.queue.active_for(requester_id).map(|e| e.id) {
                let event = Event::EntryLeft { id: entry_id, resource_id };
                self.persist_and_apply(&mut guard, &event).await?;
                report.left.push(resource_id);
            }
            let Some(hold_id) = guard.ledger.active_for(requester_id).map(|h| h.id) else {
                continue;
            };
            let now = self.now();
            let closed = self
                .close_and_release_locked(
                    &mut guard,
                    hold_id,
                    Closing::Cancel(CancelReason::Administrative),
                    now,
                )
                .await?;
            report.cancelled_holds.push(closed);
            let outcome = self.allocate_locked(&mut guard, now).await;
            drop(guard);
            drop(gate);
            if let Some(e) = &outcome.failure {
                warn!("reallocation on {resource_id} after removing {requester_id} stopped: {e}");
            }
            self.dispatch_notices(ready_notices(&outcome.opened));
            report.reallocated.extend(outcome.opened);
        }

        info!(
            "removed requester {requester_id}: left {} waitlist(s), cancelled {} hold(s)",
            report.left.len(),
            report.cancelled_holds.len()
        );
        Ok(report)
    }

    /// Re-score queues whose scores are older than the configured refresh
    /// age, so waiting-day drift shows up in stored positions. No WAL write:
    /// scores are derived state. Returns the number of queues re-scored.
    pub async fn refresh_priorities(&self, now: Ms) -> usize {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut refreshed = 0;
        for rs in resources {
            let mut guard = rs.write().await;
            if guard.retired || !guard.queue.needs_refresh(now, self.settings.refresh_after_ms) {
                continue;
            }
            guard.queue.renumber(&self.scoring(), now);
            refreshed += 1;
        }
        refreshed
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();

        for rs in resources {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            for hold in guard.ledger.history().chain(guard.ledger.active()) {
                events.push(Event::HoldOpened {
                    id: hold.id,
                    resource_id: hold.resource_id,
                    requester_id: hold.requester_id,
                    entry_id: hold.entry_id,
                    reserved_at: hold.reserved_at,
                    expires_at: hold.expires_at,
                });
                let at = hold.closed_at.unwrap_or(hold.reserved_at);
                match hold.status {
                    HoldStatus::Active => {}
                    HoldStatus::Expired => events.push(Event::HoldExpired {
                        id: hold.id,
                        resource_id: hold.resource_id,
                        at,
                    }),
                    HoldStatus::Cancelled => events.push(Event::HoldCancelled {
                        id: hold.id,
                        resource_id: hold.resource_id,
                        at,
                        reason: hold.cancel_reason.unwrap_or(CancelReason::Administrative),
                    }),
                    HoldStatus::Converted => events.push(Event::HoldConverted {
                        id: hold.id,
                        resource_id: hold.resource_id,
                        at,
                    }),
                }
                if hold.notification_sent {
                    events.push(Event::HoldNotified { id: hold.id, resource_id: hold.resource_id });
                }
            }
            for entry in guard.queue.entries() {
                events.push(Event::EntryJoined {
                    id: entry.id,
                    resource_id: entry.resource_id,
                    requester_id: entry.requester_id,
                    joined_at: entry.joined_at,
                    attributes: entry.attributes,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
