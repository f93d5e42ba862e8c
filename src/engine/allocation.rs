use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::catalog::CatalogError;
use crate::model::*;
use crate::notify::{HoldNotice, NoticeKind};
use crate::observability::{
    ALLOCATION_FAILURES_TOTAL, HOLDS_CLOSED_TOTAL, HOLDS_OPENED_TOTAL,
    NOTIFICATIONS_FAILED_TOTAL, SWEEP_DURATION_SECONDS,
};

use super::{Engine, EngineError};

/// What one `sweep_expired` pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<ReservationHold>,
    /// Holds opened for the units the expiries freed.
    pub reallocated: Vec<ReservationHold>,
    /// Due holds another caller closed first.
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.reallocated.is_empty() && self.skipped == 0 && self.failed == 0
    }
}

pub(super) struct AllocationOutcome {
    pub opened: Vec<ReservationHold>,
    /// Set when allocation stopped early; everything in `opened` is committed.
    pub failure: Option<EngineError>,
}

/// A terminal transition that hands the unit back to the pool.
#[derive(Debug, Clone, Copy)]
pub(super) enum Closing {
    Expire,
    Cancel(CancelReason),
}

pub(super) type Notices = Vec<(Ulid, HoldNotice)>;

impl Engine {
    /// Offer every available unit to the head of the waitlist.
    ///
    /// Bounded by the queue length at entry. Stops at the first failure; the
    /// entry that failed is back in the queue at its prior score.
    pub(super) async fn allocate_locked(&self, rs: &mut ResourceState, now: Ms) -> AllocationOutcome {
        let mut opened = Vec::new();
        for _ in 0..rs.queue.len() {
            match self.catalog.available_units(rs.id) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    return AllocationOutcome {
                        opened,
                        failure: Some(e.into()),
                    };
                }
            }
            match self.open_next_hold(rs, now).await {
                Ok(Some(hold)) => opened.push(hold),
                Ok(None) => break,
                Err(e) => {
                    metrics::counter!(ALLOCATION_FAILURES_TOTAL).increment(1);
                    warn!("allocation on {} rolled back: {e}", rs.id);
                    return AllocationOutcome {
                        opened,
                        failure: Some(e),
                    };
                }
            }
        }
        AllocationOutcome {
            opened,
            failure: None,
        }
    }

    /// pop_highest → catalog decrement → WAL HoldOpened → ledger insert.
    /// Any failure restores the entry and compensates the catalog.
    async fn open_next_hold(
        &self,
        rs: &mut ResourceState,
        now: Ms,
    ) -> Result<Option<ReservationHold>, EngineError> {
        let average_hold_ms = self.settings.average_hold_ms;
        let Some(entry) = rs.queue.pop_highest(&self.scoring(), now) else {
            return Ok(None);
        };
        if let Err(e) = self.catalog.decrement_available(rs.id) {
            rs.queue.restore(entry, average_hold_ms);
            return Err(e.into());
        }

        let hold_id = Ulid::new();
        let event = Event::HoldOpened {
            id: hold_id,
            resource_id: rs.id,
            requester_id: entry.requester_id,
            entry_id: entry.id,
            reserved_at: now,
            expires_at: now.saturating_add(self.settings.hold_ttl_ms),
        };
        if let Err(e) = self.wal_append(&event).await {
            if let Err(ce) = self.catalog.increment_available(rs.id) {
                tracing::error!("unit of {} lost: compensating increment failed: {ce}", rs.id);
            }
            rs.queue.restore(entry, average_hold_ms);
            return Err(e);
        }
        self.apply_committed(rs, &event);
        metrics::counter!(HOLDS_OPENED_TOTAL).increment(1);
        info!(
            "hold {hold_id} opened for {} on {} (score {})",
            entry.requester_id, rs.id, entry.priority_score
        );
        rs.ledger
            .get(hold_id)
            .cloned()
            .map(Some)
            .ok_or(EngineError::NotFound(hold_id))
    }

    /// Close an active hold and return its unit to the catalog.
    ///
    /// A catalog that already counts every unit as available is taken to
    /// have the unit back; the hold still closes.
    pub(super) async fn close_and_release_locked(
        &self,
        rs: &mut ResourceState,
        hold_id: Ulid,
        closing: Closing,
        now: Ms,
    ) -> Result<ReservationHold, EngineError> {
        let (to, event) = match closing {
            Closing::Expire => (
                HoldStatus::Expired,
                Event::HoldExpired { id: hold_id, resource_id: rs.id, at: now },
            ),
            Closing::Cancel(reason) => (
                HoldStatus::Cancelled,
                Event::HoldCancelled { id: hold_id, resource_id: rs.id, at: now, reason },
            ),
        };
        rs.ledger.check_transition(hold_id, to, now)?;

        let incremented = match self.catalog.increment_available(rs.id) {
            Ok(_) => true,
            Err(CatalogError::Overflow(_)) => {
                warn!("catalog already has every unit of {} available; closing hold {hold_id} anyway", rs.id);
                false
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = self.persist_and_apply(rs, &event).await {
            if incremented && let Err(ce) = self.catalog.decrement_available(rs.id) {
                tracing::error!("catalog for {} over-counts by one: compensating decrement failed: {ce}", rs.id);
            }
            return Err(e);
        }
        metrics::counter!(HOLDS_CLOSED_TOTAL, "status" => to.as_str()).increment(1);
        rs.ledger
            .get(hold_id)
            .cloned()
            .ok_or(EngineError::NotFound(hold_id))
    }

    /// Offer freshly available units of a resource to its waitlist.
    pub async fn on_unit_released(&self, resource_id: Ulid) -> Result<Vec<ReservationHold>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(rs) = self.get_resource(&resource_id) else {
            self.catalog.available_units(resource_id)?;
            return Ok(Vec::new());
        };
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        let now = self.now();
        let outcome = self.allocate_locked(&mut guard, now).await;
        drop(guard);
        drop(_gate);
        self.finish_allocation(resource_id, outcome)
    }

    /// A unit came back (return of a borrowed copy): put it in the pool and
    /// allocate, in one critical section.
    pub async fn release_unit(&self, resource_id: Ulid) -> Result<Vec<ReservationHold>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self.get_or_create_resource(resource_id)?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        self.catalog.increment_available(resource_id)?;
        let now = self.now();
        let outcome = self.allocate_locked(&mut guard, now).await;
        drop(guard);
        drop(_gate);
        self.finish_allocation(resource_id, outcome)
    }

    fn finish_allocation(
        &self,
        resource_id: Ulid,
        outcome: AllocationOutcome,
    ) -> Result<Vec<ReservationHold>, EngineError> {
        self.dispatch_notices(ready_notices(&outcome.opened));
        match outcome.failure {
            Some(e) if outcome.opened.is_empty() => Err(e),
            Some(e) => {
                warn!("allocation on {resource_id} stopped after {} hold(s): {e}", outcome.opened.len());
                Ok(outcome.opened)
            }
            None => Ok(outcome.opened),
        }
    }

    /// Expire every due hold and hand each freed unit to the next waiter.
    ///
    /// Also re-offers units left available to a non-empty waitlist by an
    /// earlier failed allocation. Holds opened here are stamped with `now`,
    /// so they are never due in the same pass. A failure on one hold is
    /// logged and counted; the rest of the sweep goes on.
    pub async fn sweep_expired(&self, now: Ms) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for rs in resources {
            let _gate = self.commit_gate.read().await;
            let mut guard = rs.write().await;
            if guard.retired {
                continue;
            }
            let stranded = self.has_stranded_units(&guard);
            if !stranded && guard.ledger.find_due(now).is_empty() {
                continue;
            }
            let mut notices = Notices::new();
            if stranded {
                self.reoffer_locked(&mut guard, now, &mut report, &mut notices).await;
            }
            self.sweep_resource_locked(&mut guard, now, &mut report, &mut notices).await;
            drop(guard);
            drop(_gate);
            self.dispatch_notices(notices);
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        if !report.is_empty() {
            info!(
                "sweep: {} expired, {} reallocated, {} skipped, {} failed",
                report.expired.len(),
                report.reallocated.len(),
                report.skipped,
                report.failed
            );
        }
        report
    }

    /// Available units with waiters still queued: an earlier allocation
    /// stopped on a failure.
    fn has_stranded_units(&self, rs: &ResourceState) -> bool {
        !rs.queue.is_empty() && matches!(self.catalog.available_units(rs.id), Ok(n) if n > 0)
    }

    async fn reoffer_locked(
        &self,
        rs: &mut ResourceState,
        now: Ms,
        report: &mut SweepReport,
        notices: &mut Notices,
    ) {
        let outcome = self.allocate_locked(rs, now).await;
        if !outcome.opened.is_empty() {
            info!("re-offered {} stranded unit(s) of {}", outcome.opened.len(), rs.id);
        }
        for hold in outcome.opened {
            notices.push((hold.requester_id, HoldNotice::ready(hold.clone())));
            report.reallocated.push(hold);
        }
        if let Some(e) = outcome.failure {
            warn!("sweep: re-offering units of {} failed: {e}", rs.id);
            report.failed += 1;
        }
    }

    /// Work-list over one resource's due holds. Each hold is attempted at
    /// most once per pass.
    async fn sweep_resource_locked(
        &self,
        rs: &mut ResourceState,
        now: Ms,
        report: &mut SweepReport,
        notices: &mut Notices,
    ) {
        let mut work: VecDeque<Ulid> = rs.ledger.find_due(now).into();
        let mut attempted: HashSet<Ulid> = HashSet::new();
        let bound = work.len() + rs.queue.len() + 1;

        for _ in 0..bound {
            let Some(hold_id) = work.pop_front() else { break };
            if !attempted.insert(hold_id) {
                continue;
            }
            match self.close_and_release_locked(rs, hold_id, Closing::Expire, now).await {
                Ok(hold) => {
                    notices.push((hold.requester_id, HoldNotice::expired(hold.clone())));
                    report.expired.push(hold);
                }
                Err(EngineError::InvalidTransition { .. }) | Err(EngineError::NotFound(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("sweep: expiring hold {hold_id} on {} failed: {e}", rs.id);
                    report.failed += 1;
                    continue;
                }
            }

            let outcome = self.allocate_locked(rs, now).await;
            for hold in outcome.opened {
                notices.push((hold.requester_id, HoldNotice::ready(hold.clone())));
                report.reallocated.push(hold);
            }
            if outcome.failure.is_some() {
                report.failed += 1;
            }
            for id in rs.ledger.find_due(now) {
                if !attempted.contains(&id) && !work.contains(&id) {
                    work.push_back(id);
                }
            }
        }
    }

    /// Deliver notices after the resource lock is gone. Best effort: a
    /// failure is logged and counted and never undoes the allocation.
    pub(super) fn dispatch_notices(&self, notices: Notices) {
        if notices.is_empty() {
            return;
        }
        let Some(engine) = self.me.upgrade() else { return };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            for (requester_id, notice) in notices {
                match notifier.notify(requester_id, &notice).await {
                    Ok(()) if notice.kind == NoticeKind::HoldReady => {
                        if let Err(e) = engine.mark_notified(notice.hold.id).await {
                            debug!("could not record notice for hold {}: {e}", notice.hold.id);
                        }
                    }
                    Ok(()) => {}
                    Err(e) => {
                        metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
                        warn!("notice for hold {} to {requester_id} failed: {e}", notice.hold.id);
                    }
                }
            }
        });
    }
}

pub(super) fn ready_notices(holds: &[ReservationHold]) -> Notices {
    holds
        .iter()
        .map(|h| (h.requester_id, HoldNotice::ready(h.clone())))
        .collect()
}
