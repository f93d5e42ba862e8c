use std::collections::VecDeque;

use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_HOLD_HISTORY_PER_RESOURCE;
use crate::model::{CancelReason, HoldStatus, Ms, ReservationHold};

/// Holds of one resource: the active set plus a bounded terminal history.
#[derive(Debug, Clone, Default)]
pub struct ReservationLedger {
    active: Vec<ReservationHold>,
    history: VecDeque<ReservationHold>,
    /// Ids pushed out of `history`, waiting to be unmapped by the engine.
    evicted: Vec<Ulid>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        id: Ulid,
        resource_id: Ulid,
        requester_id: Ulid,
        entry_id: Ulid,
        reserved_at: Ms,
        expires_at: Ms,
    ) -> ReservationHold {
        let hold = ReservationHold {
            id,
            resource_id,
            requester_id,
            entry_id,
            reserved_at,
            expires_at,
            status: HoldStatus::Active,
            notification_sent: false,
            collected_at: None,
            closed_at: None,
            cancel_reason: None,
        };
        self.active.push(hold.clone());
        hold
    }

    pub fn active(&self) -> &[ReservationHold] {
        &self.active
    }

    pub fn history(&self) -> impl Iterator<Item = &ReservationHold> {
        self.history.iter()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, id: Ulid) -> Option<&ReservationHold> {
        self.active
            .iter()
            .find(|h| h.id == id)
            .or_else(|| self.history.iter().find(|h| h.id == id))
    }

    pub fn active_for(&self, requester_id: Ulid) -> Option<&ReservationHold> {
        self.active.iter().find(|h| h.requester_id == requester_id)
    }

    /// Every active hold past its TTL at `now`.
    pub fn find_due(&self, now: Ms) -> Vec<Ulid> {
        self.active.iter().filter(|h| h.is_due(now)).map(|h| h.id).collect()
    }

    /// Validate an `Active → to` transition without applying it.
    pub fn check_transition(
        &self,
        id: Ulid,
        to: HoldStatus,
        now: Ms,
    ) -> Result<&ReservationHold, EngineError> {
        let hold = self.get(id).ok_or(EngineError::NotFound(id))?;
        let invalid = || EngineError::InvalidTransition {
            hold: id,
            from: hold.status,
            to,
        };
        if hold.status != HoldStatus::Active {
            return Err(invalid());
        }
        let allowed = match to {
            HoldStatus::Active => false,
            HoldStatus::Expired => now > hold.expires_at,
            HoldStatus::Cancelled => true,
            HoldStatus::Converted => now <= hold.expires_at,
        };
        if !allowed {
            return Err(invalid());
        }
        Ok(hold)
    }

    /// Move an active hold into history. Unchecked: callers validate with
    /// `check_transition` before the event is committed.
    pub fn close(
        &mut self,
        id: Ulid,
        status: HoldStatus,
        at: Ms,
        reason: Option<CancelReason>,
    ) -> Option<ReservationHold> {
        let idx = self.active.iter().position(|h| h.id == id)?;
        let mut hold = self.active.remove(idx);
        hold.status = status;
        hold.closed_at = Some(at);
        if status == HoldStatus::Converted {
            hold.collected_at = Some(at);
        }
        if status == HoldStatus::Cancelled {
            hold.cancel_reason = reason;
        }
        self.history.push_back(hold.clone());
        while self.history.len() > MAX_HOLD_HISTORY_PER_RESOURCE {
            if let Some(old) = self.history.pop_front() {
                self.evicted.push(old.id);
            }
        }
        Some(hold)
    }

    pub fn expire(&mut self, id: Ulid, now: Ms) -> Result<ReservationHold, EngineError> {
        self.check_transition(id, HoldStatus::Expired, now)?;
        self.close(id, HoldStatus::Expired, now, None)
            .ok_or(EngineError::NotFound(id))
    }

    pub fn cancel(
        &mut self,
        id: Ulid,
        now: Ms,
        reason: CancelReason,
    ) -> Result<ReservationHold, EngineError> {
        self.check_transition(id, HoldStatus::Cancelled, now)?;
        self.close(id, HoldStatus::Cancelled, now, Some(reason))
            .ok_or(EngineError::NotFound(id))
    }

    pub fn convert(&mut self, id: Ulid, now: Ms) -> Result<ReservationHold, EngineError> {
        self.check_transition(id, HoldStatus::Converted, now)?;
        self.close(id, HoldStatus::Converted, now, None)
            .ok_or(EngineError::NotFound(id))
    }

    /// Record delivery of the collection notice. Allowed on terminal holds.
    pub fn mark_notified(&mut self, id: Ulid) -> bool {
        let hold = self
            .active
            .iter_mut()
            .chain(self.history.iter_mut())
            .find(|h| h.id == id);
        match hold {
            Some(h) => {
                h.notification_sent = true;
                true
            }
            None => false,
        }
    }

    pub fn drain_evicted(&mut self) -> Vec<Ulid> {
        std::mem::take(&mut self.evicted)
    }
}
