use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The requester's active entry on a resource, with its current position.
    /// `Ok(None)` when they are not waiting.
    pub async fn waitlist_position(
        &self,
        requester_id: Ulid,
        resource_id: Ulid,
    ) -> Result<Option<WaitlistEntry>, EngineError> {
        let Some(rs) = self.get_resource(&resource_id) else {
            self.catalog.available_units(resource_id)?;
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok(guard.queue.active_for(requester_id).cloned())
    }

    /// Active entries of a resource by ascending position.
    pub async fn resource_waitlist(&self, resource_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        let Some(rs) = self.get_resource(&resource_id) else {
            self.catalog.available_units(resource_id)?;
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard.queue.entries().to_vec())
    }

    /// Every active entry of a requester, across resources.
    pub async fn requester_waitlist(&self, requester_id: Ulid) -> Vec<WaitlistEntry> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            if let Some(entry) = guard.queue.active_for(requester_id) {
                out.push(entry.clone());
            }
        }
        out.sort_by_key(|e| e.joined_at);
        out
    }

    pub async fn hold(&self, hold_id: Ulid) -> Result<ReservationHold, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&hold_id)
            .ok_or(EngineError::NotFound(hold_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(hold_id))?;
        let guard = rs.read().await;
        guard
            .ledger
            .get(hold_id)
            .cloned()
            .ok_or(EngineError::NotFound(hold_id))
    }

    /// Holds of a resource: active ones first, then retained history
    /// (oldest first) when `include_closed`.
    pub async fn resource_holds(
        &self,
        resource_id: Ulid,
        include_closed: bool,
    ) -> Result<Vec<ReservationHold>, EngineError> {
        let Some(rs) = self.get_resource(&resource_id) else {
            self.catalog.available_units(resource_id)?;
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let mut out = guard.ledger.active().to_vec();
        if include_closed {
            out.extend(guard.ledger.history().cloned());
        }
        Ok(out)
    }

    /// Active and retained holds of a requester, newest first.
    pub async fn requester_holds(&self, requester_id: Ulid) -> Vec<ReservationHold> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(
                guard
                    .ledger
                    .active()
                    .iter()
                    .chain(guard.ledger.history())
                    .filter(|h| h.requester_id == requester_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at));
        out
    }

    /// Active holds past their TTL at `now`. Complete: waits for every lock.
    pub async fn due_holds(&self, now: Ms) -> Vec<ReservationHold> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(guard.ledger.active().iter().filter(|h| h.is_due(now)).cloned());
        }
        out
    }

    pub async fn resource_summaries(&self) -> Vec<ResourceSummary> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            out.push(ResourceSummary {
                id: guard.id,
                waitlist_len: guard.queue.len(),
                active_holds: guard.ledger.active_count(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
