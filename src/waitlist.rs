use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::{Ms, WaitlistEntry};
use crate::priority::PriorityModel;
use crate::standing::StandingProvider;

/// What the queue needs to re-score its entries.
#[derive(Clone, Copy)]
pub struct Scoring<'a> {
    pub model: &'a PriorityModel,
    pub standing: &'a dyn StandingProvider,
    pub average_hold_ms: Ms,
}

/// Strict total order: higher score first, then earlier join, then id.
pub fn priority_order(a: &WaitlistEntry, b: &WaitlistEntry) -> Ordering {
    b.priority_score
        .cmp(&a.priority_score)
        .then(a.joined_at.cmp(&b.joined_at))
        .then(a.id.cmp(&b.id))
}

/// Active waitlist entries of one resource, kept in position order.
///
/// Deactivated entries leave the vector; the engine keeps no tombstones.
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    entries: Vec<WaitlistEntry>,
}

impl WaitlistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries by ascending position.
    pub fn entries(&self) -> &[WaitlistEntry] {
        &self.entries
    }

    pub fn get(&self, entry_id: Ulid) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|e| e.id == entry_id)
    }

    pub fn active_for(&self, requester_id: Ulid) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|e| e.requester_id == requester_id)
    }

    /// Add an entry without ranking it. Callers renumber afterwards.
    pub fn insert(&mut self, mut entry: WaitlistEntry) {
        entry.is_active = true;
        self.entries.push(entry);
    }

    /// Remove an entry from the active set. Positions are stale until the
    /// next `renumber`/`rank`.
    pub fn deactivate(&mut self, entry_id: Ulid) -> Option<WaitlistEntry> {
        let idx = self.entries.iter().position(|e| e.id == entry_id)?;
        let mut entry = self.entries.remove(idx);
        entry.is_active = false;
        Some(entry)
    }

    /// Highest-priority entry by the stored scores.
    pub fn peek_highest(&self) -> Option<&WaitlistEntry> {
        self.entries.iter().min_by(|a, b| priority_order(a, b))
    }

    /// Re-scores at `now`, removes the winner and renumbers the rest.
    pub fn pop_highest(&mut self, scoring: &Scoring<'_>, now: Ms) -> Option<WaitlistEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.renumber(scoring, now);
        let mut entry = self.entries.remove(0);
        entry.is_active = false;
        self.rank(scoring.average_hold_ms);
        Some(entry)
    }

    /// Put a popped entry back at its prior score and join stamp.
    pub fn restore(&mut self, mut entry: WaitlistEntry, average_hold_ms: Ms) {
        entry.is_active = true;
        self.entries.push(entry);
        self.rank(average_hold_ms);
    }

    /// Re-score every entry at `now`, then rank.
    ///
    /// Attributes come from the standing provider; when it fails the entry
    /// keeps the last attributes it was scored with.
    pub fn renumber(&mut self, scoring: &Scoring<'_>, now: Ms) {
        for entry in &mut self.entries {
            match scoring.standing.attributes(entry.requester_id) {
                Ok(attributes) => entry.attributes = attributes,
                Err(e) => tracing::debug!(
                    "standing lookup for {} failed, keeping last known attributes: {e}",
                    entry.requester_id
                ),
            }
            let b = scoring.model.score(entry.joined_at, &entry.attributes, now);
            entry.priority_score = b.total;
            entry.waiting_days = b.waiting_days;
            entry.waiting_time_score = b.waiting_time_score;
            entry.urgency_bonus = b.urgency_bonus;
            entry.late_penalty = b.late_penalty;
            entry.membership_bonus = b.membership_bonus;
            entry.last_recomputed_at = now;
        }
        self.rank(scoring.average_hold_ms);
    }

    /// Sort by the stored scores and assign dense 1-based positions.
    pub fn rank(&mut self, average_hold_ms: Ms) {
        self.entries.sort_by(priority_order);
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            let position = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            entry.queue_position = position;
            entry.estimated_wait_ms = Ms::from(position).saturating_mul(average_hold_ms);
        }
    }

    /// Whether any entry was last scored `max_age_ms` or more before `now`.
    pub fn needs_refresh(&self, now: Ms, max_age_ms: Ms) -> bool {
        self.entries
            .iter()
            .any(|e| now.saturating_sub(e.last_recomputed_at) >= max_age_ms)
    }

    pub fn clear(&mut self) -> Vec<WaitlistEntry> {
        let mut drained: Vec<WaitlistEntry> = self.entries.drain(..).collect();
        for entry in &mut drained {
            entry.is_active = false;
        }
        drained
    }
}
