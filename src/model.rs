use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::ReservationLedger;
use crate::waitlist::WaitlistQueue;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Fixed-point decimal with two fractional digits, stored as hundredths.
///
/// Priority arithmetic stays exact, so two entries compare equal only when
/// their scores really are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Score(i64);

impl Score {
    pub const ZERO: Score = Score(0);
    pub const ONE: Score = Score(100);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(100))
    }

    /// Fixed-point product, truncated toward zero.
    pub fn scale(self, other: Score) -> Score {
        let product = (self.0 as i128 * other.0 as i128) / 100;
        Score(product.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    pub fn times(self, n: i64) -> Score {
        Score(self.0.saturating_mul(n))
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add for Score {
    type Output = Score;
    fn add(self, rhs: Score) -> Score {
        Score(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Score {
    type Output = Score;
    fn sub(self, rhs: Score) -> Score {
        Score(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Score {
    type Output = Score;
    fn neg(self) -> Score {
        Score(self.0.saturating_neg())
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid score {0:?}: expected a decimal with at most two fractional digits")]
pub struct ParseScoreError(String);

impl FromStr for Score {
    type Err = ParseScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseScoreError(s.to_string());
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if frac_part.len() > 2 || !digits(int_part) || !digits(frac_part) {
            return Err(err());
        }
        let int: i64 = if int_part.is_empty() { 0 } else { int_part.parse().map_err(|_| err())? };
        let mut frac: i64 = if frac_part.is_empty() { 0 } else { frac_part.parse().map_err(|_| err())? };
        if frac_part.len() == 1 {
            frac *= 10;
        }
        let hundredths = int
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(err)?;
        Ok(Score(if negative { -hundredths } else { hundredths }))
    }
}

// ── Requester standing ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipTier {
    #[default]
    Standard,
    Premium,
}

/// What the priority model needs to know about a requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterAttributes {
    pub membership_tier: MembershipTier,
    pub urgency_flag: bool,
    /// Overdue returns inside the directory's lookback window.
    pub late_incident_count: u32,
}

// ── Waitlist entries ─────────────────────────────────────────────

/// One (requester, resource) pair waiting for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub resource_id: Ulid,
    pub joined_at: Ms,
    pub priority_score: Score,
    /// 1-based, dense among active entries of the resource.
    pub queue_position: u32,
    /// Advisory: position × average hold duration.
    pub estimated_wait_ms: Ms,
    pub is_active: bool,
    pub waiting_days: u32,
    pub waiting_time_score: Score,
    pub urgency_bonus: Score,
    pub late_penalty: Score,
    pub membership_bonus: Score,
    pub last_recomputed_at: Ms,
    /// Last attributes seen from the standing provider.
    pub attributes: RequesterAttributes,
}

impl WaitlistEntry {
    pub fn new(
        id: Ulid,
        requester_id: Ulid,
        resource_id: Ulid,
        joined_at: Ms,
        attributes: RequesterAttributes,
    ) -> Self {
        Self {
            id,
            requester_id,
            resource_id,
            joined_at,
            priority_score: Score::ZERO,
            queue_position: 0,
            estimated_wait_ms: 0,
            is_active: true,
            waiting_days: 0,
            waiting_time_score: Score::ZERO,
            urgency_bonus: Score::ZERO,
            late_penalty: Score::ZERO,
            membership_bonus: Score::ZERO,
            last_recomputed_at: joined_at,
            attributes,
        }
    }

    /// Human-readable explanation of the score components.
    pub fn priority_reason(&self) -> String {
        let mut parts = Vec::new();
        if self.urgency_bonus.is_positive() {
            parts.push(format!("Course urgency bonus (+{})", self.urgency_bonus));
        }
        if self.waiting_days > 0 {
            parts.push(format!(
                "Waiting {} days (+{})",
                self.waiting_days, self.waiting_time_score
            ));
        }
        if self.membership_bonus.is_positive() {
            parts.push(format!("Premium member (+{})", self.membership_bonus));
        }
        if self.late_penalty.is_negative() {
            parts.push(format!("Late return penalty ({})", self.late_penalty));
        }
        if parts.is_empty() {
            "Standard priority".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Advisory availability estimate.
    pub fn estimated_available_at(&self, now: Ms) -> Ms {
        now.saturating_add(self.estimated_wait_ms)
    }
}

// ── Reservation holds ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldStatus {
    Active,
    Expired,
    Cancelled,
    Converted,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HoldStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Expired => "expired",
            HoldStatus::Cancelled => "cancelled",
            HoldStatus::Converted => "converted",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The requester declined the unit.
    Requester,
    /// Librarian override, or removal of the resource or requester.
    Administrative,
}

/// A temporary exclusive claim on one unit of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHold {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    /// The waitlist entry this hold was allocated from.
    pub entry_id: Ulid,
    pub reserved_at: Ms,
    pub expires_at: Ms,
    pub status: HoldStatus,
    pub notification_sent: bool,
    pub collected_at: Option<Ms>,
    pub closed_at: Option<Ms>,
    pub cancel_reason: Option<CancelReason>,
}

impl ReservationHold {
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    /// Active and past its TTL.
    pub fn is_due(&self, now: Ms) -> bool {
        self.is_active() && self.expires_at < now
    }

    pub fn remaining_ms(&self, now: Ms) -> Ms {
        (self.expires_at - now).max(0)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EntryJoined {
        id: Ulid,
        resource_id: Ulid,
        requester_id: Ulid,
        joined_at: Ms,
        attributes: RequesterAttributes,
    },
    EntryLeft {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Deactivates `entry_id` and opens the hold in one record.
    HoldOpened {
        id: Ulid,
        resource_id: Ulid,
        requester_id: Ulid,
        entry_id: Ulid,
        reserved_at: Ms,
        expires_at: Ms,
    },
    HoldExpired {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    HoldCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        reason: CancelReason,
    },
    HoldConverted {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    HoldNotified {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Cancels every active hold, drops every entry, forgets the resource.
    ResourceRetired {
        id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::EntryJoined { resource_id, .. }
            | Event::EntryLeft { resource_id, .. }
            | Event::HoldOpened { resource_id, .. }
            | Event::HoldExpired { resource_id, .. }
            | Event::HoldCancelled { resource_id, .. }
            | Event::HoldConverted { resource_id, .. }
            | Event::HoldNotified { resource_id, .. } => *resource_id,
            Event::ResourceRetired { id, .. } => *id,
        }
    }

    /// Whether applying the event changes waitlist membership in a way that
    /// needs renumbering. `HoldOpened` is excluded: its entry was already
    /// popped (and the queue renumbered) before the record was written.
    pub fn reorders_queue(&self) -> bool {
        matches!(self, Event::EntryJoined { .. } | Event::EntryLeft { .. })
    }
}

// ── Per-resource aggregate ───────────────────────────────────────

/// Everything the engine tracks for one resource. Guarded by a single lock.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub queue: WaitlistQueue,
    pub ledger: ReservationLedger,
    /// Latest join stamp handed out; join stamps are strictly increasing.
    pub last_joined_at: Ms,
    /// Set once the resource has been retired; the state is about to be dropped.
    pub retired: bool,
}

impl ResourceState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            queue: WaitlistQueue::new(),
            ledger: ReservationLedger::new(),
            last_joined_at: Ms::MIN,
            retired: false,
        }
    }

    /// Join stamp for a join at `now`: never equal to an earlier stamp.
    pub fn next_join_stamp(&self, now: Ms) -> Ms {
        now.max(self.last_joined_at.saturating_add(1))
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    pub id: Ulid,
    pub waitlist_len: usize,
    pub active_holds: usize,
}
