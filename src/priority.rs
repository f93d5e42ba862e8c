use serde::{Deserialize, Serialize};

use crate::model::{MembershipTier, Ms, RequesterAttributes, Score};

pub const DAY_MS: Ms = 86_400_000;

/// Weights and factor magnitudes. All weights must be non-negative, which
/// keeps the score monotonic in waiting time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub wait_weight: Score,
    pub urgency_weight: Score,
    pub late_weight: Score,
    pub membership_weight: Score,
    /// Bonus for requesters carrying the urgency flag.
    pub urgency_bonus: Score,
    /// Penalty per overdue-return incident; non-positive.
    pub late_penalty_per_incident: Score,
    /// Incidents beyond this count add no further penalty.
    pub late_incident_cap: u32,
    /// Bonus for the premium membership tier.
    pub membership_bonus: Score,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            wait_weight: Score::ONE,
            urgency_weight: Score::ONE,
            late_weight: Score::ONE,
            membership_weight: Score::ONE,
            urgency_bonus: Score::from_hundredths(750),
            late_penalty_per_incident: Score::from_units(-5),
            late_incident_cap: 5,
            membership_bonus: Score::from_units(8),
        }
    }
}

impl PriorityConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        let weights = [
            self.wait_weight,
            self.urgency_weight,
            self.late_weight,
            self.membership_weight,
        ];
        if weights.iter().any(|w| w.is_negative()) {
            return Err("priority weights must be non-negative");
        }
        if self.late_penalty_per_incident.is_positive() {
            return Err("late penalty per incident must not be positive");
        }
        if self.urgency_bonus.is_negative() || self.membership_bonus.is_negative() {
            return Err("priority bonuses must be non-negative");
        }
        Ok(())
    }
}

/// Weighted contributions of each factor plus their sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityBreakdown {
    pub waiting_days: u32,
    pub waiting_time_score: Score,
    pub urgency_bonus: Score,
    pub late_penalty: Score,
    pub membership_bonus: Score,
    pub total: Score,
}

/// `score = waiting_days * w_wait + urgency * w_urgency + late * w_late + membership * w_member`
///
/// Pure: the same inputs always yield the same breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityModel {
    config: PriorityConfig,
}

impl PriorityModel {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Whole days elapsed since `joined_at`, clamped at zero.
    pub fn waiting_days(joined_at: Ms, now: Ms) -> u32 {
        let elapsed = now.saturating_sub(joined_at).max(0);
        u32::try_from(elapsed / DAY_MS).unwrap_or(u32::MAX)
    }

    pub fn urgency_bonus(&self, attributes: &RequesterAttributes) -> Score {
        if attributes.urgency_flag {
            self.config.urgency_bonus
        } else {
            Score::ZERO
        }
    }

    pub fn late_penalty(&self, attributes: &RequesterAttributes) -> Score {
        let incidents = attributes.late_incident_count.min(self.config.late_incident_cap);
        self.config.late_penalty_per_incident.times(i64::from(incidents))
    }

    pub fn membership_bonus(&self, attributes: &RequesterAttributes) -> Score {
        match attributes.membership_tier {
            MembershipTier::Premium => self.config.membership_bonus,
            MembershipTier::Standard => Score::ZERO,
        }
    }

    pub fn score(&self, joined_at: Ms, attributes: &RequesterAttributes, now: Ms) -> PriorityBreakdown {
        let c = &self.config;
        let waiting_days = Self::waiting_days(joined_at, now);
        let waiting_time_score = Score::from_units(i64::from(waiting_days)).scale(c.wait_weight);
        let urgency_bonus = self.urgency_bonus(attributes).scale(c.urgency_weight);
        let late_penalty = self.late_penalty(attributes).scale(c.late_weight);
        let membership_bonus = self.membership_bonus(attributes).scale(c.membership_weight);
        PriorityBreakdown {
            waiting_days,
            waiting_time_score,
            urgency_bonus,
            late_penalty,
            membership_bonus,
            total: waiting_time_score + urgency_bonus + late_penalty + membership_bonus,
        }
    }
}
