use crate::model::Ms;

pub const MAX_RESOURCES: usize = 1_000_000;
pub const MAX_WAITLIST_PER_RESOURCE: usize = 10_000;
/// Terminal holds kept per resource before the oldest are evicted.
pub const MAX_HOLD_HISTORY_PER_RESOURCE: usize = 64;
pub const MIN_HOLD_TTL_MS: Ms = 1_000;
pub const MAX_HOLD_TTL_MS: Ms = 30 * 86_400_000;
