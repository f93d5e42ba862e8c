use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::{Ms, RequesterAttributes};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StandingError {
    #[error("unknown requester: {0}")]
    UnknownRequester(Ulid),
    #[error("standing provider unavailable: {0}")]
    Unavailable(String),
}

/// Membership tier, urgency and late-return history per requester.
pub trait StandingProvider: Send + Sync {
    fn attributes(&self, requester_id: Ulid) -> Result<RequesterAttributes, StandingError>;
}

#[derive(Debug, Default)]
pub struct MemoryStanding {
    requesters: DashMap<Ulid, RequesterAttributes>,
}

impl MemoryStanding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, requester_id: Ulid, attributes: RequesterAttributes) {
        self.requesters.insert(requester_id, attributes);
    }

    pub fn remove(&self, requester_id: Ulid) -> Option<RequesterAttributes> {
        self.requesters.remove(&requester_id).map(|(_, a)| a)
    }
}

impl StandingProvider for MemoryStanding {
    fn attributes(&self, requester_id: Ulid) -> Result<RequesterAttributes, StandingError> {
        self.requesters
            .get(&requester_id)
            .map(|a| *a)
            .ok_or(StandingError::UnknownRequester(requester_id))
    }
}

/// Read-through cache in front of a slower provider.
///
/// An entry older than `max_age_ms` is never served; the next lookup goes
/// back to the inner provider.
pub struct CachedStanding<P> {
    inner: P,
    clock: Arc<dyn Clock>,
    max_age_ms: Ms,
    cache: DashMap<Ulid, (RequesterAttributes, Ms)>,
}

impl<P: StandingProvider> CachedStanding<P> {
    pub fn new(inner: P, clock: Arc<dyn Clock>, max_age_ms: Ms) -> Self {
        Self {
            inner,
            clock,
            max_age_ms,
            cache: DashMap::new(),
        }
    }

    pub fn invalidate(&self, requester_id: Ulid) {
        self.cache.remove(&requester_id);
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: StandingProvider> StandingProvider for CachedStanding<P> {
    fn attributes(&self, requester_id: Ulid) -> Result<RequesterAttributes, StandingError> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.get(&requester_id) {
            let (attributes, fetched_at) = *cached;
            if now.saturating_sub(fetched_at) <= self.max_age_ms {
                return Ok(attributes);
            }
        }
        match self.inner.attributes(requester_id) {
            Ok(attributes) => {
                self.cache.insert(requester_id, (attributes, now));
                Ok(attributes)
            }
            Err(e) => {
                self.cache.remove(&requester_id);
                Err(e)
            }
        }
    }
}

impl<P: StandingProvider + ?Sized> StandingProvider for Arc<P> {
    fn attributes(&self, requester_id: Ulid) -> Result<RequesterAttributes, StandingError> {
        (**self).attributes(requester_id)
    }
}
