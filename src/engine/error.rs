use ulid::Ulid;

use crate::catalog::CatalogError;
use crate::model::HoldStatus;
use crate::standing::StandingError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("requester {requester} is already waiting for resource {resource}")]
    AlreadyQueued { requester: Ulid, resource: Ulid },
    #[error("requester {requester} already holds a unit of resource {resource}")]
    AlreadyHeld { requester: Ulid, resource: Ulid },
    #[error("resource {resource} has {available} available unit(s); borrow it directly")]
    ResourceAvailable { resource: Ulid, available: u32 },
    #[error("hold {hold} cannot move from {from} to {to}")]
    InvalidTransition {
        hold: Ulid,
        from: HoldStatus,
        to: HoldStatus,
    },
    #[error("catalog: {0}")]
    Catalog(CatalogError),
    #[error("standing: {0}")]
    Standing(StandingError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::UnknownResource(id) => EngineError::NotFound(id),
            other => EngineError::Catalog(other),
        }
    }
}

impl From<StandingError> for EngineError {
    fn from(e: StandingError) -> Self {
        match e {
            StandingError::UnknownRequester(id) => EngineError::NotFound(id),
            other => EngineError::Standing(other),
        }
    }
}
