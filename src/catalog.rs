use dashmap::DashMap;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown resource: {0}")]
    UnknownResource(Ulid),
    #[error("no available units for resource {0}")]
    Exhausted(Ulid),
    #[error("resource {0} already has all of its units available")]
    Overflow(Ulid),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Availability counters owned by the catalog.
///
/// Called synchronously while the engine holds the resource's write lock, so
/// implementations must be quick and must not call back into the engine.
pub trait Catalog: Send + Sync {
    fn available_units(&self, resource_id: Ulid) -> Result<u32, CatalogError>;
    fn decrement_available(&self, resource_id: Ulid) -> Result<u32, CatalogError>;
    fn increment_available(&self, resource_id: Ulid) -> Result<u32, CatalogError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stock {
    pub total: u32,
    pub available: u32,
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    stock: DashMap<Ulid, Stock>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a resource. `available` is clamped to `total`.
    pub fn insert(&self, resource_id: Ulid, total: u32, available: u32) {
        self.stock.insert(
            resource_id,
            Stock {
                total,
                available: available.min(total),
            },
        );
    }

    pub fn remove(&self, resource_id: Ulid) -> Option<Stock> {
        self.stock.remove(&resource_id).map(|(_, s)| s)
    }

    pub fn stock(&self, resource_id: Ulid) -> Option<Stock> {
        self.stock.get(&resource_id).map(|s| *s)
    }
}

impl Catalog for MemoryCatalog {
    fn available_units(&self, resource_id: Ulid) -> Result<u32, CatalogError> {
        self.stock
            .get(&resource_id)
            .map(|s| s.available)
            .ok_or(CatalogError::UnknownResource(resource_id))
    }

    fn decrement_available(&self, resource_id: Ulid) -> Result<u32, CatalogError> {
        let mut stock = self
            .stock
            .get_mut(&resource_id)
            .ok_or(CatalogError::UnknownResource(resource_id))?;
        if stock.available == 0 {
            return Err(CatalogError::Exhausted(resource_id));
        }
        stock.available -= 1;
        Ok(stock.available)
    }

    fn increment_available(&self, resource_id: Ulid) -> Result<u32, CatalogError> {
        let mut stock = self
            .stock
            .get_mut(&resource_id)
            .ok_or(CatalogError::UnknownResource(resource_id))?;
        if stock.available >= stock.total {
            return Err(CatalogError::Overflow(resource_id));
        }
        stock.available += 1;
        Ok(stock.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_stay_within_bounds() {
        let catalog = MemoryCatalog::new();
        let id = Ulid::new();
        catalog.insert(id, 2, 1);

        assert_eq!(catalog.decrement_available(id), Ok(0));
        assert_eq!(catalog.decrement_available(id), Err(CatalogError::Exhausted(id)));
        assert_eq!(catalog.increment_available(id), Ok(1));
        assert_eq!(catalog.increment_available(id), Ok(2));
        assert_eq!(catalog.increment_available(id), Err(CatalogError::Overflow(id)));
        assert_eq!(catalog.available_units(id), Ok(2));
    }

    #[test]
    fn unknown_resource() {
        let catalog = MemoryCatalog::new();
        let id = Ulid::new();
        assert_eq!(catalog.available_units(id), Err(CatalogError::UnknownResource(id)));
        assert_eq!(catalog.decrement_available(id), Err(CatalogError::UnknownResource(id)));
    }

    #[test]
    fn insert_clamps_available() {
        let catalog = MemoryCatalog::new();
        let id = Ulid::new();
        catalog.insert(id, 3, 10);
        assert_eq!(catalog.stock(id), Some(Stock { total: 3, available: 3 }));
        assert!(catalog.remove(id).is_some());
        assert!(catalog.stock(id).is_none());
    }
}
