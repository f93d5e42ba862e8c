use std::path::Path;

use serde::Deserialize;
use ulid::Ulid;

use crate::catalog::MemoryCatalog;
use crate::model::RequesterAttributes;
use crate::standing::MemoryStanding;

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("read seed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse seed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid seed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedResource {
    pub id: Ulid,
    pub total_units: u32,
    /// Defaults to `total_units`.
    pub available_units: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRequester {
    pub id: Ulid,
    #[serde(flatten)]
    pub attributes: RequesterAttributes,
}

/// Initial contents of the in-memory catalog and directory.
///
/// ```json
/// {
///   "resources": [{ "id": "01J...", "total_units": 3, "available_units": 0 }],
///   "requesters": [{ "id": "01J...", "membership_tier": "premium", "urgency_flag": true }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub resources: Vec<SeedResource>,
    pub requesters: Vec<SeedRequester>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SeedError> {
        let seed: Seed = serde_json::from_str(json)?;
        for r in &seed.resources {
            if r.available_units.is_some_and(|a| a > r.total_units) {
                return Err(SeedError::Invalid(format!(
                    "resource {} has more available than total units",
                    r.id
                )));
            }
        }
        Ok(seed)
    }

    pub fn install(&self, catalog: &MemoryCatalog, standing: &MemoryStanding) {
        for r in &self.resources {
            catalog.insert(r.id, r.total_units, r.available_units.unwrap_or(r.total_units));
        }
        for r in &self.requesters {
            standing.insert(r.id, r.attributes);
        }
        tracing::info!(
            "seeded {} resources and {} requesters",
            self.resources.len(),
            self.requesters.len()
        );
    }
}
