//! Part/site availability reference data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AvailabilityId, PartId, SiteId};

/// Declares that a part may be built at a site. Lower rank is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSiteAvailability {
    /// Row identifier.
    pub id: AvailabilityId,
    /// Part reference.
    pub part: PartId,
    /// Site reference.
    pub site: SiteId,
    /// Preference rank, lower = more preferred.
    pub preference_rank: i32,
    /// Inactive records are kept for history but not offered as build sites.
    pub is_active: bool,
    /// Constraint notes (tooling, certification, capacity caps, ...).
    pub notes: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Input for declaring availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAvailability {
    /// Part reference.
    pub part: PartId,
    /// Site reference.
    pub site: SiteId,
    /// Preference rank.
    pub preference_rank: i32,
    /// Constraint notes.
    pub notes: Option<String>,
}

impl NewAvailability {
    /// Active availability with the given rank.
    pub fn new(part: impl Into<PartId>, site: impl Into<SiteId>, preference_rank: i32) -> Self {
        Self {
            part: part.into(),
            site: site.into(),
            preference_rank,
            notes: None,
        }
    }
}

/// Partial availability update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPatch {
    /// New rank.
    pub preference_rank: Option<i32>,
    /// New active flag.
    pub is_active: Option<bool>,
    /// New notes (`Some(None)` clears them).
    pub notes: Option<Option<String>>,
}

impl AvailabilityPatch {
    /// Apply onto a record, returning the updated copy.
    pub fn apply_to(&self, record: &PartSiteAvailability, now: DateTime<Utc>) -> PartSiteAvailability {
        let mut updated = record.clone();
        if let Some(rank) = self.preference_rank {
            updated.preference_rank = rank;
        }
        if let Some(active) = self.is_active {
            updated.is_active = active;
        }
        if let Some(notes) = &self.notes {
            updated.notes = notes.clone();
        }
        updated.updated_at = now;
        updated
    }
}
