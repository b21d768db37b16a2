// Database models - Dog identity records
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keypoints::GeometryRecord;

/// One tracked dog, keyed by the hash of its name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// SHA-256 hex of the label as first submitted
    pub id: String,
    /// Name as originally submitted; never rewritten by later sightings
    pub label: String,
    /// Keypoints of the most recent sighting
    pub geometry: GeometryRecord,
    /// Free-text location note of the most recent sighting
    pub note: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Stored state of a dog just before a sighting overwrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSighting {
    pub label: String,
    /// `None` when the stored keypoints could not be read
    pub geometry: Option<GeometryRecord>,
    pub note: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Result of an insert-or-update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// The record as stored after this sighting
    pub record: IdentityRecord,
    /// Snapshot taken before the update, `None` for a new identity
    pub previous: Option<PriorSighting>,
}

impl UpsertOutcome {
    pub fn was_existing(&self) -> bool {
        self.previous.is_some()
    }
}
