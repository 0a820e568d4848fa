//! Measurement records as they move through the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::ProfileKey;

/// A single ingested measurement event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub tenant_id: String,
    pub dataset_id: String,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    /// The event's own timestamp. This, not arrival time, decides which
    /// window the record lands in.
    pub timestamp: DateTime<Utc>,
    /// Named numeric observations carried by the event.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

/// A record plus the identity stamped onto it when it was buffered.
///
/// The window is fixed at buffer time, so a record that sits queued
/// across a rotation still lands in the window its own timestamp named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedRecord {
    pub record: MeasurementRecord,
    pub session_start: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

impl StampedRecord {
    pub fn profile_key(&self) -> ProfileKey {
        ProfileKey::new(
            self.record.tenant_id.clone(),
            self.record.dataset_id.clone(),
            self.record.tags.clone(),
            self.session_start,
            self.window_start,
        )
    }
}
