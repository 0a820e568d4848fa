//! Per-window measurement accumulators.
//!
//! A [`Rollup`] is the value stored under a [`super::ProfileKey`]: plain
//! running statistics per named field. Mutation only ever happens inside
//! the map actor's serialized update, so there is no interior locking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::MeasurementRecord;

/// Running statistics for one named measurement field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRollup {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// The most recently observed value.
    pub last: f64,
}

impl Default for FieldRollup {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
        }
    }
}

impl FieldRollup {
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
    }
}

/// Accumulated state for one profile window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    /// Records folded into this profile.
    pub record_count: u64,
    /// Per-field statistics keyed by measurement name.
    pub fields: BTreeMap<String, FieldRollup>,
}

impl Rollup {
    /// Folds one record into the accumulator. Non-finite values are
    /// dropped; they would poison min/max and serialize as JSON null.
    pub fn track(&mut self, record: &MeasurementRecord) {
        self.record_count += 1;
        for (name, value) in &record.values {
            if !value.is_finite() {
                continue;
            }
            self.fields.entry(name.clone()).or_default().observe(*value);
        }
    }
}
