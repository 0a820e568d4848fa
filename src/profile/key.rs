//! Profile identity: who a measurement belongs to and which time window
//! it falls in.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Granularity of profile windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    Hour,
    Day,
}

impl WindowUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowUnit::Hour => "hour",
            WindowUnit::Day => "day",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            WindowUnit::Hour => 3_600,
            WindowUnit::Day => 86_400,
        }
    }

    /// Truncates a timestamp to the start of the window containing it.
    /// Days are UTC days.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let bucket = self.seconds();
        let floored = ts.timestamp().div_euclid(bucket) * bucket;
        // Any floored epoch second is representable, so single() is
        // always Some here.
        Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
    }
}

/// Identity of one windowed profile.
///
/// Two records feed the same profile accumulator iff all five components
/// match. Tag pairs are sorted and deduplicated at construction so the
/// order tags arrive in never splits a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub tenant_id: String,
    pub dataset_id: String,
    pub tags: Vec<(String, String)>,
    pub session_start: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

impl ProfileKey {
    pub fn new(
        tenant_id: impl Into<String>,
        dataset_id: impl Into<String>,
        mut tags: Vec<(String, String)>,
        session_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Self {
        tags.sort();
        tags.dedup();
        Self {
            tenant_id: tenant_id.into(),
            dataset_id: dataset_id.into(),
            tags,
            session_start,
            window_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_hour_truncation() {
        assert_eq!(
            WindowUnit::Hour.truncate(ts("2025-03-14T09:37:42.123Z")),
            ts("2025-03-14T09:00:00Z")
        );
        // An exact boundary maps to itself.
        assert_eq!(
            WindowUnit::Hour.truncate(ts("2025-03-14T09:00:00Z")),
            ts("2025-03-14T09:00:00Z")
        );
    }

    #[test]
    fn test_day_truncation() {
        assert_eq!(
            WindowUnit::Day.truncate(ts("2025-03-14T23:59:59Z")),
            ts("2025-03-14T00:00:00Z")
        );
        assert_eq!(
            WindowUnit::Day.truncate(ts("2025-03-14T00:00:00Z")),
            ts("2025-03-14T00:00:00Z")
        );
    }

    #[test]
    fn test_adjacent_hours_truncate_apart() {
        let in_window = ts("2025-03-14T09:59:59Z");
        let next_window = ts("2025-03-14T10:00:00Z");
        assert_ne!(
            WindowUnit::Hour.truncate(in_window),
            WindowUnit::Hour.truncate(next_window)
        );
    }

    #[test]
    fn test_tag_order_does_not_split_identity() {
        let session = ts("2025-03-14T08:00:00Z");
        let window = ts("2025-03-14T09:00:00Z");
        let a = ProfileKey::new(
            "tenant",
            "dataset",
            vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "eu".to_string()),
            ],
            session,
            window,
        );
        let b = ProfileKey::new(
            "tenant",
            "dataset",
            vec![
                ("region".to_string(), "eu".to_string()),
                ("env".to_string(), "prod".to_string()),
            ],
            session,
            window,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_tags_collapse() {
        let session = ts("2025-03-14T08:00:00Z");
        let window = ts("2025-03-14T09:00:00Z");
        let key = ProfileKey::new(
            "tenant",
            "dataset",
            vec![
                ("env".to_string(), "prod".to_string()),
                ("env".to_string(), "prod".to_string()),
            ],
            session,
            window,
        );
        assert_eq!(key.tags.len(), 1);
    }

    #[test]
    fn test_differing_tags_differ() {
        let session = ts("2025-03-14T08:00:00Z");
        let window = ts("2025-03-14T09:00:00Z");
        let a = ProfileKey::new(
            "tenant",
            "dataset",
            vec![("env".to_string(), "prod".to_string())],
            session,
            window,
        );
        let b = ProfileKey::new(
            "tenant",
            "dataset",
            vec![("env".to_string(), "dev".to_string())],
            session,
            window,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_window_unit_parses_from_yaml() {
        assert_eq!(
            serde_yaml::from_str::<WindowUnit>("hour").unwrap(),
            WindowUnit::Hour
        );
        assert_eq!(
            serde_yaml::from_str::<WindowUnit>("day").unwrap(),
            WindowUnit::Day
        );
        assert!(serde_yaml::from_str::<WindowUnit>("minute").is_err());
    }
}
