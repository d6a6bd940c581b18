//! TTL-bound retention of per-identity key usage logs.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default timestamp layout of logged lookups, e.g. `2024-03-01T12:00:00+0100`.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Default time-to-live of a logged lookup: one day.
pub const DEFAULT_TTL_MINUTES: i64 = 1440;

/// Most recent lookup of `key` by `identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedKeyUsage {
    #[serde(rename = "certname")]
    pub identity: String,
    pub key: String,
    #[serde(rename = "date")]
    pub timestamp: String,
}

impl LoggedKeyUsage {
    pub fn new(identity: impl Into<String>, key: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// Prunes expired entries and keeps one entry per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl_minutes: i64,
    pub timestamp_format: String,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl_minutes: DEFAULT_TTL_MINUTES,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl RetentionPolicy {
    pub fn new(ttl_minutes: i64, timestamp_format: impl Into<String>) -> Self {
        Self {
            ttl_minutes,
            timestamp_format: timestamp_format.into(),
        }
    }

    /// Build a usage entry stamped with the current local time.
    pub fn stamp(&self, identity: &str, key: &str) -> LoggedKeyUsage {
        let now = Local::now().fixed_offset();
        LoggedKeyUsage::new(identity, key, now.format(&self.timestamp_format).to_string())
    }

    /// Merge `incoming` into `existing` using the current time.
    pub fn merge(&self, existing: Vec<LoggedKeyUsage>, incoming: LoggedKeyUsage) -> Vec<LoggedKeyUsage> {
        self.merge_at(existing, incoming, Utc::now().fixed_offset())
    }

    /// Drop entries for the incoming key and entries past the TTL, then append
    /// `incoming`.
    pub fn merge_at(
        &self,
        existing: Vec<LoggedKeyUsage>,
        incoming: LoggedKeyUsage,
        now: DateTime<FixedOffset>,
    ) -> Vec<LoggedKeyUsage> {
        let mut kept: Vec<LoggedKeyUsage> = existing
            .into_iter()
            .filter(|entry| entry.key != incoming.key)
            .filter(|entry| self.age_minutes(&entry.timestamp, now) < self.ttl_minutes)
            .collect();
        kept.push(incoming);
        kept
    }

    /// Whole minutes elapsed since `timestamp`; unparsable timestamps are age 0.
    pub fn age_minutes(&self, timestamp: &str, now: DateTime<FixedOffset>) -> i64 {
        match self.parse(timestamp) {
            Some(at) => (now - at).num_minutes(),
            None => {
                tracing::debug!(timestamp, format = %self.timestamp_format, "unparsable usage timestamp, keeping entry");
                0
            }
        }
    }

    /// Parse a stamp written with this policy's format.
    ///
    /// Formats without an offset are read as local time, the zone
    /// [`RetentionPolicy::stamp`] writes in.
    pub fn parse(&self, timestamp: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(at) = DateTime::parse_from_str(timestamp, &self.timestamp_format) {
            return Some(at);
        }
        let naive = NaiveDateTime::parse_from_str(timestamp, &self.timestamp_format).ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|at| at.fixed_offset())
    }

    /// Whether stamps written now can be read back for age checks.
    pub fn round_trips(&self) -> bool {
        let now = Local::now();
        self.parse(&now.format(&self.timestamp_format).to_string())
            .is_some()
    }
}
