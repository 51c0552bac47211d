//! Cache entries, their freshness status, and rollback snapshots.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::key::CacheKey;
use crate::Timestamp;

/// Freshness of a cached entry.
///
/// ```text
/// Fresh ── optimistic write ──→ Pending ── rollback ──→ Fresh
///   ↑                              │
///   └──── refetch ──── Stale ←── settle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Value reflects the last authoritative read (or a rollback to one).
    Fresh,
    /// Value should be refreshed from the remote source.
    Stale,
    /// Value carries an unconfirmed optimistic write.
    Pending,
}

impl EntryStatus {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached query result.
///
/// `version` increments on every write, optimistic or authoritative. Value,
/// version and status are always replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: Option<V>,
    pub version: u64,
    pub status: EntryStatus,
    pub updated_at: Timestamp,
}

impl<V> CacheEntry<V> {
    pub fn new(key: CacheKey, value: Option<V>, version: u64, status: EntryStatus) -> Self {
        Self {
            key,
            value,
            version,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Marker delivered to subscribers when an entry is removed.
    pub fn tombstone(key: CacheKey) -> Self {
        Self::new(key, None, 0, EntryStatus::Fresh)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none() && self.version == 0
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Time since the entry was last written.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Immutable capture of an entry taken right before an optimistic write.
///
/// A snapshot of a key with no entry has `value() == None` and version 0;
/// restoring it removes the entry again. Snapshots are deliberately not
/// `Clone`: each one belongs to the mutation that took it.
#[derive(Debug, PartialEq)]
pub struct Snapshot<V> {
    key: CacheKey,
    value: Option<V>,
    version: u64,
    status: EntryStatus,
}

impl<V: Clone> Snapshot<V> {
    /// Capture the current state of `key` (`None` if nothing is cached).
    pub fn capture(key: CacheKey, current: Option<&CacheEntry<V>>) -> Self {
        match current {
            Some(entry) => Self {
                key,
                value: entry.value.clone(),
                version: entry.version,
                status: entry.status,
            },
            None => Self::absent(key),
        }
    }
}

impl<V> Snapshot<V> {
    pub fn absent(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            version: 0,
            status: EntryStatus::Fresh,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Status the entry had when captured.
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// True if no entry existed for the key when captured.
    pub fn was_absent(&self) -> bool {
        self.value.is_none()
    }

    pub fn into_parts(self) -> (CacheKey, Option<V>, u64, EntryStatus) {
        (self.key, self.value, self.version, self.status)
    }
}
