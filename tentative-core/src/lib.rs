//! Tentative Core - Cache Types
//!
//! Pure data structures shared by the reconciliation engine. All other crates
//! depend on this. No locking, no I/O beyond loading configuration.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod entry;
pub mod error;
pub mod key;

pub use config::ReconcileConfig;
pub use entry::{CacheEntry, EntryStatus, Snapshot};
pub use error::{
    ConfigError, KeyError, MutationError, RemoteFailure, RemoteFailureKind, StoreError,
    TentativeError, TentativeResult,
};
pub use key::{CacheKey, KeyFilter};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier of one in-flight mutation.
/// UUIDv7 embeds a Unix timestamp, so ids sort by the order mutations began.
pub type MutationId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 MutationId (timestamp-sortable).
pub fn new_mutation_id() -> MutationId {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_ids_are_unique_and_v7() {
        let a = new_mutation_id();
        let b = new_mutation_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }
}
