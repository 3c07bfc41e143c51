//! Read-only view of durable migration records plus change
//! notifications, and the frontend seam for proposing state advances.
//!
//! The table is the consumer side of the durable migration log: records
//! appear, change and disappear as the log applies entries, and every
//! durably-applied change fires the registered callbacks exactly once.
//! Callbacks must be fast and non-suspending; they typically enqueue an
//! event for the reconciliation backend and return.
//!
//! Writes go the other way, through [`MigrationFrontend`]: the backend
//! proposes an advance of a migration's recorded state and later
//! observes the applied change as a table notification. The frontend
//! deduplicates proposals by `(id, applied_state)` versioning, so
//! delivery is best-effort, at-least-once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::MigrationResult;
use crate::migration::metadata::MigrationRecord;
use crate::migration::state::MigrationState;
use crate::types::{MigrationId, NotificationId};

/// Callback invoked with the id of a migration whose durable record
/// changed (created, updated or deleted).
pub type MigrationCallback = Box<dyn Fn(MigrationId) + Send + Sync>;

/// Proposes durable state advances for migrations.
///
/// Implementations submit the proposal to the cluster-metadata log; the
/// caller must not mutate local state on success but wait for the
/// corresponding table notification.
#[async_trait]
pub trait MigrationFrontend: Send + Sync {
    /// Propose moving migration `id` to `new_state`. Duplicate proposals
    /// for an already-applied state are accepted.
    async fn propose_advance(
        &self,
        id: MigrationId,
        new_state: MigrationState,
    ) -> MigrationResult<()>;
}

/// In-memory consumer view of the durable migration records.
///
/// In production this is fed by the cluster-metadata apply path; tests
/// drive it directly through [`MigrationTable::apply`] and
/// [`MigrationTable::remove`].
pub struct MigrationTable {
    records: DashMap<MigrationId, MigrationRecord>,
    callbacks: Mutex<HashMap<NotificationId, MigrationCallback>>,
    next_notification: AtomicU64,
    next_id: AtomicI64,
}

impl MigrationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            callbacks: Mutex::new(HashMap::new()),
            next_notification: AtomicU64::new(1),
            next_id: AtomicI64::new(1),
        }
    }

    /// Current record for `id`, if any.
    pub fn snapshot(&self, id: MigrationId) -> Option<MigrationRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// Ids of all known migrations, sorted for stable iteration.
    pub fn ids(&self) -> Vec<MigrationId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    /// Allocate the next monotonic migration id.
    pub fn next_migration_id(&self) -> MigrationId {
        MigrationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a change callback. The callback fires exactly once per
    /// durably-applied change, must be fast and must not suspend or call
    /// back into the table.
    pub fn subscribe(&self, callback: MigrationCallback) -> NotificationId {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .expect("migration table callback registry poisoned")
            .insert(id, callback);
        id
    }

    /// Remove a previously registered callback. Idempotent.
    pub fn unsubscribe(&self, id: NotificationId) {
        self.callbacks
            .lock()
            .expect("migration table callback registry poisoned")
            .remove(&id);
    }

    /// Apply a created or updated record and notify subscribers.
    pub fn apply(&self, record: MigrationRecord) {
        let id = record.id;
        self.records.insert(id, record);
        self.notify(id);
    }

    /// Delete a record and notify subscribers.
    pub fn remove(&self, id: MigrationId) {
        self.records.remove(&id);
        self.notify(id);
    }

    fn notify(&self, id: MigrationId) {
        let callbacks = self
            .callbacks
            .lock()
            .expect("migration table callback registry poisoned");
        for callback in callbacks.values() {
            callback(id);
        }
    }
}

impl Default for MigrationTable {
    fn default() -> Self {
        Self::new()
    }
}
