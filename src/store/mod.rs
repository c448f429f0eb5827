use crate::{InstanceRecord, InstanceStatus};

mod error;
pub use error::StoreError;

/// Storage abstraction for durable orchestration instance records.
///
/// Every status change goes through `transition`, a compare-and-swap on the
/// expected current status, so no two writers can advance the same instance
/// concurrently. Providers must make `create` and `transition` atomic.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Atomically create a new record; `AlreadyExists` if the id is taken.
    async fn create(&self, record: InstanceRecord) -> Result<(), StoreError>;

    /// Read one record.
    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError>;

    /// Conditionally advance `id` from `expected` to `next`, storing `result`
    /// and stamping `completed_at` on terminal transitions. Fails with
    /// `Conflict` if the current status is not `expected`, and rejects any
    /// pair that is not a legal forward transition.
    async fn transition(
        &self,
        id: &str,
        expected: InstanceStatus,
        next: InstanceStatus,
        result: Option<String>,
    ) -> Result<(), StoreError>;

    /// Persist a bumped attempt counter for a Running instance (retry
    /// checkpoint, so a crash resumes at the right attempt).
    async fn record_attempt(&self, id: &str, attempt: u32) -> Result<(), StoreError>;

    /// Enumerate Pending/Running instances for the recovery scan, oldest first.
    async fn list_non_terminal(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Clear all records (test utility).
    async fn reset(&self);
}

/// In-memory store for tests.
pub mod in_memory;
/// SQLite-backed durable store.
pub mod sqlite;
