use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{InstanceStore, StoreError};
use crate::{now_millis, InstanceRecord, InstanceStatus};

/// In-memory provider for tests.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    inner: Mutex<HashMap<String, InstanceRecord>>,
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, record: InstanceRecord) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists { id: record.id });
        }
        g.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.inner.lock().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        expected: InstanceStatus,
        next: InstanceStatus,
        result: Option<String>,
    ) -> Result<(), StoreError> {
        if !expected.can_advance_to(next) {
            return Err(StoreError::permanent(
                "transition",
                format!("illegal transition {expected} -> {next}"),
            ));
        }
        let mut g = self.inner.lock().await;
        let rec = g.get_mut(id).ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if rec.status != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: rec.status,
            });
        }
        rec.status = next;
        if let Some(value) = result {
            rec.result = Some(value);
        }
        if next.is_terminal() {
            rec.completed_at_ms = Some(now_millis());
        }
        Ok(())
    }

    async fn record_attempt(&self, id: &str, attempt: u32) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        let rec = g.get_mut(id).ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if rec.status != InstanceStatus::Running {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: InstanceStatus::Running,
                actual: rec.status,
            });
        }
        rec.attempt = attempt;
        Ok(())
    }

    async fn list_non_terminal(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let g = self.inner.lock().await;
        let mut open: Vec<InstanceRecord> = g.values().filter(|r| !r.status.is_terminal()).cloned().collect();
        open.sort_by_key(|r| r.created_at_ms);
        Ok(open)
    }

    async fn reset(&self) {
        self.inner.lock().await.clear();
    }
}
