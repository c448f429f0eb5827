#![allow(dead_code)]

use longrun::activity::{ActivityError, ActivityHandler};
use longrun::notify::{DeliveryError, NotificationPayload, Notifier};
use longrun::store::sqlite::SqliteInstanceStore;
use longrun::store::InstanceStore;
use longrun::InstanceRecord;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<(String, NotificationPayload)>>,
}

impl RecordingNotifier {
    pub fn deliveries(&self) -> Vec<(String, NotificationPayload)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, recipient: &str, payload: NotificationPayload) -> Result<(), DeliveryError> {
        self.deliveries.lock().unwrap().push((recipient.to_string(), payload));
        Ok(())
    }
}

/// Notifier whose channel is always down; records how often it was asked.
#[derive(Default)]
pub struct FailingNotifier {
    pub attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Notifier for FailingNotifier {
    async fn deliver(&self, recipient: &str, _payload: NotificationPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError {
            recipient: recipient.to_string(),
            message: "channel unavailable".to_string(),
        })
    }
}

/// Activity that fails transiently until call number `succeed_on`, then
/// returns `result`. Use `succeed_on: u32::MAX` for an activity that never
/// succeeds.
pub struct FlakyActivity {
    pub calls: Arc<AtomicU32>,
    pub succeed_on: u32,
    pub result: String,
}

#[async_trait::async_trait]
impl ActivityHandler for FlakyActivity {
    async fn run(&self, _input: String) -> Result<String, ActivityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.succeed_on {
            Err(ActivityError::Transient(format!("flaky failure {n}")))
        } else {
            Ok(self.result.clone())
        }
    }
}

/// Activity that never finishes; stands in for work interrupted by a crash.
pub struct StuckActivity;

#[async_trait::async_trait]
impl ActivityHandler for StuckActivity {
    async fn run(&self, _input: String) -> Result<String, ActivityError> {
        std::future::pending::<Result<String, ActivityError>>().await
    }
}

/// Poll the store until `predicate` holds for the instance record.
pub async fn wait_for_record<F>(store: Arc<dyn InstanceStore>, id: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&InstanceRecord) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(rec)) = store.get(id).await {
            if predicate(&rec) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn InstanceStore>, String, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteInstanceStore::new(&db_url).await.unwrap()) as Arc<dyn InstanceStore>;
    (store, db_url, td)
}
