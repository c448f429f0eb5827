use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityError, ActivityHandler};
use crate::notify::{NotificationPayload, Notifier};
use crate::store::{InstanceStore, StoreError};
use crate::{InstanceRecord, InstanceStatus};

/// Configuration options for the Coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Activity attempts per instance before the run is failed.
    pub max_activity_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt.
    pub retry_backoff_base_ms: u64,
    /// Upper bound on any single backoff sleep.
    pub retry_backoff_cap_ms: u64,
    /// Maximum duration of one activity invocation; exceeding it counts as a
    /// transient failure, not a silent hang.
    pub activity_timeout_ms: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_activity_attempts: 5,
            retry_backoff_base_ms: 50,
            retry_backoff_cap_ms: 5_000,
            activity_timeout_ms: 120_000,
        }
    }
}

/// What `start_instance` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was persisted and its driver spawned.
    Started,
    /// An instance with this id already exists; the start was suppressed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    Store(StoreError),
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        CoordinatorError::Store(e)
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// High-level instance view derived from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceProgress {
    NotFound,
    Pending,
    Running { attempt: u32 },
    Completed { result: String },
    Failed { reason: String },
}

/// Error type returned by `wait_for_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Store(StoreError),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for terminal state"),
            WaitError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Outcome of a drive loop, before it is persisted.
enum RunOutcome {
    Success(String),
    Failed(String),
}

/// Owns the instance lifecycle: persists a Pending record per start request,
/// drives each instance through activity execution with timeout and bounded
/// exponential-backoff retries, records the terminal state, and triggers
/// exactly one notification per instance.
///
/// Each instance is driven by its own task; instances are independent. All
/// status changes go through the store's conditional transition, and no store
/// lock is held while the activity runs or a backoff sleeps.
pub struct Coordinator {
    store: Arc<dyn InstanceStore>,
    activity: Arc<dyn ActivityHandler>,
    notifier: Arc<dyn Notifier>,
    options: CoordinatorOptions,
    /// Live cancellation handles, one per in-flight driver.
    cancels: Mutex<HashMap<String, oneshot::Sender<String>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start a coordinator with default options.
    pub fn start(
        store: Arc<dyn InstanceStore>,
        activity: Arc<dyn ActivityHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Self::start_with_options(store, activity, notifier, CoordinatorOptions::default())
    }

    /// Start a coordinator with custom options.
    pub fn start_with_options(
        store: Arc<dyn InstanceStore>,
        activity: Arc<dyn ActivityHandler>,
        notifier: Arc<dyn Notifier>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        Arc::new(Self {
            store,
            activity,
            notifier,
            options,
            cancels: Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
        })
    }

    /// Durably record a new instance and begin driving it, without waiting
    /// for the workflow to finish. The only suspension here is the Pending
    /// persist; callers get their acknowledgement back immediately after.
    ///
    /// A second start for an existing id is suppressed (`Duplicate`), never
    /// surfaced as an error: at most one instance per requester identity.
    pub async fn start_instance(
        self: &Arc<Self>,
        id: &str,
        input: impl Into<String>,
    ) -> Result<StartOutcome, CoordinatorError> {
        let record = InstanceRecord::pending(id, input);
        match self.store.create(record.clone()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(instance = %id, "duplicate start suppressed");
                return Ok(StartOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }
        self.spawn_driver(record).await;
        Ok(StartOutcome::Started)
    }

    /// Recovery scan: re-drive every non-terminal instance found in the
    /// store. Run once at startup, after a crash or restart; returns how many
    /// instances were resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, CoordinatorError> {
        let open = self.store.list_non_terminal().await?;
        let mut resumed = 0;
        for record in open {
            // A live driver already owns this instance; spawning a second
            // would violate the one-writer-per-instance rule.
            if self.cancels.lock().await.contains_key(&record.id) {
                debug!(instance = %record.id, "driver already live; skipping resume");
                continue;
            }
            info!(
                instance = %record.id,
                status = %record.status,
                attempt = record.attempt,
                "resuming instance after restart"
            );
            self.spawn_driver(record).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Signal a running instance to stop. An honored cancellation fails the
    /// instance with a "cancelled" reason and still notifies the requester.
    /// Returns whether a live driver was signalled.
    pub async fn cancel_instance(&self, id: &str, reason: impl Into<String>) -> bool {
        match self.cancels.lock().await.remove(id) {
            Some(tx) => tx.send(reason.into()).is_ok(),
            None => false,
        }
    }

    /// Point-in-time view of an instance.
    pub async fn status(&self, id: &str) -> Result<InstanceProgress, CoordinatorError> {
        Ok(match self.store.get(id).await? {
            None => InstanceProgress::NotFound,
            Some(r) => match r.status {
                InstanceStatus::Pending => InstanceProgress::Pending,
                InstanceStatus::Running => InstanceProgress::Running { attempt: r.attempt },
                InstanceStatus::Completed => InstanceProgress::Completed {
                    result: r.result.unwrap_or_default(),
                },
                InstanceStatus::Failed => InstanceProgress::Failed {
                    reason: r.result.unwrap_or_default(),
                },
            },
        })
    }

    /// Poll the store until the instance reaches a terminal state.
    pub async fn wait_for_instance(&self, id: &str, timeout: Duration) -> Result<InstanceProgress, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(id).await {
                Ok(p @ (InstanceProgress::Completed { .. } | InstanceProgress::Failed { .. })) => return Ok(p),
                Ok(_) => {}
                Err(CoordinatorError::Store(e)) => return Err(WaitError::Store(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Abort background driver tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    async fn spawn_driver(self: &Arc<Self>, record: InstanceRecord) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().await.insert(record.id.clone(), cancel_tx);

        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            coordinator.drive(record, cancel_rx).await;
        });

        let mut joins = self.joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
    }

    /// The per-instance state machine: Pending -> Running -> terminal, with
    /// Running self-loops for retries. Each store write is a checkpoint; a
    /// crash resumes from the last one via `recover`.
    async fn drive(self: Arc<Self>, record: InstanceRecord, cancel: oneshot::Receiver<String>) {
        let id = record.id.clone();

        // Checkpoint: Pending -> Running. A record already Running here means
        // we crashed mid-run and are resuming; that is a legal re-entry.
        if record.status == InstanceStatus::Pending {
            match self
                .store
                .transition(&id, InstanceStatus::Pending, InstanceStatus::Running, None)
                .await
            {
                Ok(()) => {}
                Err(StoreError::Conflict {
                    actual: InstanceStatus::Running,
                    ..
                }) => {
                    debug!(instance = %id, "instance already running; resuming");
                }
                Err(e) => {
                    error!(instance = %id, error = %e, "failed to mark instance running");
                    self.cancels.lock().await.remove(&id);
                    return;
                }
            }
        }

        let outcome = self.run_activity_with_retries(&record, cancel).await;

        // Checkpoint: durably record the terminal state, then notify. A crash
        // between the two loses the notification rather than duplicating it,
        // and the recovery scan skips terminal instances, so the dispatcher
        // fires at most once per instance.
        match outcome {
            RunOutcome::Success(value) => {
                match self
                    .transition_with_retry(&id, InstanceStatus::Running, InstanceStatus::Completed, Some(value.clone()))
                    .await
                {
                    Ok(()) => {
                        info!(instance = %id, "instance completed");
                        self.notify(&id, NotificationPayload::Success { result: value }).await;
                    }
                    Err(e) => error!(instance = %id, error = %e, "failed to persist completion"),
                }
            }
            RunOutcome::Failed(reason) => {
                match self
                    .transition_with_retry(&id, InstanceStatus::Running, InstanceStatus::Failed, Some(reason.clone()))
                    .await
                {
                    Ok(()) => {
                        info!(instance = %id, reason = %reason, "instance failed");
                        self.notify(&id, NotificationPayload::Failure { reason }).await;
                    }
                    Err(e) => error!(instance = %id, error = %e, "failed to persist failure"),
                }
            }
        }

        self.cancels.lock().await.remove(&id);
    }

    async fn run_activity_with_retries(
        &self,
        record: &InstanceRecord,
        mut cancel: oneshot::Receiver<String>,
    ) -> RunOutcome {
        let id = &record.id;
        // Resume from the persisted attempt counter after a crash.
        let mut attempt = record.attempt.max(1);

        loop {
            debug!(instance = %id, attempt, "invoking activity");
            let invocation = tokio::time::timeout(
                Duration::from_millis(self.options.activity_timeout_ms),
                self.activity.run(record.input.clone()),
            );

            let result = tokio::select! {
                reason = &mut cancel => {
                    let reason = reason.unwrap_or_else(|_| "cancelled".to_string());
                    return RunOutcome::Failed(format!("cancelled: {reason}"));
                }
                res = invocation => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(ActivityError::Transient(format!(
                        "activity timed out after {}ms",
                        self.options.activity_timeout_ms
                    ))),
                },
            };

            match result {
                Ok(value) => return RunOutcome::Success(value),
                Err(ActivityError::Fatal(reason)) => {
                    warn!(instance = %id, attempt, reason = %reason, "activity failed fatally");
                    return RunOutcome::Failed(reason);
                }
                Err(ActivityError::Transient(reason)) => {
                    if attempt >= self.options.max_activity_attempts {
                        warn!(instance = %id, attempt, reason = %reason, "activity retries exhausted");
                        return RunOutcome::Failed(format!("retries exhausted after {attempt} attempts: {reason}"));
                    }
                    attempt += 1;
                    // Retry checkpoint: the bumped counter survives a crash.
                    if let Err(e) = self.store.record_attempt(id, attempt).await {
                        warn!(instance = %id, attempt, error = %e, "failed to checkpoint retry attempt");
                    }
                    let backoff_ms = self.backoff_ms(attempt);
                    debug!(instance = %id, attempt, backoff_ms, reason = %reason, "transient failure; backing off");
                    tokio::select! {
                        reason = &mut cancel => {
                            let reason = reason.unwrap_or_else(|_| "cancelled".to_string());
                            return RunOutcome::Failed(format!("cancelled: {reason}"));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }
            }
        }
    }

    /// Backoff before `attempt` (2-based): base, 2x base, 4x base, ... capped.
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(2).min(16);
        self.options
            .retry_backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.options.retry_backoff_cap_ms)
    }

    /// Terminal transitions must land; retry transient store errors with the
    /// same short backoff ladder used for provider acks.
    async fn transition_with_retry(
        &self,
        id: &str,
        expected: InstanceStatus,
        next: InstanceStatus,
        result: Option<String>,
    ) -> Result<(), StoreError> {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;
        loop {
            match self.store.transition(id, expected, next, result.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(instance = %id, attempts, backoff_ms, error = %e, "transition failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delivery is a separate failure domain: log and move on, never touch
    /// the instance's terminal state, never retry here.
    async fn notify(&self, recipient: &str, payload: NotificationPayload) {
        if let Err(e) = self.notifier.deliver(recipient, payload).await {
            warn!(recipient = %recipient, error = %e, "notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::DeliveryError;
    use crate::store::in_memory::InMemoryInstanceStore;
    use crate::FnActivity;

    fn coordinator_with(options: CoordinatorOptions) -> Arc<Coordinator> {
        struct Silent;
        #[async_trait::async_trait]
        impl Notifier for Silent {
            async fn deliver(&self, _recipient: &str, _payload: NotificationPayload) -> Result<(), DeliveryError> {
                Ok(())
            }
        }
        Coordinator::start_with_options(
            Arc::new(InMemoryInstanceStore::default()),
            Arc::new(FnActivity(|input: String| async move { Ok(input) })),
            Arc::new(Silent),
            options,
        )
    }

    #[tokio::test]
    async fn backoff_doubles_from_base_and_caps() {
        let c = coordinator_with(CoordinatorOptions {
            max_activity_attempts: 10,
            retry_backoff_base_ms: 50,
            retry_backoff_cap_ms: 300,
            activity_timeout_ms: 1_000,
        });
        assert_eq!(c.backoff_ms(2), 50);
        assert_eq!(c.backoff_ms(3), 100);
        assert_eq!(c.backoff_ms(4), 200);
        assert_eq!(c.backoff_ms(5), 300);
        assert_eq!(c.backoff_ms(6), 300);
        // Shift is clamped; huge attempt numbers must not overflow.
        assert_eq!(c.backoff_ms(u32::MAX), 300);
    }

    #[tokio::test]
    async fn cancel_without_live_driver_reports_false() {
        let c = coordinator_with(CoordinatorOptions::default());
        assert!(!c.cancel_instance("nobody", "reason").await);
    }
}
