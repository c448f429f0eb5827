//! Durable single-activity orchestration.
//!
//! A synchronous trigger (a voice/chat request) launches a unit of work that
//! outlives the request, and the eventual result is pushed back to the
//! requester over an out-of-band channel. The crate provides:
//!
//! - Public data model: `InstanceStatus`, `InstanceRecord`
//! - An `InstanceStore` with in-memory and SQLite providers
//! - A `Coordinator` that drives each instance through activity execution,
//!   retry, and notification, with crash recovery via a startup scan
//! - A `Notifier` seam for the outbound push channel
//! - A `TriggerGateway` that acknowledges inbound requests immediately
//!
//! Instance ids double as notification correlation keys: an instance is keyed
//! by the requester's identity, so each requester has at most one active run.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod activity;
pub mod coordinator;
pub mod gateway;
pub mod notify;
pub mod store;

// Re-export key types for public API ergonomics
pub use activity::{ActivityError, ActivityHandler, FnActivity};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorOptions, InstanceProgress, StartOutcome, WaitError};
pub use gateway::{AckResponse, RequestKind, TriggerGateway, TriggerRequest};
pub use notify::{NotificationPayload, Notifier, PushConfig};
pub use store::{InstanceStore, StoreError};

/// Lifecycle state of an orchestration instance.
///
/// Transitions are strictly forward: `Pending -> Running -> Completed | Failed`.
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_advance_to(self, next: InstanceStatus) -> bool {
        matches!(
            (self, next),
            (InstanceStatus::Pending, InstanceStatus::Running)
                | (InstanceStatus::Running, InstanceStatus::Completed)
                | (InstanceStatus::Running, InstanceStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
        }
    }

    /// Inverse of `as_str`, used when reading persisted rows.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(InstanceStatus::Pending),
            "Running" => Some(InstanceStatus::Running),
            "Completed" => Some(InstanceStatus::Completed),
            "Failed" => Some(InstanceStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one orchestration instance.
///
/// The store exclusively owns persisted records; the coordinator holds only a
/// transient view while driving a run. Records are never deleted by this
/// crate; retention is an external policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Externally supplied id; also the notification correlation key.
    pub id: String,
    pub status: InstanceStatus,
    /// Opaque payload supplied at creation; immutable afterwards.
    pub input: String,
    /// The activity result (Completed) or failure reason (Failed).
    pub result: Option<String>,
    /// 1-based activity attempt counter, persisted at each retry checkpoint.
    pub attempt: u32,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl InstanceRecord {
    /// A fresh Pending record about to make its first activity attempt.
    pub fn pending(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: InstanceStatus::Pending,
            input: input.into(),
            result: None,
            attempt: 1,
            created_at_ms: now_millis(),
            completed_at_ms: None,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
