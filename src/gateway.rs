use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, StartOutcome};

/// Acknowledgement for a launch request. The result arrives later over the
/// push channel.
pub const ACK_LAUNCHED: &str = "Started the long-running job. I will message you with the result.";
/// Acknowledgement for anything this skill does not handle.
pub const ACK_NOT_UNDERSTOOD: &str = "Sorry, I did not catch that.";

/// Request discriminator produced by the inbound channel's parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// The assistant session was opened; launch the long-running job.
    Launch,
    /// Any other request type (intents, session events).
    Other(String),
}

/// One parsed inbound request. Signature verification and payload decoding
/// happen upstream; by the time a request reaches the gateway it carries a
/// verified requester identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Requester identity; doubles as the instance id and the notification
    /// correlation key.
    pub requester: String,
    pub kind: RequestKind,
    /// Opaque payload forwarded to the activity as its input.
    pub payload: String,
}

impl TriggerRequest {
    /// Decode a request produced by the inbound channel adapter.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// Immediate human-readable response to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub text: String,
}

impl AckResponse {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receives parsed inbound requests and acknowledges them immediately; the
/// workflow itself runs behind the coordinator.
pub struct TriggerGateway {
    coordinator: Arc<Coordinator>,
}

impl TriggerGateway {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Handle one request. Returns within the time it takes to persist a
    /// Pending record, regardless of how long the activity will run.
    ///
    /// A launch for an id that already has an instance gets the same
    /// acknowledgement with no second run (duplicate suppression). Workflow
    /// failures never surface here; the requester learns the outcome through
    /// the push channel.
    pub async fn handle_trigger(&self, request: TriggerRequest) -> AckResponse {
        match request.kind {
            RequestKind::Launch if !request.requester.is_empty() => {
                match self.coordinator.start_instance(&request.requester, request.payload).await {
                    Ok(StartOutcome::Started) => {}
                    Ok(StartOutcome::Duplicate) => {
                        debug!(requester = %request.requester, "duplicate launch acknowledged without a new run");
                    }
                    Err(e) => {
                        // Best-effort ack: the requester cannot act on an
                        // internal store error.
                        warn!(requester = %request.requester, error = %e, "failed to start instance");
                    }
                }
                AckResponse {
                    text: ACK_LAUNCHED.to_string(),
                }
            }
            _ => AckResponse {
                text: ACK_NOT_UNDERSTOOD.to_string(),
            },
        }
    }
}
