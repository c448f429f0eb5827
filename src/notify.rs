use serde::{Deserialize, Serialize};
use tracing::info;

/// Terminal outcome delivered to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    Success { result: String },
    Failure { reason: String },
}

impl NotificationPayload {
    /// Text rendering used for chat channels.
    pub fn text(&self) -> String {
        match self {
            NotificationPayload::Success { result } => format!("Finished. The result is {result}."),
            NotificationPayload::Failure { reason } => format!("The job failed: {reason}."),
        }
    }
}

/// Delivery failure. A separate failure domain from orchestration: the
/// instance's terminal state stands whether or not the push went out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub recipient: String,
    pub message: String,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery to {} failed: {}", self.recipient, self.message)
    }
}

impl std::error::Error for DeliveryError {}

/// Delivers a result payload to the external channel addressee identified by
/// the correlation key.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, recipient: &str, payload: NotificationPayload) -> Result<(), DeliveryError>;
}

/// Push-channel credentials, injected once at notifier construction rather
/// than re-read per delivery.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub access_token: String,
}

/// Outbound chat transport, implemented by the embedding application
/// (e.g. a messaging API client).
#[async_trait::async_trait]
pub trait PushChannel: Send + Sync {
    async fn push_text(&self, access_token: &str, to: &str, text: String) -> Result<(), String>;
}

/// Notifier that renders payloads to text and pushes them through a channel.
pub struct ChannelNotifier<C> {
    channel: C,
    config: PushConfig,
}

impl<C: PushChannel> ChannelNotifier<C> {
    pub fn new(channel: C, config: PushConfig) -> Self {
        Self { channel, config }
    }
}

#[async_trait::async_trait]
impl<C: PushChannel> Notifier for ChannelNotifier<C> {
    async fn deliver(&self, recipient: &str, payload: NotificationPayload) -> Result<(), DeliveryError> {
        self.channel
            .push_text(&self.config.access_token, recipient, payload.text())
            .await
            .map_err(|message| DeliveryError {
                recipient: recipient.to_string(),
                message,
            })
    }
}

/// Stand-in notifier for local runs: writes the would-be push to the log.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, recipient: &str, payload: NotificationPayload) -> Result<(), DeliveryError> {
        info!(target: "longrun::notify", recipient = %recipient, message = %payload.text(), "push notification");
        Ok(())
    }
}
