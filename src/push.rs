//! Push notification fallback for receivers with no live connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::{Ledger, LedgerError, PushSubscriptionRow};
use crate::logging;

pub const DEFAULT_PUSH_ICON: &str = "/icons/sevo-192.png";
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushData {
    pub url: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub data: PushData,
}

impl PushPayload {
    /// Notification for a freshly sent voice message.
    pub fn new_voice_message(sender_id: &str) -> Self {
        Self {
            title: format!("New voice message from {sender_id}"),
            body: "Tap to listen!".to_string(),
            icon: DEFAULT_PUSH_ICON.to_string(),
            data: PushData {
                url: format!("/chat/{sender_id}"),
                sender_id: sender_id.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The endpoint no longer exists; the subscription should be dropped.
    Gone,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid subscription keys: {0}")]
    InvalidKeys(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, subscription: &PushSubscriptionRow, payload: &PushPayload) -> PushOutcome;
}

/// Posts the payload as JSON straight to the subscription endpoint.
///
/// This is a placeholder transport: it does no VAPID signing and no payload
/// encryption, so browser push services reject what it sends.  It suits
/// gateways that accept plain JSON.  Put a real Web Push sender behind
/// [`PushSender`] to reach browsers.
pub struct HttpPushSender {
    agent: ureq::Agent,
}

impl HttpPushSender {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(PUSH_TIMEOUT).build(),
        }
    }
}

impl Default for HttpPushSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send(&self, subscription: &PushSubscriptionRow, payload: &PushPayload) -> PushOutcome {
        let keys: serde_json::Value = match serde_json::from_str(&subscription.keys) {
            Ok(keys) => keys,
            Err(e) => return PushOutcome::Failed(PushError::InvalidKeys(e).to_string()),
        };
        let body = serde_json::json!({
            "payload": payload,
            "keys": keys,
        });
        let agent = self.agent.clone();
        let endpoint = subscription.endpoint.clone();

        let result = tokio::task::spawn_blocking(move || {
            match agent.post(&endpoint).send_json(body) {
                Ok(_) => PushOutcome::Delivered,
                Err(ureq::Error::Status(404 | 410, _)) => PushOutcome::Gone,
                Err(ureq::Error::Status(code, _)) => {
                    PushOutcome::Failed(format!("push endpoint returned {code}"))
                }
                Err(err) => PushOutcome::Failed(err.to_string()),
            }
        })
        .await;

        result.unwrap_or_else(|e| PushOutcome::Failed(format!("push task failed: {e}")))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub delivered: usize,
    pub gone: usize,
    pub failed: usize,
}

/// Deliver `payload` to every subscription `user_id` has.  Subscriptions
/// whose endpoint is gone are deleted; other failures are only logged.
pub async fn deliver_push(
    ledger: &Arc<Ledger>,
    sender: &Arc<dyn PushSender>,
    user_id: &str,
    payload: &PushPayload,
) -> Result<PushReport, PushError> {
    let subscriptions = ledger.list_subscriptions(user_id)?;
    let mut report = PushReport::default();

    for subscription in &subscriptions {
        match sender.send(subscription, payload).await {
            PushOutcome::Delivered => report.delivered += 1,
            PushOutcome::Gone => {
                report.gone += 1;
                ledger.delete_subscription_by_id(subscription.id)?;
                tracing::info!(
                    user = %logging::user_id(user_id),
                    endpoint = %subscription.endpoint,
                    "push subscription gone, removed"
                );
            }
            PushOutcome::Failed(reason) => {
                report.failed += 1;
                tracing::warn!(
                    user = %logging::user_id(user_id),
                    endpoint = %subscription.endpoint,
                    %reason,
                    "push delivery failed"
                );
            }
        }
    }

    Ok(report)
}
