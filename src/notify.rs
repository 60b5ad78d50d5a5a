//! Completion notifications.
//!
//! Delivery is best-effort: the engine logs dispatcher errors and never
//! propagates them.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{QueueId, StateCounts};

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Attempt delivery of `message` to `destination`.
    async fn dispatch(&self, destination: &str, message: &Message) -> Result<()>;
}

/// A notification to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub body: String,
}

impl Message {
    pub fn queue_complete(queue: QueueId, counts: &StateCounts) -> Self {
        Self {
            title: format!("taskq: queue {queue} complete"),
            body: format!("Queue {queue} has no waiting or assigned tasks left ({counts})."),
        }
    }
}

/// Pushes notes to an HTTP push service.
///
/// The destination is sent as the channel tag; the service token goes in the
/// `Access-Token` header.
pub struct PushDispatcher {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl PushDispatcher {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl NotificationDispatcher for PushDispatcher {
    async fn dispatch(&self, destination: &str, message: &Message) -> Result<()> {
        let payload = serde_json::json!({
            "type": "note",
            "channel_tag": destination,
            "title": message.title,
            "body": message.body,
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(ref token) = self.token {
            request = request.header("Access-Token", token.expose_secret());
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Notify(format!(
                "push service returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Dispatcher used when no push service is configured.
pub struct NoopDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopDispatcher {
    async fn dispatch(&self, destination: &str, message: &Message) -> Result<()> {
        debug!(destination, title = %message.title, "notification dropped: no push service configured");
        Ok(())
    }
}
