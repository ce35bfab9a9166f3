//! The message struct and its builders.

use serde::{Deserialize, Serialize};

use crate::{Action, Topic};

/// Marks a subscribe/unsubscribe as part of a client-side bulk operation.
///
/// The server acknowledges only the first message carrying a given `id`
/// within the dedup window, using `action` as the ack action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkInfo {
    /// Client-chosen identifier shared by every message of the bulk.
    pub id: u64,
    /// Action to acknowledge the bulk with.
    pub action: Action,
}

/// A single protocol message.
///
/// Field conventions follow the listen protocol: for discovery traffic
/// (`Listen`, `ListenAccept`, `SubscriptionForPatternFound`, ...) `name`
/// carries the provider *pattern* and `subscription` the record/event name
/// the pattern matched. For everything else `name` is the subject itself -
/// a subscription name, a lock name or a server name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel this message belongs to.
    pub topic: Topic,
    /// What the message asks for or announces.
    pub action: Action,
    /// Primary subject (see struct docs).
    pub name: String,
    /// Subscription name, when `name` holds a pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Structured payload (cluster status bodies, provider flags, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Correlates a response with the request that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// True when this message acknowledges an earlier one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_ack: bool,
    /// For notices, the action of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_action: Option<Action>,
    /// Present when this message is part of a bulk operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk: Option<BulkInfo>,
}

impl Message {
    /// Create a message with the given topic, action and subject name.
    pub fn new(topic: Topic, action: Action, name: impl Into<String>) -> Self {
        Self {
            topic,
            action,
            name: name.into(),
            subscription: None,
            data: None,
            correlation_id: None,
            is_ack: false,
            original_action: None,
            bulk: None,
        }
    }

    /// Attach the subscription name (for pattern-addressed messages).
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach bulk-operation metadata.
    pub fn with_bulk(mut self, bulk: BulkInfo) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// Mark this message as an acknowledgement.
    pub fn as_ack(mut self) -> Self {
        self.is_ack = true;
        self
    }

    /// Build the acknowledgement for this message.
    pub fn ack(&self) -> Self {
        let mut ack = self.clone();
        ack.is_ack = true;
        ack
    }

    /// Build a notice answering this message with a different action.
    pub fn notice(&self, action: Action) -> Self {
        let mut notice = Message::new(self.topic, action, self.name.clone());
        notice.subscription = self.subscription.clone();
        notice.correlation_id = self.correlation_id.clone();
        notice.original_action = Some(self.action);
        notice
    }

    /// The name discovery traffic is about: `subscription` when present,
    /// otherwise `name`.
    pub fn subscription_name(&self) -> &str {
        self.subscription.as_deref().unwrap_or(&self.name)
    }
}
