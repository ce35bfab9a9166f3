//! Topics and actions.
//!
//! Every [`crate::Message`] is addressed by a `(Topic, Action)` pair. Client
//! traffic flows on the data topics (`Record`, `Event`); the remaining topics
//! are internal cluster channels. Rather than branching on per-topic action
//! tables at runtime, Drift resolves the per-kind companion topics once,
//! through [`TopicKind`].

use serde::{Deserialize, Serialize};

/// A message channel, both client-facing and cluster-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    /// Stateful named documents; provider presence is observable.
    Record,
    /// Fire-and-forget named streams; provider presence is not broadcast.
    Event,
    /// Cluster replication of record subscription names.
    RecordSubscriptions,
    /// Cluster replication of event subscription names.
    EventSubscriptions,
    /// Cluster replication of record provider patterns.
    RecordListenPatterns,
    /// Cluster replication of event provider patterns.
    EventListenPatterns,
    /// Cluster replication of record names that currently have a provider.
    RecordPublishedSubscriptions,
    /// Cluster replication of event names that currently have a provider.
    EventPublishedSubscriptions,
    /// Leader-to-follower discovery orchestration for records.
    RecordListening,
    /// Leader-to-follower discovery orchestration for events.
    EventListening,
    /// Node liveness gossip.
    Cluster,
    /// Distributed lock request/response traffic.
    Lock,
}

/// The two client-facing data topics, used to derive their companion
/// cluster topics exactly once at registry construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// See [`Topic::Record`].
    Record,
    /// See [`Topic::Event`].
    Event,
}

impl TopicKind {
    /// The client-facing data topic.
    pub fn data_topic(self) -> Topic {
        match self {
            TopicKind::Record => Topic::Record,
            TopicKind::Event => Topic::Event,
        }
    }

    /// The topic on which subscription names are replicated cluster-wide.
    pub fn subscriptions_topic(self) -> Topic {
        match self {
            TopicKind::Record => Topic::RecordSubscriptions,
            TopicKind::Event => Topic::EventSubscriptions,
        }
    }

    /// The topic on which provider patterns are replicated cluster-wide.
    pub fn listen_patterns_topic(self) -> Topic {
        match self {
            TopicKind::Record => Topic::RecordListenPatterns,
            TopicKind::Event => Topic::EventListenPatterns,
        }
    }

    /// The topic on which actively-provided names are replicated.
    pub fn published_subscriptions_topic(self) -> Topic {
        match self {
            TopicKind::Record => Topic::RecordPublishedSubscriptions,
            TopicKind::Event => Topic::EventPublishedSubscriptions,
        }
    }

    /// The point-to-point topic used by the discovery leader to drive
    /// follower nodes.
    pub fn listening_topic(self) -> Topic {
        match self {
            TopicKind::Record => Topic::RecordListening,
            TopicKind::Event => Topic::EventListening,
        }
    }

    /// Whether subscribers on this topic are told about provider presence.
    ///
    /// Records expose `SUBSCRIPTION_HAS_PROVIDER`/`_NO_PROVIDER`; events do
    /// not, since event subscribers have no use for the information.
    pub fn broadcasts_provider_state(self) -> bool {
        matches!(self, TopicKind::Record)
    }
}

/// What a message asks for or announces.
///
/// The same action name may appear on several topics (`Remove` is both a
/// cluster-node departure and a state-set deletion); the topic disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Client wants updates for a name.
    Subscribe,
    /// Client no longer wants updates for a name.
    Unsubscribe,
    /// Notice: the socket already holds this subscription.
    MultipleSubscriptions,
    /// Notice: the socket is not subscribed to this name.
    NotSubscribed,
    /// Provider offers to serve names matching a pattern.
    Listen,
    /// Provider withdraws a pattern.
    Unlisten,
    /// Provider accepts a discovery offer.
    ListenAccept,
    /// Provider declines a discovery offer.
    ListenReject,
    /// Registry offers a subscription to a provider.
    SubscriptionForPatternFound,
    /// Registry revokes a provider's offer or active role.
    SubscriptionForPatternRemoved,
    /// Notice: the provider's offer window expired without a response.
    ListenResponseTimeout,
    /// Subscribers: the name now has an active provider.
    SubscriptionHasProvider,
    /// Subscribers: the name has no active provider.
    SubscriptionHasNoProvider,
    /// Notice: a LISTEN pattern failed to compile.
    InvalidListenRegex,
    /// Cluster gossip: node liveness and leader score.
    Status,
    /// Cluster: node departure, or state-set entry deletion.
    Remove,
    /// State-set entry addition.
    Add,
    /// Lock acquisition request (follower to leader).
    Request,
    /// Lock release (any node to leader).
    Release,
    /// Lock decision (leader to follower).
    Response,
}
