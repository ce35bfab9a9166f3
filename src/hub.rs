//! Composition root.
//!
//! The hub owns every registry, wires them together, and routes incoming
//! client messages to the right one. Embedders build a [`Hub`] per process,
//! hand it a [`ClusterTransport`], and feed it decoded messages per socket.

use crate::cluster::{ClusterRegistry, DistributedLockRegistry, StateRegistry};
use crate::config::Config;
use crate::error::MessageError;
use crate::listen::ListenerRegistry;
use crate::socket::SocketRef;
use crate::subscription::{SubscriptionActions, SubscriptionRegistry};
use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic, TopicKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One topic kind's registry pair.
struct TopicRegistries {
    client: Arc<SubscriptionRegistry>,
    listener: Arc<ListenerRegistry>,
}

impl TopicRegistries {
    fn new(
        kind: TopicKind,
        config: Arc<Config>,
        transport: Arc<dyn ClusterTransport>,
        locks: &Arc<DistributedLockRegistry>,
    ) -> Self {
        let client = SubscriptionRegistry::new(
            kind.data_topic(),
            kind.subscriptions_topic(),
            SubscriptionActions::default(),
            config.server.name.clone(),
            transport.clone(),
        );
        let listener = ListenerRegistry::new(
            kind,
            config,
            transport.clone(),
            client.clone(),
            locks.clone(),
        );
        client.set_subscription_listener(listener.clone());

        // Data published on another node fans out to local subscribers.
        let fan_out = client.clone();
        transport.subscribe(
            kind.data_topic(),
            Box::new(move |message, _origin| {
                let name = message.name.clone();
                fan_out.send_to_subscribers(&name, &message, None, true);
            }),
        );

        Self { client, listener }
    }
}

/// Owns and wires the coordination registries of one server process.
pub struct Hub {
    config: Arc<Config>,
    transport: Arc<dyn ClusterTransport>,
    cluster: Arc<ClusterRegistry>,
    locks: Arc<DistributedLockRegistry>,
    records: TopicRegistries,
    events: TopicRegistries,
    /// Extra per-topic state sets for embedders, built on first request.
    state_registries: Mutex<HashMap<Topic, Arc<StateRegistry>>>,
}

impl Hub {
    /// Build a fully wired hub. Call [`Hub::start`] to join the cluster.
    pub fn new(config: Arc<Config>, transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        let cluster = ClusterRegistry::new(config.clone(), transport.clone());
        let locks = DistributedLockRegistry::new(config.clone(), cluster.clone(), transport.clone());

        let records = TopicRegistries::new(
            TopicKind::Record,
            config.clone(),
            transport.clone(),
            &locks,
        );
        let events = TopicRegistries::new(
            TopicKind::Event,
            config.clone(),
            transport.clone(),
            &locks,
        );

        // A node dropping out of the cluster takes its replicated names
        // with it.
        let purged: Vec<Arc<StateRegistry>> = records
            .listener
            .state_registries()
            .into_iter()
            .chain(events.listener.state_registries())
            .chain([
                records.client.state().clone(),
                events.client.state().clone(),
            ])
            .collect();
        cluster.on_node_removed(move |server| {
            for registry in &purged {
                registry.remove_server(server);
            }
        });

        info!(server = %config.server.name, "hub wired");
        Arc::new(Self {
            config,
            transport,
            cluster,
            locks,
            records,
            events,
            state_registries: Mutex::new(HashMap::new()),
        })
    }

    /// Join the cluster: begin status gossip and the inactive-node sweep.
    pub fn start(&self) {
        self.cluster.start();
    }

    /// Leave the cluster. Idempotent.
    pub fn shutdown(&self) {
        self.cluster.leave_cluster();
    }

    /// The hub's configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Cluster membership and leader election.
    pub fn cluster(&self) -> &Arc<ClusterRegistry> {
        &self.cluster
    }

    /// Cluster-wide named leases.
    pub fn locks(&self) -> &Arc<DistributedLockRegistry> {
        &self.locks
    }

    /// The client subscription registry for `kind`.
    pub fn subscriptions(&self, kind: TopicKind) -> &Arc<SubscriptionRegistry> {
        &self.registries(kind).client
    }

    /// The provider discovery registry for `kind`.
    pub fn listeners(&self, kind: TopicKind) -> &Arc<ListenerRegistry> {
        &self.registries(kind).listener
    }

    /// A shared replicated state set on `topic`, built on first request.
    pub fn state_registry(&self, topic: Topic) -> Arc<StateRegistry> {
        self.state_registries
            .lock()
            .entry(topic)
            .or_insert_with(|| {
                StateRegistry::new(topic, self.config.server.name.clone(), self.transport.clone())
            })
            .clone()
    }

    /// Route a decoded client message to its registry.
    pub fn route(&self, socket: &SocketRef, message: &Message) -> Result<(), MessageError> {
        let kind = match message.topic {
            Topic::Record => TopicKind::Record,
            Topic::Event => TopicKind::Event,
            topic => {
                return Err(MessageError::Unroutable {
                    topic,
                    action: message.action,
                });
            }
        };

        debug!(topic = ?message.topic, action = ?message.action, name = %message.name,
            user = %socket.user(), "routing message");
        let registries = self.registries(kind);
        match message.action {
            Action::Subscribe => registries.client.subscribe(message, socket, false),
            Action::Unsubscribe => registries.client.unsubscribe(message, socket, false),
            Action::Listen
            | Action::Unlisten
            | Action::ListenAccept
            | Action::ListenReject => registries.listener.handle(socket, message),
            action => {
                return Err(MessageError::Unroutable {
                    topic: message.topic,
                    action,
                });
            }
        }
        Ok(())
    }

    fn registries(&self, kind: TopicKind) -> &TopicRegistries {
        match kind {
            TopicKind::Record => &self.records,
            TopicKind::Event => &self.events,
        }
    }
}
