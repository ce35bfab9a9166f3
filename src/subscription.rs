//! Per-topic subscription bookkeeping and fan-out.
//!
//! One registry maps subscription names to the local sockets that want them,
//! replicates name presence (not subscriber lists) cluster-wide through a
//! [`StateRegistry`], and fans messages out to local subscribers. The same
//! type backs provider-pattern registration in the listen module, with the
//! ack actions swapped.

use crate::cluster::StateRegistry;
use crate::metrics;
use crate::socket::{CloseHookId, SocketId, SocketRef};
use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Callbacks fired as subscriptions come and go.
///
/// `on_first_subscription_made` / `on_last_subscription_removed` are
/// cluster-wide edges (a name appearing or vanishing anywhere); the other two
/// fire once per local socket.
pub trait SubscriptionListener: Send + Sync {
    /// `name` gained its first subscriber anywhere in the cluster.
    fn on_first_subscription_made(&self, name: &str);
    /// A local socket subscribed to `name`.
    fn on_subscription_made(&self, name: &str, socket: &SocketRef);
    /// A local socket unsubscribed from `name`.
    fn on_subscription_removed(&self, name: &str, socket: &SocketRef);
    /// `name` lost its last subscriber everywhere in the cluster.
    fn on_last_subscription_removed(&self, name: &str);
}

/// The ack and notice actions a registry answers with. Client registries use
/// the subscribe vocabulary; the listen module swaps in `Listen`/`Unlisten`.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionActions {
    pub subscribe: Action,
    pub unsubscribe: Action,
    pub multiple_subscriptions: Action,
    pub not_subscribed: Action,
}

impl Default for SubscriptionActions {
    fn default() -> Self {
        Self {
            subscribe: Action::Subscribe,
            unsubscribe: Action::Unsubscribe,
            multiple_subscriptions: Action::MultipleSubscriptions,
            not_subscribed: Action::NotSubscribed,
        }
    }
}

impl SubscriptionActions {
    /// Vocabulary for provider-pattern registration.
    pub fn listen() -> Self {
        Self {
            subscribe: Action::Listen,
            unsubscribe: Action::Unlisten,
            ..Self::default()
        }
    }
}

struct SocketState {
    socket: SocketRef,
    names: HashSet<String>,
    close_hook: CloseHookId,
}

// Subscribers are kept in subscription order so downstream consumers
// (candidate lists in the listen module) see a deterministic ordering.
#[derive(Default)]
struct Subscriptions {
    by_name: HashMap<String, Vec<SocketRef>>,
    by_socket: HashMap<SocketId, SocketState>,
}

/// Tracks which local sockets subscribe to which names for one topic.
pub struct SubscriptionRegistry {
    topic: Topic,
    actions: SubscriptionActions,
    server_name: String,
    transport: Arc<dyn ClusterTransport>,
    state: Arc<StateRegistry>,
    subscriptions: Mutex<Subscriptions>,
    listener: Mutex<Option<Arc<dyn SubscriptionListener>>>,
    bulk_ids: Arc<Mutex<HashSet<u64>>>,
    bulk_purge: tokio::task::JoinHandle<()>,
}

impl SubscriptionRegistry {
    /// Create a registry whose name presence replicates on `cluster_topic`.
    /// `topic` is the topic stamped on messages back to sockets.
    pub fn new(
        topic: Topic,
        cluster_topic: Topic,
        actions: SubscriptionActions,
        server_name: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let server_name = server_name.into();
        let bulk_ids: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        // Bounded, approximate dedup window for bulk acks.
        let purged = bulk_ids.clone();
        let bulk_purge = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                purged.lock().clear();
            }
        });

        Arc::new(Self {
            topic,
            actions,
            state: StateRegistry::new(cluster_topic, server_name.clone(), transport.clone()),
            server_name,
            transport,
            subscriptions: Mutex::new(Subscriptions::default()),
            listener: Mutex::new(None),
            bulk_ids,
            bulk_purge,
        })
    }

    /// Install the listener and wire the cluster-wide first/last edges to it.
    pub fn set_subscription_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        *self.listener.lock() = Some(listener.clone());
        let on_add = listener.clone();
        self.state
            .on_add(move |name| on_add.on_first_subscription_made(name));
        self.state
            .on_remove(move |name| listener.on_last_subscription_removed(name));
    }

    /// Add `socket` as a subscriber of `message.name`.
    pub fn subscribe(self: &Arc<Self>, message: &Message, socket: &SocketRef, silent: bool) {
        let name = message.name.clone();
        {
            let mut subs = self.subscriptions.lock();
            let sockets = subs.by_name.entry(name.clone()).or_default();
            if sockets.contains(socket) {
                drop(subs);
                warn!(topic = ?self.topic, name = %name, user = %socket.user(),
                    "repeat subscription");
                socket.send_message(message.notice(self.actions.multiple_subscriptions));
                return;
            }
            sockets.push(socket.clone());

            let socket_id = socket.id();
            if let Some(state) = subs.by_socket.get_mut(&socket_id) {
                state.names.insert(name.clone());
            } else {
                let registry = Arc::downgrade(self);
                let close_hook = socket.on_close(move |closed| {
                    if let Some(registry) = registry.upgrade() {
                        registry.on_socket_close(closed);
                    }
                });
                let mut names = HashSet::new();
                names.insert(name.clone());
                subs.by_socket.insert(
                    socket_id,
                    SocketState {
                        socket: socket.clone(),
                        names,
                        close_hook,
                    },
                );
            }
        }
        metrics::active_subscriptions().inc();

        // Ack before the listener edges run: anything discovery sends the
        // subscriber (a has-provider update, say) must arrive after the ack.
        if !silent {
            self.acknowledge(message, socket, self.actions.subscribe);
        }

        // State replication first so the cluster-wide first-subscriber edge
        // fires before the per-socket callback.
        self.state.add(&name);
        self.notify(|listener| listener.on_subscription_made(&name, socket));
    }

    /// Remove `socket` from the subscribers of `message.name`.
    pub fn unsubscribe(&self, message: &Message, socket: &SocketRef, silent: bool) {
        let name = message.name.clone();
        let removed = {
            let mut subs = self.subscriptions.lock();
            match subs.by_name.get_mut(&name) {
                Some(sockets) if sockets.contains(socket) => {
                    sockets.retain(|s| s != socket);
                    if sockets.is_empty() {
                        subs.by_name.remove(&name);
                    }
                    self.detach_socket_name(&mut subs, socket, &name);
                    true
                }
                _ => false,
            }
        };

        if !removed {
            if !silent {
                warn!(topic = ?self.topic, name = %name, user = %socket.user(),
                    "not subscribed");
                socket.send_message(message.notice(self.actions.not_subscribed));
            }
            return;
        }
        metrics::active_subscriptions().dec();

        if !silent {
            self.acknowledge(message, socket, self.actions.unsubscribe);
        }

        // State withdrawal first, mirroring the subscribe side: the
        // cluster-wide last-subscriber edge fires before the per-socket one.
        self.state.remove(&name);
        self.notify(|listener| listener.on_subscription_removed(&name, socket));
    }

    /// Deliver `message` to every local subscriber of `name` except `sender`.
    /// When the sender is a local socket and `suppress_remote` is false the
    /// message is also forwarded once to the cluster; messages arriving from
    /// the cluster fan out with `sender` `None` and `suppress_remote` true.
    pub fn send_to_subscribers(
        &self,
        name: &str,
        message: &Message,
        sender: Option<&SocketRef>,
        suppress_remote: bool,
    ) {
        if sender.is_some() && !suppress_remote {
            self.transport.send(message.clone());
        }

        let subscribers: Vec<SocketRef> = {
            let subs = self.subscriptions.lock();
            match subs.by_name.get(name) {
                Some(sockets) => sockets.clone(),
                None => return,
            }
        };
        for socket in &subscribers {
            if Some(socket) != sender {
                socket.send_message(message.clone());
            }
        }
    }

    /// Every server with at least one subscriber of `name`.
    pub fn get_all_servers(&self, name: &str) -> Vec<String> {
        self.state.get_all_servers(name)
    }

    /// Every other server with at least one subscriber of `name`.
    pub fn get_all_remote_servers(&self, name: &str) -> Vec<String> {
        let mut servers = self.state.get_all_servers(name);
        servers.retain(|server| *server != self.server_name);
        servers
    }

    /// All names subscribed anywhere in the cluster.
    pub fn get_names(&self) -> Vec<String> {
        self.state.get_all()
    }

    /// Name to subscribing-server-count, cluster-wide.
    pub fn get_names_map(&self) -> HashMap<String, usize> {
        self.state.get_all_map()
    }

    /// True if `name` is subscribed anywhere in the cluster.
    pub fn has_name(&self, name: &str) -> bool {
        self.state.has(name)
    }

    /// Local subscribers of `name`.
    pub fn get_local_subscribers(&self, name: &str) -> Vec<SocketRef> {
        let subs = self.subscriptions.lock();
        subs.by_name.get(name).cloned().unwrap_or_default()
    }

    /// True if any local socket subscribes to `name`.
    pub fn has_local_subscribers(&self, name: &str) -> bool {
        self.subscriptions.lock().by_name.contains_key(name)
    }

    /// The cluster presence set backing this registry.
    pub(crate) fn state(&self) -> &Arc<StateRegistry> {
        &self.state
    }

    fn acknowledge(&self, message: &Message, socket: &SocketRef, action: Action) {
        if let Some(bulk) = &message.bulk {
            // First occurrence of a bulk id is acked, duplicates dropped.
            if !self.bulk_ids.lock().insert(bulk.id) {
                return;
            }
            let mut ack = Message::new(message.topic, bulk.action, &message.name).as_ack();
            ack.correlation_id = message.correlation_id.clone();
            socket.send_message(ack);
        } else {
            debug!(topic = ?self.topic, name = %message.name, user = %socket.user(),
                action = ?action);
            socket.send_ack_message(message);
        }
    }

    /// Drop `name` from the socket's reverse index, detaching the close hook
    /// on the socket's last subscription.
    fn detach_socket_name(&self, subs: &mut Subscriptions, socket: &SocketRef, name: &str) {
        let socket_id = socket.id();
        if let Some(state) = subs.by_socket.get_mut(&socket_id) {
            state.names.remove(name);
            if state.names.is_empty() {
                let state = subs.by_socket.remove(&socket_id).unwrap();
                socket.remove_on_close(state.close_hook);
            }
        }
    }

    fn on_socket_close(self: &Arc<Self>, socket: &SocketRef) {
        let names = {
            let mut subs = self.subscriptions.lock();
            match subs.by_socket.remove(&socket.id()) {
                Some(state) => {
                    for name in &state.names {
                        if let Some(sockets) = subs.by_name.get_mut(name) {
                            sockets.retain(|s| s != socket);
                            if sockets.is_empty() {
                                subs.by_name.remove(name);
                            }
                        }
                    }
                    state.names
                }
                None => {
                    warn!(topic = ?self.topic, user = %socket.user(),
                        "socket closed with no tracked subscriptions");
                    return;
                }
            }
        };

        for name in &names {
            metrics::active_subscriptions().dec();
            self.state.remove(name);
            self.notify(|listener| listener.on_subscription_removed(name, socket));
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn SubscriptionListener)) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.bulk_purge.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use drift_proto::{BulkInfo, TopicKind};
    use tokio::sync::mpsc;

    fn registry() -> Arc<SubscriptionRegistry> {
        SubscriptionRegistry::new(
            Topic::Event,
            TopicKind::Event.subscriptions_topic(),
            SubscriptionActions::default(),
            "server-1",
            Arc::new(LoopbackTransport::new()),
        )
    }

    fn socket(user: &str) -> (SocketRef, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketRef::new(user, tx), rx)
    }

    fn sub(name: &str) -> Message {
        Message::new(Topic::Event, Action::Subscribe, name)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SubscriptionListener for Recorder {
        fn on_first_subscription_made(&self, name: &str) {
            self.events.lock().push(format!("first:{name}"));
        }
        fn on_subscription_made(&self, name: &str, _socket: &SocketRef) {
            self.events.lock().push(format!("made:{name}"));
        }
        fn on_subscription_removed(&self, name: &str, _socket: &SocketRef) {
            self.events.lock().push(format!("removed:{name}"));
        }
        fn on_last_subscription_removed(&self, name: &str) {
            self.events.lock().push(format!("last:{name}"));
        }
    }

    #[tokio::test]
    async fn duplicate_subscribe_gets_notice_without_state_change() {
        let registry = registry();
        let (socket, mut rx) = socket("alice");

        registry.subscribe(&sub("news"), &socket, false);
        let ack = rx.try_recv().unwrap();
        assert!(ack.is_ack);

        registry.subscribe(&sub("news"), &socket, false);
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.action, Action::MultipleSubscriptions);
        assert_eq!(notice.original_action, Some(Action::Subscribe));
        assert_eq!(registry.get_local_subscribers("news").len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_gets_notice() {
        let registry = registry();
        let (socket, mut rx) = socket("alice");

        registry.unsubscribe(&Message::new(Topic::Event, Action::Unsubscribe, "news"), &socket, false);
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.action, Action::NotSubscribed);
    }

    #[tokio::test]
    async fn first_and_last_edges_fire_around_per_socket_callbacks() {
        let registry = registry();
        let recorder = Arc::new(Recorder::default());
        registry.set_subscription_listener(recorder.clone());

        let (a, _rx_a) = socket("alice");
        let (b, _rx_b) = socket("bob");
        registry.subscribe(&sub("news"), &a, false);
        registry.subscribe(&sub("news"), &b, false);
        registry.unsubscribe(&Message::new(Topic::Event, Action::Unsubscribe, "news"), &a, false);
        registry.unsubscribe(&Message::new(Topic::Event, Action::Unsubscribe, "news"), &b, false);

        // The cluster-wide edges bracket the per-socket callbacks on both
        // sides: first before made, last before the final removed.
        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                "first:news",
                "made:news",
                "made:news",
                "removed:news",
                "last:news",
                "removed:news",
            ]
        );
    }

    #[tokio::test]
    async fn socket_close_unsubscribes_everything() {
        let registry = registry();
        let recorder = Arc::new(Recorder::default());
        registry.set_subscription_listener(recorder.clone());

        let (socket, _rx) = socket("alice");
        registry.subscribe(&sub("a"), &socket, false);
        registry.subscribe(&sub("b"), &socket, false);

        socket.close();
        assert!(!registry.has_local_subscribers("a"));
        assert!(!registry.has_local_subscribers("b"));
        let events = recorder.events.lock().clone();
        for name in ["a", "b"] {
            let last = events.iter().position(|e| e == &format!("last:{name}"));
            let removed = events.iter().position(|e| e == &format!("removed:{name}"));
            assert!(last.is_some() && last < removed, "close edges out of order: {events:?}");
        }
    }

    #[tokio::test]
    async fn bulk_ids_are_acked_once() {
        let registry = registry();
        let (socket, mut rx) = socket("alice");

        let bulk = BulkInfo {
            id: 7,
            action: Action::Subscribe,
        };
        registry.subscribe(&sub("a").with_bulk(bulk), &socket, false);
        registry.subscribe(&sub("b").with_bulk(bulk), &socket, false);

        let ack = rx.try_recv().unwrap();
        assert!(ack.is_ack);
        assert!(rx.try_recv().is_err());
        assert!(registry.has_local_subscribers("b"));
    }

    #[tokio::test]
    async fn fan_out_skips_the_sender() {
        let registry = registry();
        let (a, mut rx_a) = socket("alice");
        let (b, mut rx_b) = socket("bob");
        registry.subscribe(&sub("news"), &a, false);
        registry.subscribe(&sub("news"), &b, false);
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        let update = Message::new(Topic::Event, Action::Subscribe, "news");
        registry.send_to_subscribers("news", &update, Some(&a), true);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().name, "news");
    }
}
