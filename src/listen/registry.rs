//! The discovery race.
//!
//! One race per subscription name: candidates whose pattern matches are
//! offered the name one at a time, each offer bounded by the timeout
//! registry, until a provider accepts or the list drains. Cross-node races
//! are serialized through the lock registry; the node holding the lock
//! leads, walking the remote candidate servers after its own local stage.

use crate::cluster::{LockRegistry, StateRegistry};
use crate::config::Config;
use crate::listen::{ListenerTimeoutRegistry, Provider};
use crate::metrics;
use crate::socket::SocketRef;
use crate::subscription::{SubscriptionActions, SubscriptionListener, SubscriptionRegistry};
use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic, TopicKind};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A race in flight for one name. `current` is the provider holding the
/// one outstanding offer; the queue holds everyone still waiting a turn.
struct ListenInProgress {
    current: Option<Provider>,
    queue: VecDeque<Provider>,
}

/// Matches provider patterns against subscription names and drives the
/// offer/accept/reject/timeout race to exactly one active provider or none.
pub struct ListenerRegistry {
    kind: TopicKind,
    topic: Topic,
    listening_topic: Topic,
    config: Arc<Config>,
    server_name: String,
    transport: Arc<dyn ClusterTransport>,
    client_registry: Arc<SubscriptionRegistry>,
    provider_registry: Arc<SubscriptionRegistry>,
    timeouts: ListenerTimeoutRegistry,
    lock_registry: Arc<dyn LockRegistry>,
    /// Names provided somewhere in the cluster.
    cluster_provided: Arc<StateRegistry>,
    /// Compiled patterns in registration order.
    patterns: Mutex<Vec<(String, Regex)>>,
    races: Mutex<HashMap<String, ListenInProgress>>,
    /// Names actively provided by a local socket.
    locally_provided: Mutex<HashMap<String, Provider>>,
    /// Remote servers still to try, per name this node is leading.
    leading_listen: Mutex<HashMap<String, VecDeque<String>>>,
    /// Leader to ack once the local stage ends, per remote-led name.
    lead_listen: Mutex<HashMap<String, String>>,
    weak_self: Weak<ListenerRegistry>,
}

impl ListenerRegistry {
    /// Build the registry for one topic kind and attach it to the cluster.
    /// The caller still has to install it as the client registry's
    /// subscription listener.
    pub fn new(
        kind: TopicKind,
        config: Arc<Config>,
        transport: Arc<dyn ClusterTransport>,
        client_registry: Arc<SubscriptionRegistry>,
        lock_registry: Arc<dyn LockRegistry>,
    ) -> Arc<Self> {
        let server_name = config.server.name.clone();

        let provider_registry = SubscriptionRegistry::new(
            kind.data_topic(),
            kind.listen_patterns_topic(),
            SubscriptionActions::listen(),
            server_name.clone(),
            transport.clone(),
        );
        let cluster_provided = StateRegistry::new(
            kind.published_subscriptions_topic(),
            server_name.clone(),
            transport.clone(),
        );

        let registry = Arc::new_cyclic(|weak| Self {
            kind,
            topic: kind.data_topic(),
            listening_topic: kind.listening_topic(),
            timeouts: ListenerTimeoutRegistry::new(kind.data_topic(), config.listen_response_timeout()),
            config,
            server_name,
            transport,
            client_registry,
            provider_registry,
            lock_registry,
            cluster_provided,
            patterns: Mutex::new(Vec::new()),
            races: Mutex::new(HashMap::new()),
            locally_provided: Mutex::new(HashMap::new()),
            leading_listen: Mutex::new(HashMap::new()),
            lead_listen: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        });

        registry
            .provider_registry
            .set_subscription_listener(Arc::new(ProviderPatterns(registry.weak_self.clone())));

        let on_add = registry.weak_self.clone();
        registry.cluster_provided.on_add(move |name| {
            if let Some(registry) = on_add.upgrade() {
                registry.on_start_provided(name);
            }
        });
        let on_remove = registry.weak_self.clone();
        registry.cluster_provided.on_remove(move |name| {
            if let Some(registry) = on_remove.upgrade() {
                registry.on_stop_provided(name);
            }
        });

        let incoming = registry.weak_self.clone();
        registry.transport.subscribe(
            registry.listening_topic,
            Box::new(move |message, origin| {
                if let Some(registry) = incoming.upgrade() {
                    registry.on_listening_message(message, origin);
                }
            }),
        );

        registry
    }

    /// True if a provider for `name` exists anywhere in the cluster.
    pub fn has_active_provider(&self, name: &str) -> bool {
        self.cluster_provided.has(name)
    }

    /// The replicated state sets owned by this component, for node-removal
    /// purging at the composition root.
    pub(crate) fn state_registries(&self) -> [Arc<StateRegistry>; 2] {
        [
            self.provider_registry.state().clone(),
            self.cluster_provided.clone(),
        ]
    }

    /// Dispatch a provider-facing message: `Listen`, `Unlisten`,
    /// `ListenAccept` or `ListenReject`.
    pub fn handle(&self, socket: &SocketRef, message: &Message) {
        match message.action {
            Action::Listen => self.add_listener(socket, message),
            Action::Unlisten => {
                // Pattern removal and any race/active cleanup run through
                // the provider registry's removal callback.
                self.provider_registry.unsubscribe(message, socket, false);
            }
            Action::ListenAccept | Action::ListenReject => {
                self.handle_listen_response(socket, message);
            }
            action => {
                warn!(topic = ?self.topic, ?action, user = %socket.user(),
                    "unroutable listen message");
            }
        }
    }

    fn add_listener(&self, socket: &SocketRef, message: &Message) {
        let pattern = &message.name;
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(topic = ?self.topic, pattern = %pattern, user = %socket.user(),
                    %err, "invalid listen pattern");
                socket.send_message(message.notice(Action::InvalidListenRegex));
                return;
            }
        };

        self.provider_registry.subscribe(message, socket, false);
        self.reconcile_subscriptions_to_patterns(&regex, pattern, socket);
    }

    /// A new listener immediately joins in-flight races for matching names
    /// and starts discovery for matching names that lack a provider.
    fn reconcile_subscriptions_to_patterns(&self, regex: &Regex, pattern: &str, socket: &SocketRef) {
        for name in self.client_registry.get_names() {
            if self.locally_provided.lock().contains_key(&name) {
                continue;
            }
            if !regex.is_match(&name) {
                continue;
            }
            let joined = {
                let mut races = self.races.lock();
                match races.get_mut(&name) {
                    Some(race) => {
                        race.queue.push_back(Provider {
                            socket: socket.clone(),
                            pattern: pattern.to_string(),
                        });
                        true
                    }
                    None => false,
                }
            };
            if !joined {
                self.start_discovery(&name);
            }
        }
    }

    fn handle_listen_response(&self, socket: &SocketRef, message: &Message) {
        let pattern = message.name.clone();
        let name = message.subscription_name().to_string();

        let current = {
            let races = self.races.lock();
            races.get(&name).and_then(|race| race.current.clone())
        };
        match current {
            Some(provider) if provider.matches(socket, &pattern) => {
                // Whoever removes the pending offer entry owns the advance;
                // if the expiry timer got there first the response is late.
                if !self.timeouts.try_resolve(&name, socket, &pattern) {
                    self.timeouts.handle(socket, message.action, &pattern, &name);
                    return;
                }
                if message.action == Action::ListenAccept {
                    self.accept(provider, &name);
                    self.timeouts.reject_late_responder_that_accepted(&name);
                    self.timeouts.clear(&name);
                } else {
                    self.trigger_next_provider(&name);
                }
            }
            _ if self.timeouts.is_a_late_responder(socket, &pattern, &name) => {
                self.timeouts.handle(socket, message.action, &pattern, &name);
            }
            _ => {
                warn!(topic = ?self.topic, name = %name, pattern = %pattern,
                    user = %socket.user(), action = ?message.action,
                    "listen response for unknown offer");
            }
        }
    }

    /// Promote `provider` to active for `name` and publish the fact.
    fn accept(&self, provider: Provider, name: &str) {
        self.timeouts.clear_timeout(name);
        self.races.lock().remove(name);

        debug!(topic = ?self.topic, name = %name, pattern = %provider.pattern,
            user = %provider.socket.user(), "provider accepted");
        self.locally_provided
            .lock()
            .insert(name.to_string(), provider);

        // Publish before any leader bookkeeping: the provided state must
        // reach the leading node ahead of the stage-finished ack, or the
        // leader concludes its stage believing no provider was found. When
        // this node leads, `on_start_provided` concludes the stage and
        // releases the lock itself.
        self.cluster_provided.add(name);

        let was_leading = self.leading_listen.lock().remove(name).is_some();
        if was_leading {
            self.lock_registry.release(&self.lock_name(name));
        } else {
            let leader = self.lead_listen.lock().remove(name);
            if let Some(leader) = leader {
                self.send_remote_discovery_stop(&leader, name);
            }
        }
    }

    /// Begin discovery for `name`: shortcut straight to no-provider when
    /// nothing matches anywhere, otherwise serialize through the cluster
    /// lock and run the local stage followed by the remote stage.
    fn start_discovery(&self, name: &str) {
        if self.has_active_provider(name) {
            return;
        }

        let local = self.create_local_candidates(name);
        if local.is_empty() && self.create_remote_candidates(name).is_empty() {
            self.send_has_provider_update(false, name);
            return;
        }

        let weak = self.weak_self.clone();
        let name = name.to_string();
        self.lock_registry.get(
            &self.lock_name(&name),
            Box::new(move |locked| {
                if !locked {
                    return;
                }
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                if registry.has_active_provider(&name) {
                    registry.lock_registry.release(&registry.lock_name(&name));
                    return;
                }
                debug!(topic = ?registry.topic, name = %name, "leading listen started");
                let remote = registry.create_remote_candidates(&name);
                registry
                    .leading_listen
                    .lock()
                    .insert(name.clone(), remote.into());
                registry.start_local_discovery(&name, Some(local));
            }),
        );
    }

    /// Run the local candidate stage for `name`. An empty candidate list
    /// ends the stage immediately so the leader/follower bookkeeping moves
    /// on.
    fn start_local_discovery(&self, name: &str, candidates: Option<Vec<Provider>>) {
        let candidates = candidates.unwrap_or_else(|| self.create_local_candidates(name));
        if candidates.is_empty() {
            self.stop_local_discovery(name);
            return;
        }

        debug!(topic = ?self.topic, name = %name, candidates = candidates.len(),
            "local listen started");
        metrics::discovery_races()
            .with_label_values(&[self.kind_label()])
            .inc();
        self.races.lock().insert(
            name.to_string(),
            ListenInProgress {
                current: None,
                queue: candidates.into(),
            },
        );
        self.trigger_next_provider(name);
    }

    /// End the local stage without a winner: hand over to the remote stage
    /// when leading, ack the leader when following.
    fn stop_local_discovery(&self, name: &str) {
        self.races.lock().remove(name);
        self.timeouts.clear(name);

        let leading = self.leading_listen.lock().contains_key(name);
        if leading {
            self.next_discovery_stage(name);
            return;
        }
        let leader = self.lead_listen.lock().remove(name);
        match leader {
            Some(leader) => self.send_remote_discovery_stop(&leader, name),
            None => {
                warn!(topic = ?self.topic, name = %name, "no listen stage to stop");
            }
        }
    }

    /// Advance the remote stage this node is leading: try the next server
    /// or conclude, releasing the lock and reporting the outcome.
    fn next_discovery_stage(&self, name: &str) {
        let next_server = {
            let mut leading = self.leading_listen.lock();
            let Some(servers) = leading.get_mut(name) else {
                return;
            };
            if self.has_active_provider(name) || servers.is_empty() {
                leading.remove(name);
                None
            } else {
                // Unwrap can't fail, the queue was just checked non-empty.
                Some(servers.pop_front().unwrap())
            }
        };

        match next_server {
            Some(server) => {
                debug!(topic = ?self.topic, name = %name, server = %server,
                    "remote listen started");
                self.transport
                    .send_direct(&server, Message::new(self.listening_topic, Action::Listen, name));
            }
            None => {
                let found = self.has_active_provider(name);
                debug!(topic = ?self.topic, name = %name, found, "leading listen finished");
                self.lock_registry.release(&self.lock_name(name));
                if !found {
                    self.send_has_provider_update(false, name);
                }
            }
        }
    }

    /// Offer `name` to the next queued candidate, or resolve the race when
    /// the queue has drained.
    fn trigger_next_provider(&self, name: &str) {
        let next = {
            let mut races = self.races.lock();
            let Some(race) = races.get_mut(name) else {
                return;
            };
            race.current = None;
            race.queue.pop_front()
        };

        let Some(provider) = next else {
            // Candidates exhausted. A parked late accepter wins now,
            // otherwise the local stage is over.
            match self.timeouts.take_late_responder_that_accepted(name) {
                Some(late) => {
                    self.accept(late, name);
                    self.timeouts.clear(name);
                }
                None => self.stop_local_discovery(name),
            }
            return;
        };

        // A candidate that itself subscribes to the name ends the local
        // stage rather than being offered its own subscription.
        if self
            .client_registry
            .get_local_subscribers(name)
            .contains(&provider.socket)
        {
            self.stop_local_discovery(name);
            return;
        }

        if let Some(race) = self.races.lock().get_mut(name) {
            race.current = Some(provider.clone());
        }

        let weak = self.weak_self.clone();
        self.timeouts.add_timeout(name, provider.clone(), move |name| {
            if let Some(registry) = weak.upgrade() {
                registry.trigger_next_provider(&name);
            }
        });
        provider.socket.send_message(
            Message::new(self.topic, Action::SubscriptionForPatternFound, &provider.pattern)
                .with_subscription(name),
        );
    }

    /// A name became provided somewhere in the cluster.
    fn on_start_provided(&self, name: &str) {
        self.send_has_provider_update(true, name);
        let leading = self.leading_listen.lock().contains_key(name);
        if leading {
            self.next_discovery_stage(name);
        }
    }

    /// A name lost its provider. Subscribers are told, and whoever still
    /// has subscribers re-runs discovery (the lock serializes the rush).
    fn on_stop_provided(&self, name: &str) {
        self.send_has_provider_update(false, name);
        if !self.has_active_provider(name) && self.client_registry.has_name(name) {
            self.start_discovery(name);
        }
    }

    /// Leader/follower traffic on the per-kind listening topic: a directed
    /// `Listen` asks this node to run its local stage, an ack reports a
    /// follower's stage finished.
    fn on_listening_message(&self, message: Message, origin: &str) {
        if message.is_ack {
            self.next_discovery_stage(&message.name);
            return;
        }
        match message.action {
            Action::Listen => {
                self.lead_listen
                    .lock()
                    .insert(message.name.clone(), origin.to_string());
                self.start_local_discovery(&message.name, None);
            }
            action => {
                warn!(topic = ?self.listening_topic, ?action, origin,
                    "unexpected listening message");
            }
        }
    }

    fn add_pattern(&self, pattern: &str) {
        let mut patterns = self.patterns.lock();
        if patterns.iter().any(|(p, _)| p == pattern) {
            return;
        }
        match Regex::new(pattern) {
            Ok(regex) => patterns.push((pattern.to_string(), regex)),
            Err(err) => {
                // Reachable for patterns replicated from another node.
                warn!(topic = ?self.topic, pattern = %pattern, %err,
                    "ignoring unparseable listen pattern");
            }
        }
    }

    fn remove_last_pattern(&self, pattern: &str) {
        self.patterns.lock().retain(|(p, _)| p != pattern);
    }

    /// A socket stopped listening on `pattern` (unlisten or close): purge
    /// it from late-response bookkeeping and queued races, advance any race
    /// it currently holds the offer for, and drop its active provideships.
    fn remove_pattern(&self, pattern: &str, socket: &SocketRef) {
        self.timeouts.remove_provider(socket, pattern);

        let advance: Vec<String> = {
            let mut races = self.races.lock();
            let mut advance = Vec::new();
            for (name, race) in races.iter_mut() {
                race.queue.retain(|p| !p.matches(socket, pattern));
                if race
                    .current
                    .as_ref()
                    .is_some_and(|current| current.matches(socket, pattern))
                {
                    race.current = None;
                    advance.push(name.clone());
                }
            }
            advance
        };
        for name in advance {
            // Advance only after cancelling the live offer; an expired
            // timer advances the race from its own callback.
            if self.timeouts.try_resolve(&name, socket, pattern) {
                self.trigger_next_provider(&name);
            }
        }

        let dropped: Vec<String> = {
            let mut provided = self.locally_provided.lock();
            let dropped: Vec<String> = provided
                .iter()
                .filter(|(_, provider)| provider.matches(socket, pattern))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dropped {
                provided.remove(name);
            }
            dropped
        };
        for name in dropped {
            // The state removal notifies subscribers and re-runs discovery
            // where subscribers remain.
            self.cluster_provided.remove(&name);
        }
    }

    fn create_local_candidates(&self, name: &str) -> Vec<Provider> {
        let mut candidates = Vec::new();
        {
            let patterns = self.patterns.lock();
            for (pattern, regex) in patterns.iter() {
                if !regex.is_match(name) {
                    continue;
                }
                for socket in self.provider_registry.get_local_subscribers(pattern) {
                    candidates.push(Provider {
                        socket,
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        if self.config.listen.shuffle_providers {
            candidates.shuffle(&mut rand::thread_rng());
        }
        candidates
    }

    fn create_remote_candidates(&self, name: &str) -> Vec<String> {
        let mut servers = Vec::new();
        let mut seen = HashSet::new();
        for pattern in self.provider_registry.get_names() {
            self.add_pattern(&pattern);
            let matched = {
                let patterns = self.patterns.lock();
                patterns
                    .iter()
                    .any(|(p, regex)| *p == pattern && regex.is_match(name))
            };
            if !matched {
                continue;
            }
            for server in self.provider_registry.get_all_servers(&pattern) {
                if server != self.server_name && seen.insert(server.clone()) {
                    servers.push(server);
                }
            }
        }
        if self.config.listen.shuffle_providers {
            servers.shuffle(&mut rand::thread_rng());
        }
        servers
    }

    fn send_has_provider_update(&self, has_provider: bool, name: &str) {
        if !self.kind.broadcasts_provider_state() {
            return;
        }
        let action = if has_provider {
            Action::SubscriptionHasProvider
        } else {
            Action::SubscriptionHasNoProvider
        };
        let message =
            Message::new(self.topic, action, name).with_data(serde_json::Value::Bool(has_provider));
        self.client_registry
            .send_to_subscribers(name, &message, None, true);
    }

    fn send_remote_discovery_stop(&self, leader: &str, name: &str) {
        self.transport.send_direct(
            leader,
            Message::new(self.listening_topic, Action::Listen, name).as_ack(),
        );
    }

    fn lock_name(&self, name: &str) -> String {
        format!("{}_LISTEN_LOCK_{name}", self.kind_label().to_uppercase())
    }

    fn kind_label(&self) -> &'static str {
        match self.kind {
            TopicKind::Record => "record",
            TopicKind::Event => "event",
        }
    }
}

/// The client registry's view of this component: first subscribers start
/// discovery, late subscribers of provided names get a direct update, last
/// unsubscribers tear the race and the active provider down.
impl SubscriptionListener for ListenerRegistry {
    fn on_first_subscription_made(&self, name: &str) {
        self.start_discovery(name);
    }

    fn on_subscription_made(&self, name: &str, socket: &SocketRef) {
        if self.kind.broadcasts_provider_state() && self.has_active_provider(name) {
            socket.send_message(
                Message::new(self.topic, Action::SubscriptionHasProvider, name)
                    .with_data(serde_json::Value::Bool(true)),
            );
        }
    }

    fn on_subscription_removed(&self, _name: &str, _socket: &SocketRef) {}

    fn on_last_subscription_removed(&self, name: &str) {
        let provider = self.locally_provided.lock().remove(name);
        if let Some(provider) = provider {
            provider.socket.send_message(
                Message::new(self.topic, Action::SubscriptionForPatternRemoved, &provider.pattern)
                    .with_subscription(name),
            );
            self.cluster_provided.remove(name);
        }

        let race = self.races.lock().remove(name);
        if let Some(race) = race {
            if let Some(current) = race.current {
                current.socket.send_message(
                    Message::new(self.topic, Action::SubscriptionForPatternRemoved, &current.pattern)
                        .with_subscription(name),
                );
            }
        }
        self.timeouts.clear(name);

        if self.leading_listen.lock().remove(name).is_some() {
            self.lock_registry.release(&self.lock_name(name));
        }
        self.lead_listen.lock().remove(name);
    }
}

/// The provider registry's view: patterns compile on first registration
/// anywhere, every removal purges the socket's races and provideships.
struct ProviderPatterns(Weak<ListenerRegistry>);

impl SubscriptionListener for ProviderPatterns {
    fn on_first_subscription_made(&self, pattern: &str) {
        if let Some(registry) = self.0.upgrade() {
            registry.add_pattern(pattern);
        }
    }

    fn on_subscription_made(&self, _pattern: &str, _socket: &SocketRef) {}

    fn on_subscription_removed(&self, pattern: &str, socket: &SocketRef) {
        if let Some(registry) = self.0.upgrade() {
            registry.remove_pattern(pattern, socket);
        }
    }

    fn on_last_subscription_removed(&self, pattern: &str) {
        if let Some(registry) = self.0.upgrade() {
            registry.remove_last_pattern(pattern);
        }
    }
}
