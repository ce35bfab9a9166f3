//! Replicated state set.
//!
//! A `StateRegistry` keeps one named set per topic in sync across the
//! cluster: which subscription names exist, which provider patterns are
//! registered, which names currently have a provider. Local entries are
//! reference-counted (one count per subscribing socket); remote nodes only
//! ever see presence, never the count. `on_add`/`on_remove` observers fire
//! exactly when a name first appears or last disappears *cluster-wide*,
//! which is what drives first-subscriber discovery.

use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

type StateObserver = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct StateData {
    /// Reference counts for entries this node added.
    local_counts: HashMap<String, usize>,
    /// Presence per server, this node included under its own name.
    servers: HashMap<String, HashSet<String>>,
}

impl StateData {
    fn present_anywhere(&self, name: &str) -> bool {
        self.servers.values().any(|names| names.contains(name))
    }
}

/// One replicated set, keyed by the topic it is broadcast on.
pub struct StateRegistry {
    topic: Topic,
    server_name: String,
    transport: Arc<dyn ClusterTransport>,
    data: Mutex<StateData>,
    on_add: Mutex<Vec<StateObserver>>,
    on_remove: Mutex<Vec<StateObserver>>,
}

impl StateRegistry {
    /// Create a registry and attach it to the transport topic.
    pub fn new(
        topic: Topic,
        server_name: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            topic,
            server_name: server_name.into(),
            transport,
            data: Mutex::new(StateData::default()),
            on_add: Mutex::new(Vec::new()),
            on_remove: Mutex::new(Vec::new()),
        });

        let incoming = registry.clone();
        registry.transport.subscribe(
            topic,
            Box::new(move |message, origin| incoming.on_remote_message(message, origin)),
        );

        registry
    }

    /// Observe names first appearing anywhere in the cluster.
    pub fn on_add(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_add.lock().push(Box::new(observer));
    }

    /// Observe names last disappearing from everywhere in the cluster.
    pub fn on_remove(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_remove.lock().push(Box::new(observer));
    }

    /// Add a local reference to `name`. The first reference replicates the
    /// entry; the first appearance cluster-wide fires `on_add`.
    pub fn add(&self, name: &str) {
        let (announce, first_anywhere) = {
            let mut data = self.data.lock();
            let count = data.local_counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            if *count == 1 {
                let first_anywhere = !data.present_anywhere(name);
                let server = self.server_name.clone();
                data.servers.entry(server).or_default().insert(name.to_string());
                (true, first_anywhere)
            } else {
                (false, false)
            }
        };

        if announce {
            self.transport
                .send(Message::new(self.topic, Action::Add, name));
        }
        if first_anywhere {
            self.notify(&self.on_add, name);
        }
    }

    /// Drop a local reference to `name`. The last reference withdraws the
    /// entry; the last disappearance cluster-wide fires `on_remove`.
    pub fn remove(&self, name: &str) {
        let (announce, last_anywhere) = {
            let mut data = self.data.lock();
            match data.local_counts.get_mut(name) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    (false, false)
                }
                Some(_) => {
                    data.local_counts.remove(name);
                    if let Some(names) = data.servers.get_mut(&self.server_name) {
                        names.remove(name);
                    }
                    (true, !data.present_anywhere(name))
                }
                None => {
                    debug!(topic = ?self.topic, name, "remove of untracked state entry");
                    return;
                }
            }
        };

        if announce {
            self.transport
                .send(Message::new(self.topic, Action::Remove, name));
        }
        if last_anywhere {
            self.notify(&self.on_remove, name);
        }
    }

    /// True if any node holds `name`.
    pub fn has(&self, name: &str) -> bool {
        self.data.lock().present_anywhere(name)
    }

    /// All names held anywhere in the cluster.
    pub fn get_all(&self) -> Vec<String> {
        let data = self.data.lock();
        let mut all: HashSet<&String> = HashSet::new();
        for names in data.servers.values() {
            all.extend(names);
        }
        all.into_iter().cloned().collect()
    }

    /// All names with the number of servers holding each.
    pub fn get_all_map(&self) -> HashMap<String, usize> {
        let data = self.data.lock();
        let mut map = HashMap::new();
        for names in data.servers.values() {
            for name in names {
                *map.entry(name.clone()).or_insert(0) += 1;
            }
        }
        map
    }

    /// The servers currently holding `name`.
    pub fn get_all_servers(&self, name: &str) -> Vec<String> {
        let data = self.data.lock();
        data.servers
            .iter()
            .filter(|(_, names)| names.contains(name))
            .map(|(server, _)| server.clone())
            .collect()
    }

    /// Purge everything a departed server held, firing `on_remove` for
    /// names that vanish with it.
    pub fn remove_server(&self, server_name: &str) {
        let orphaned: Vec<String> = {
            let mut data = self.data.lock();
            let Some(names) = data.servers.remove(server_name) else {
                return;
            };
            names
                .into_iter()
                .filter(|name| !data.present_anywhere(name))
                .collect()
        };
        for name in &orphaned {
            self.notify(&self.on_remove, name);
        }
        if !orphaned.is_empty() {
            debug!(topic = ?self.topic, server = server_name, count = orphaned.len(),
                "purged state entries of departed server");
        }
    }

    fn on_remote_message(&self, message: Message, origin: &str) {
        match message.action {
            Action::Add => {
                let first_anywhere = {
                    let mut data = self.data.lock();
                    let first = !data.present_anywhere(&message.name);
                    data.servers
                        .entry(origin.to_string())
                        .or_default()
                        .insert(message.name.clone());
                    first
                };
                if first_anywhere {
                    self.notify(&self.on_add, &message.name);
                }
            }
            Action::Remove => {
                let last_anywhere = {
                    let mut data = self.data.lock();
                    let removed = data
                        .servers
                        .get_mut(origin)
                        .is_some_and(|names| names.remove(&message.name));
                    removed && !data.present_anywhere(&message.name)
                };
                if last_anywhere {
                    self.notify(&self.on_remove, &message.name);
                }
            }
            action => {
                warn!(topic = ?self.topic, ?action, origin, "unexpected state registry action");
            }
        }
    }

    /// Run observers without holding their lock: an observer may re-enter
    /// this registry or register further observers.
    fn notify(&self, observers: &Mutex<Vec<StateObserver>>, name: &str) {
        let taken = std::mem::take(&mut *observers.lock());
        for observer in &taken {
            observer(name);
        }
        let mut guard = observers.lock();
        let mut restored = taken;
        restored.append(&mut guard);
        *guard = restored;
    }
}
