//! Named, short-lived mutual-exclusion leases.
//!
//! Locks keep cross-node discovery single-threaded per subscription name.
//! They are leases, not holds: every acquisition arms an auto-release timer
//! so a crashed holder cannot deadlock the cluster. Anyone may release a
//! lock by name - the cluster is trusted, holders are not authenticated.

use crate::cluster::ClusterRegistry;
use crate::config::Config;
use crate::metrics;
use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Resolved with `true` if the lock was acquired.
pub type LockCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Named lease acquisition. `get` never blocks; the callback fires with
/// the decision, possibly synchronously.
pub trait LockRegistry: Send + Sync {
    /// Try to acquire `name`. At most one holder at a time; denial is not
    /// an error.
    fn get(&self, name: &str, callback: LockCallback);

    /// Release `name` before its lease expires. Unknown names are ignored.
    fn release(&self, name: &str);
}

type LeaseTable = Arc<Mutex<HashMap<String, u64>>>;

/// In-memory lease table: the single-node form, and the table the leader
/// answers remote requests from.
pub struct LocalLockRegistry {
    config: Arc<Config>,
    locks: LeaseTable,
    next_token: AtomicU64,
}

impl LocalLockRegistry {
    /// Create an empty lease table.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Acquire `name` if free, arming the auto-release timer.
    fn try_acquire(&self, name: &str) -> bool {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut locks = self.locks.lock();
            if locks.contains_key(name) {
                return false;
            }
            locks.insert(name.to_string(), token);
        }
        metrics::locks_held().inc();

        let locks = self.locks.clone();
        let name = name.to_string();
        let timeout = self.config.lock_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Only expire the lease this timer was armed for.
            let expired = {
                let mut locks = locks.lock();
                match locks.get(&name) {
                    Some(held) if *held == token => {
                        locks.remove(&name);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                metrics::locks_held().dec();
                warn!(lock = %name, "lock released due to timeout");
            }
        });
        true
    }
}

impl LockRegistry for LocalLockRegistry {
    fn get(&self, name: &str, callback: LockCallback) {
        callback(self.try_acquire(name));
    }

    fn release(&self, name: &str) {
        if self.locks.lock().remove(name).is_some() {
            metrics::locks_held().dec();
        }
    }
}

struct PendingRequest {
    callback: LockCallback,
    token: u64,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Resolve the pending request for `name`. With `Some(token)` only the
/// matching request resolves, so a stale timer cannot deny a later request
/// for the same name.
fn resolve_pending(pending: &PendingTable, name: &str, locked: bool, token: Option<u64>) -> bool {
    let request = {
        let mut pending = pending.lock();
        match pending.get(name) {
            Some(request) if token.is_none_or(|t| t == request.token) => pending.remove(name),
            _ => None,
        }
    };
    match request {
        Some(request) => {
            (request.callback)(locked);
            true
        }
        None => false,
    }
}

/// Cluster-aware lock registry.
///
/// The leader answers from its local lease table; followers ask the leader
/// over the point-to-point lock channel, with at most one outstanding
/// request per lock name and a timeout that resolves to denial.
pub struct DistributedLockRegistry {
    config: Arc<Config>,
    cluster: Arc<ClusterRegistry>,
    transport: Arc<dyn ClusterTransport>,
    local: LocalLockRegistry,
    pending: PendingTable,
    next_token: AtomicU64,
}

impl DistributedLockRegistry {
    /// Create the registry and attach it to the lock channel.
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<ClusterRegistry>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            local: LocalLockRegistry::new(config.clone()),
            config,
            cluster,
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        });

        let incoming = registry.clone();
        registry.transport.subscribe(
            Topic::Lock,
            Box::new(move |message, origin| incoming.on_message(message, origin)),
        );

        registry
    }

    fn get_remote_lock(&self, name: &str, callback: LockCallback) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(name) {
                // One outstanding request per name; a concurrent second
                // acquisition attempt is denied outright.
                drop(pending);
                callback(false);
                return;
            }
            pending.insert(name.to_string(), PendingRequest { callback, token });
        }

        let pending = self.pending.clone();
        let timed_name = name.to_string();
        let timeout = self.config.lock_request_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if resolve_pending(&pending, &timed_name, false, Some(token)) {
                warn!(lock = %timed_name, "lock request timed out");
            }
        });

        let leader = self.cluster.get_leader();
        self.transport
            .send_direct(&leader, Message::new(Topic::Lock, Action::Request, name));
    }

    fn on_message(&self, message: Message, origin: &str) {
        if message.action == Action::Response {
            let locked = matches!(message.data, Some(serde_json::Value::Bool(true)));
            resolve_pending(&self.pending, &message.name, locked, None);
            return;
        }

        if !self.cluster.is_leader() {
            warn!(
                origin,
                server = %self.cluster.server_name(),
                "peer assumes this node is the leader, ignoring lock message"
            );
            return;
        }

        match message.action {
            Action::Request => {
                let locked = self.local.try_acquire(&message.name);
                self.transport.send_direct(
                    origin,
                    Message::new(Topic::Lock, Action::Response, message.name)
                        .with_data(serde_json::Value::Bool(locked)),
                );
            }
            Action::Release => self.local.release(&message.name),
            action => warn!(origin, ?action, "unknown lock action"),
        }
    }
}

impl LockRegistry for DistributedLockRegistry {
    fn get(&self, name: &str, callback: LockCallback) {
        if self.cluster.is_leader() {
            callback(self.local.try_acquire(name));
        } else {
            self.get_remote_lock(name, callback);
        }
    }

    fn release(&self, name: &str) {
        if self.cluster.is_leader() {
            self.local.release(name);
        } else {
            let leader = self.cluster.get_leader();
            self.transport
                .send_direct(&leader, Message::new(Topic::Lock, Action::Release, name));
        }
    }
}
