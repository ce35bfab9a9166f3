//! Gossip-based cluster membership and leader election.
//!
//! Every node broadcasts a STATUS message on a fixed interval and sweeps
//! its peer table for nodes whose last STATUS has gone stale. The leader is
//! simply the live node with the highest random `leader_score`, recomputed
//! locally on every lookup - no consensus, no quorum, because leadership
//! only sequences discovery work and never gates correctness.

use crate::config::Config;
use crate::metrics;
use crate::transport::ClusterTransport;
use drift_proto::{Action, Message, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
// tokio's Instant, not std's: liveness checks must follow the test clock.
use tokio::time::Instant;
use tracing::{info, warn};

/// Gossiped identity and election data of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Unique server name.
    pub server_name: String,
    /// Random score fixed for the node's process lifetime; highest leads.
    pub leader_score: f64,
    /// URL clients can reach the node on.
    #[serde(default)]
    pub external_url: String,
    /// Informational role string.
    #[serde(default)]
    pub role: String,
}

struct ClusterNode {
    status: NodeStatus,
    last_status: Instant,
    joined_at: chrono::DateTime<chrono::Utc>,
}

type NodeObserver = Box<dyn Fn(&str) + Send + Sync>;

/// This process's view of cluster membership.
pub struct ClusterRegistry {
    config: Arc<Config>,
    transport: Arc<dyn ClusterTransport>,
    leader_score: f64,
    nodes: Mutex<HashMap<String, ClusterNode>>,
    in_cluster: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_node_added: Mutex<Vec<NodeObserver>>,
    on_node_removed: Mutex<Vec<NodeObserver>>,
}

impl ClusterRegistry {
    /// Create the registry. The node is immediately present in its own
    /// view; gossip starts with [`ClusterRegistry::start`].
    pub fn new(config: Arc<Config>, transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        let leader_score: f64 = rand::random();
        let registry = Arc::new(Self {
            config,
            transport,
            leader_score,
            nodes: Mutex::new(HashMap::new()),
            in_cluster: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            on_node_added: Mutex::new(Vec::new()),
            on_node_removed: Mutex::new(Vec::new()),
        });

        registry.upsert_node(registry.self_status());

        let incoming = registry.clone();
        registry.transport.subscribe(
            Topic::Cluster,
            Box::new(move |message, origin| incoming.on_message(message, origin)),
        );

        registry
    }

    /// Announce this node and begin the keep-alive and liveness-sweep
    /// intervals. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.in_cluster.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publish_status();

        let publisher = self.clone();
        let keep_alive = self.config.cluster_keep_alive_interval();
        let publish_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive);
            ticker.tick().await; // immediate first tick already published
            loop {
                ticker.tick().await;
                publisher.publish_status();
            }
        });

        let sweeper = self.clone();
        let check = self.config.cluster_check_interval();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check);
            loop {
                ticker.tick().await;
                sweeper.check_nodes();
            }
        });

        self.tasks.lock().extend([publish_task, sweep_task]);
    }

    /// Broadcast REMOVE, stop the intervals and clear the node table.
    /// A second call is a no-op.
    pub fn leave_cluster(&self) {
        if !self.in_cluster.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.server_name(), "leaving cluster");
        self.transport.send(Message::new(
            Topic::Cluster,
            Action::Remove,
            self.server_name(),
        ));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.nodes.lock().clear();
        metrics::cluster_nodes().set(0);
    }

    /// This node's name.
    pub fn server_name(&self) -> &str {
        &self.config.server.name
    }

    /// Names of every node currently considered live, self included.
    pub fn get_all(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    /// The live node with the highest leader score.
    pub fn get_leader(&self) -> String {
        let nodes = self.nodes.lock();
        nodes
            .values()
            .max_by(|a, b| {
                a.status
                    .leader_score
                    .partial_cmp(&b.status.leader_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|node| node.status.server_name.clone())
            .unwrap_or_else(|| self.server_name().to_string())
    }

    /// True if this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.get_leader() == self.server_name()
    }

    /// Observe nodes joining the cluster view.
    pub fn on_node_added(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_node_added.lock().push(Box::new(observer));
    }

    /// Observe nodes leaving the cluster view (REMOVE or inactivity).
    pub fn on_node_removed(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_node_removed.lock().push(Box::new(observer));
    }

    fn self_status(&self) -> NodeStatus {
        NodeStatus {
            server_name: self.server_name().to_string(),
            leader_score: self.leader_score,
            external_url: self.config.server.external_url.clone(),
            role: self.config.server.role.clone(),
        }
    }

    fn publish_status(&self) {
        let status = self.self_status();
        self.upsert_node(status.clone());

        let payload = match serde_json::to_value(&status) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize node status");
                return;
            }
        };
        self.transport.send(
            Message::new(Topic::Cluster, Action::Status, status.server_name).with_data(payload),
        );
    }

    fn on_message(&self, message: Message, origin: &str) {
        match message.action {
            Action::Status => match message.data.and_then(|d| serde_json::from_value(d).ok()) {
                Some(status) => self.upsert_node(status),
                None => warn!(origin, "cluster STATUS without a parsable body"),
            },
            Action::Remove => self.remove_node(&message.name),
            action => warn!(origin, ?action, "unknown cluster action"),
        }
    }

    fn upsert_node(&self, status: NodeStatus) {
        let name = status.server_name.clone();
        let is_new = {
            let mut nodes = self.nodes.lock();
            let is_new = !nodes.contains_key(&name);
            let node = nodes.entry(name.clone()).or_insert_with(|| ClusterNode {
                status: status.clone(),
                last_status: Instant::now(),
                joined_at: chrono::Utc::now(),
            });
            node.status = status;
            node.last_status = Instant::now();
            metrics::cluster_nodes().set(nodes.len() as i64);
            is_new
        };

        if is_new && name != self.server_name() {
            info!(server = %name, "node joined cluster");
            self.notify(&self.on_node_added, &name);
        }
    }

    /// Drop peers whose last STATUS exceeds the inactivity timeout.
    fn check_nodes(&self) {
        let cutoff = self.config.cluster_node_inactive_timeout();
        let stale: Vec<String> = {
            let nodes = self.nodes.lock();
            nodes
                .values()
                .filter(|node| {
                    node.status.server_name != self.server_name()
                        && node.last_status.elapsed() > cutoff
                })
                .map(|node| node.status.server_name.clone())
                .collect()
        };
        for name in stale {
            warn!(server = %name, "node inactive, removing from cluster view");
            self.remove_node(&name);
        }
    }

    fn remove_node(&self, name: &str) {
        let removed = {
            let mut nodes = self.nodes.lock();
            let removed = nodes.remove(name);
            metrics::cluster_nodes().set(nodes.len() as i64);
            removed
        };
        if let Some(node) = removed {
            info!(
                server = %name,
                joined_at = %node.joined_at.to_rfc3339(),
                "node left cluster"
            );
            self.notify(&self.on_node_removed, name);
        }
    }

    fn notify(&self, observers: &Mutex<Vec<NodeObserver>>, name: &str) {
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
