//! Cluster transport abstraction.
//!
//! The core never opens connections between server processes itself; it
//! publishes and receives [`Message`]s through a [`ClusterTransport`].
//! Production deployments plug in a real message bus. This module ships two
//! in-memory implementations: [`LoopbackTransport`] for single-process
//! deployments and [`MemoryMesh`] for multi-node integration tests and
//! embedding demos.

use dashmap::DashMap;
use drift_proto::{Message, Topic};
use std::sync::Arc;
use tracing::trace;

/// Handler invoked for each incoming message, with the origin server name.
pub type TransportHandler = Box<dyn Fn(Message, &str) + Send + Sync>;

/// Point-to-point and broadcast message delivery between server processes.
///
/// Implementations must deliver reliably and in order per sender, and must
/// never deliver a broadcast back to its origin.
pub trait ClusterTransport: Send + Sync {
    /// Broadcast to every other node. Routed by `message.topic`.
    fn send(&self, message: Message);

    /// Deliver to a single named node. Unknown targets are dropped.
    fn send_direct(&self, server_name: &str, message: Message);

    /// Register a handler for one topic. Multiple handlers per topic are
    /// allowed; each receives every message.
    fn subscribe(&self, topic: Topic, handler: TransportHandler);
}

/// Transport for a process with no peers: broadcasts go nowhere.
#[derive(Default)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    /// Create a loopback transport.
    pub fn new() -> Self {
        Self
    }
}

impl ClusterTransport for LoopbackTransport {
    fn send(&self, _message: Message) {}

    fn send_direct(&self, server_name: &str, _message: Message) {
        trace!(target =% server_name, "dropping direct message, no peers");
    }

    fn subscribe(&self, _topic: Topic, _handler: TransportHandler) {}
}

/// In-memory multi-node transport: every [`MeshNode`] sees every other.
///
/// Delivery is synchronous and in registration order, which keeps
/// multi-node tests deterministic.
#[derive(Default)]
pub struct MemoryMesh {
    nodes: DashMap<String, Arc<MeshState>>,
}

#[derive(Default)]
struct MeshState {
    handlers: DashMap<Topic, Vec<TransportHandler>>,
}

impl MemoryMesh {
    /// Create an empty mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the mesh as `server_name`, returning that node's transport.
    pub fn join(self: &Arc<Self>, server_name: impl Into<String>) -> Arc<MeshNode> {
        let server_name = server_name.into();
        let state = Arc::new(MeshState::default());
        self.nodes.insert(server_name.clone(), state.clone());
        Arc::new(MeshNode {
            mesh: self.clone(),
            server_name,
            state,
        })
    }

    /// Remove a node; pending handlers are dropped with it.
    pub fn leave(&self, server_name: &str) {
        self.nodes.remove(server_name);
    }

    fn deliver(&self, state: &MeshState, message: Message, origin: &str) {
        if let Some(handlers) = state.handlers.get(&message.topic) {
            for handler in handlers.iter() {
                handler(message.clone(), origin);
            }
        }
    }
}

/// One node's view of a [`MemoryMesh`].
pub struct MeshNode {
    mesh: Arc<MemoryMesh>,
    server_name: String,
    state: Arc<MeshState>,
}

impl MeshNode {
    /// The name this node joined the mesh under.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl MeshNode {
    /// A node removed with [`MemoryMesh::leave`] is partitioned both ways.
    fn departed(&self) -> bool {
        !self.mesh.nodes.contains_key(&self.server_name)
    }
}

impl ClusterTransport for MeshNode {
    fn send(&self, message: Message) {
        if self.departed() {
            return;
        }
        for entry in self.mesh.nodes.iter() {
            if entry.key() == &self.server_name {
                continue;
            }
            self.mesh.deliver(entry.value(), message.clone(), &self.server_name);
        }
    }

    fn send_direct(&self, server_name: &str, message: Message) {
        if self.departed() {
            return;
        }
        let target = self.mesh.nodes.get(server_name).map(|e| e.value().clone());
        match target {
            Some(state) => self.mesh.deliver(&state, message, &self.server_name),
            None => trace!(target =% server_name, "dropping direct message, unknown node"),
        }
    }

    fn subscribe(&self, topic: Topic, handler: TransportHandler) {
        self.state.handlers.entry(topic).or_default().push(handler);
    }
}
