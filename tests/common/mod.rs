//! Shared harness for the integration tests: an in-process client that
//! captures everything the registries send it, plus builders for hubs on
//! a [`MemoryMesh`].

#![allow(dead_code)]

use std::sync::Arc;

use drift_proto::{Action, Message, Topic};
use driftd::config::Config;
use driftd::hub::Hub;
use driftd::socket::SocketRef;
use driftd::transport::{LoopbackTransport, MemoryMesh};
use tokio::sync::mpsc;

/// A connected client whose delivered messages can be inspected.
pub struct TestClient {
    pub socket: SocketRef,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl TestClient {
    pub fn new(user: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            socket: SocketRef::new(user, tx),
            rx,
        }
    }

    /// The next delivered message. Panics when the queue is empty.
    pub fn recv(&mut self) -> Message {
        self.rx
            .try_recv()
            .unwrap_or_else(|_| panic!("{}: expected a queued message", self.socket.user()))
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Drain and return everything delivered so far.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    /// The next delivered message, asserting its action.
    pub fn expect(&mut self, action: Action) -> Message {
        let message = self.recv();
        assert_eq!(
            message.action,
            action,
            "{}: expected {action:?}, got {message:?}",
            self.socket.user()
        );
        message
    }

    pub fn assert_silent(&mut self) {
        if let Ok(message) = self.rx.try_recv() {
            panic!(
                "{}: expected no message, got {message:?}",
                self.socket.user()
            );
        }
    }
}

/// Route registry logs through `RUST_LOG` when a test needs them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn node_config(name: &str) -> Arc<Config> {
    let mut config = Config::default();
    config.server.name = name.to_string();
    Arc::new(config)
}

/// A hub with no cluster peers.
pub fn single_hub() -> Arc<Hub> {
    init_tracing();
    Hub::new(node_config("solo"), Arc::new(LoopbackTransport::new()))
}

/// A hub joined to `mesh` as `name`. The caller starts it.
pub fn mesh_hub(mesh: &Arc<MemoryMesh>, name: &str) -> Arc<Hub> {
    init_tracing();
    Hub::new(node_config(name), mesh.join(name))
}

pub fn subscribe(hub: &Hub, client: &TestClient, topic: Topic, name: &str) {
    hub.route(&client.socket, &Message::new(topic, Action::Subscribe, name))
        .unwrap();
}

pub fn unsubscribe(hub: &Hub, client: &TestClient, topic: Topic, name: &str) {
    hub.route(&client.socket, &Message::new(topic, Action::Unsubscribe, name))
        .unwrap();
}

pub fn listen(hub: &Hub, client: &TestClient, topic: Topic, pattern: &str) {
    hub.route(&client.socket, &Message::new(topic, Action::Listen, pattern))
        .unwrap();
}

pub fn unlisten(hub: &Hub, client: &TestClient, topic: Topic, pattern: &str) {
    hub.route(&client.socket, &Message::new(topic, Action::Unlisten, pattern))
        .unwrap();
}

pub fn accept(hub: &Hub, client: &TestClient, topic: Topic, pattern: &str, name: &str) {
    hub.route(
        &client.socket,
        &Message::new(topic, Action::ListenAccept, pattern).with_subscription(name),
    )
    .unwrap();
}

pub fn reject(hub: &Hub, client: &TestClient, topic: Topic, pattern: &str, name: &str) {
    hub.route(
        &client.socket,
        &Message::new(topic, Action::ListenReject, pattern).with_subscription(name),
    )
    .unwrap();
}
