//! Socket handle shared between the connection endpoint and the registries.
//!
//! A [`SocketRef`] is the registry-side view of one client connection:
//! an identity, an outbound message queue, and close hooks the registries
//! use to tear down subscriptions when the connection goes away. The actual
//! network I/O lives in the embedding endpoint, which drains the receiver
//! half of the queue.

use dashmap::DashMap;
use drift_proto::Message;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Process-unique socket identifier.
pub type SocketId = u64;

/// Handle for a close hook, returned by [`SocketRef::on_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseHookId(u64);

type CloseHook = Box<dyn Fn(&SocketRef) + Send + Sync>;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

struct SocketInner {
    id: SocketId,
    user: String,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    next_hook_id: AtomicU64,
    close_hooks: DashMap<CloseHookId, CloseHook>,
}

/// Cheap-clone handle to a connected client.
///
/// Equality and hashing are by socket id, so a clone compares equal to its
/// original.
#[derive(Clone)]
pub struct SocketRef {
    inner: Arc<SocketInner>,
}

impl SocketRef {
    /// Create a socket handle draining into `outbound`.
    pub fn new(user: impl Into<String>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                user: user.into(),
                outbound,
                closed: AtomicBool::new(false),
                next_hook_id: AtomicU64::new(1),
                close_hooks: DashMap::new(),
            }),
        }
    }

    /// Process-unique id of this socket.
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    /// Authenticated user identity, for log lines and notices.
    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Queue a message for delivery. Delivery failures (endpoint already
    /// gone) are silently dropped; the close path handles cleanup.
    pub fn send_message(&self, message: Message) {
        let _ = self.inner.outbound.send(message);
    }

    /// Queue the acknowledgement of `message`.
    pub fn send_ack_message(&self, message: &Message) {
        self.send_message(message.ack());
    }

    /// Register a hook to run when the socket closes. Hooks run at most
    /// once, in no particular order.
    pub fn on_close(&self, hook: impl Fn(&SocketRef) + Send + Sync + 'static) -> CloseHookId {
        let id = CloseHookId(self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed));
        self.inner.close_hooks.insert(id, Box::new(hook));
        id
    }

    /// Detach a previously registered close hook. Unknown ids are ignored.
    pub fn remove_on_close(&self, id: CloseHookId) {
        self.inner.close_hooks.remove(&id);
    }

    /// Whether [`SocketRef::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Mark the socket closed and run every registered hook once.
    ///
    /// Idempotent. Hooks are drained before invocation, so a hook may call
    /// `remove_on_close` (or register new hooks on other sockets) freely.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(socket = self.inner.id, user = %self.inner.user, "socket closed");

        let hooks: Vec<CloseHook> = {
            let mut drained = Vec::new();
            let ids: Vec<CloseHookId> =
                self.inner.close_hooks.iter().map(|entry| *entry.key()).collect();
            for id in ids {
                if let Some((_, hook)) = self.inner.close_hooks.remove(&id) {
                    drained.push(hook);
                }
            }
            drained
        };
        for hook in hooks {
            hook(self);
        }
    }
}

impl PartialEq for SocketRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SocketRef {}

impl std::hash::Hash for SocketRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for SocketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRef")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user)
            .finish()
    }
}
