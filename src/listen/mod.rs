//! Provider discovery.
//!
//! Providers register regex patterns describing the names they can supply.
//! When a name gains its first subscriber, the registry races the matching
//! providers one offer at a time until one accepts, times out the silent
//! ones, and arbitrates responses that arrive after their deadline. In a
//! cluster the race is serialized per name through the lock registry, with
//! the node that obtained the lock leading its peers one by one.

mod registry;
mod timeout;

pub use registry::ListenerRegistry;
pub use timeout::ListenerTimeoutRegistry;

use crate::socket::SocketRef;

/// A socket's offer to serve names matching a pattern.
#[derive(Debug, Clone)]
pub(crate) struct Provider {
    pub(crate) socket: SocketRef,
    pub(crate) pattern: String,
}

impl Provider {
    pub(crate) fn matches(&self, socket: &SocketRef, pattern: &str) -> bool {
        self.socket == *socket && self.pattern == pattern
    }
}

impl PartialEq for Provider {
    fn eq(&self, other: &Self) -> bool {
        self.socket == other.socket && self.pattern == other.pattern
    }
}

impl Eq for Provider {}
