//! Cluster coordination: gossip membership, replicated state sets and
//! distributed locks.
//!
//! Leadership here is advisory. It is computed locally by every node from
//! its own gossip view, exists only to avoid duplicate discovery work, and
//! nodes may transiently disagree about it during churn. Nothing in this
//! module waits for quorum; a stale node simply drops out after the
//! inactivity timeout and the leader is recomputed on the next lookup.

mod lock;
mod registry;
mod state;

pub use lock::{DistributedLockRegistry, LocalLockRegistry, LockCallback, LockRegistry};
pub use registry::{ClusterRegistry, NodeStatus};
pub use state::StateRegistry;
