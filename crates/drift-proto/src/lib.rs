//! # drift-proto
//!
//! The message model shared by the Drift server core and its transports:
//! topics, actions and the [`Message`] struct that flows between clients,
//! registries and cluster peers.
//!
//! The wire encoding is deliberately out of scope here - messages are plain
//! serde-derived structs, so a connection endpoint can frame them as JSON,
//! binary or anything else without this crate caring.

#![deny(clippy::all)]
#![warn(missing_docs)]

mod message;
mod topic;

pub use message::{BulkInfo, Message};
pub use topic::{Action, Topic, TopicKind};
