//! # driftd
//!
//! Coordination core of the Drift realtime sync server.
//!
//! This crate tracks which connections are subscribed to which named
//! resources, discovers which connected provider clients are willing to
//! supply data for a newly-subscribed name (a pattern-matching race with
//! timeouts and late-response arbitration), and elects a cluster leader
//! plus short-lived distributed locks so discovery can be serialized
//! across cooperating server processes.
//!
//! Connection endpoints (WebSocket/TCP accept loops), authentication,
//! permissions and record storage live outside this crate; they talk to
//! the core through [`socket::SocketRef`] and [`transport::ClusterTransport`].
//! [`hub::Hub`] is the composition root that wires the registries together.

#![deny(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod hub;
pub mod listen;
pub mod metrics;
pub mod socket;
pub mod subscription;
pub mod transport;

pub use config::Config;
pub use hub::Hub;
pub use socket::SocketRef;
