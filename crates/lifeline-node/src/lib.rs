//! Lifeline Node
//!
//! The daemon that hosts one user's heartbeat:
//!
//! - TCP peer channel (NDJSON, handshake-first)
//! - [`HeartbeatService`] event loop owning the coordinator, trust cells
//!   and coherence estimator
//! - JSON snapshot store under the data directory
//! - Unix admin socket for local control (lifeline-admin CLI)

pub mod admin_socket;
pub mod config;
pub mod error;
pub mod node;
pub mod service;
pub mod storage;

pub use admin_socket::{AdminCommand, AdminRequest, AdminResponse, AdminSocket};
pub use config::{ConfigError, NodeConfig};
pub use error::{Error, Result};
pub use node::LifelineNode;
pub use service::{HeartbeatService, NodeContext, RouteTable};
pub use storage::SnapshotStore;
