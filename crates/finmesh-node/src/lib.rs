//! Peer node for the finmesh network.
//!
//! This crate provides the node abstraction of the mesh:
//! - a TCP listener accepting inbound peer connections
//! - outbound connection management with a join/welcome discovery handshake
//! - a live peer registry, mutated only by the node itself
//! - kind-based dispatch of decoded envelopes
//! - broadcast and unicast sending with per-peer failure handling
//! - a bounded event log plus live subscription for local observers
//! - a periodic alert monitor bridging an external condition detector
//!
//! There is no central coordinator: every node accepts, connects, and
//! broadcasts on its own. Peer identity is not authenticated and the mesh
//! offers no cross-peer ordering guarantees.
//!
//! # Example
//!
//! ```rust,no_run
//! use finmesh_node::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::new("127.0.0.1", 9001));
//!
//!     let runner = node.clone();
//!     tokio::spawn(async move { runner.start().await });
//!     node.wait_ready().await;
//!
//!     node.connect("127.0.0.1", 9002, None).await?;
//!     node.share_chat("what is my balance", "your balance is 42").await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod events;
mod logging;
mod monitor;
mod node;
mod registry;

pub use config::{NodeConfig, default_peer_id};
pub use error::{NodeError, NodeResult};
pub use events::{EventRecord, NodeEvent};
pub use logging::{LogFormat, LoggingConfig, LoggingError, init_logging};
pub use monitor::{AlertMonitor, MonitorCommand, MonitorConfig, MonitorHandle, MonitorState};
pub use node::{BroadcastOutcome, Node, NodeState};
