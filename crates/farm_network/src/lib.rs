//! Farm Network: peer-to-peer pest alert dissemination between farm sites.
//!
//! Each site runs a [`PeerNode`] that floods alerts to its direct neighbors
//! without a central broker. Messages carry a hop budget and the path they
//! took; every node remembers what it has seen in a durable store, so an
//! alert is delivered at most once per site, never bounces back toward a
//! node that already relayed it, and survives restarts while neighbors are
//! unreachable.
//!
//! # Architecture
//!
//! - **Envelope**: versioned, tagged JSON wire frames with a closed set of
//!   message kinds ([`message`]).
//! - **Store**: SQLite-backed record of every message and its delivery
//!   state ([`store`]).
//! - **Registry**: neighbor liveness from heartbeats ([`peer`]).
//! - **Router**: pure flooding policy with loop avoidance ([`router`]).
//! - **Transport**: WebSocket between sites, in-memory for simulations
//!   ([`transport`], [`memory`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use farm_network::{LogBridge, NodeConfig, NodeIdentity, PeerNode, PestDetection, WsTransport};
//!
//! # async fn example() -> Result<(), farm_network::NetworkError> {
//! let identity = NodeIdentity::generate("north-greenhouse");
//! let config = NodeConfig::default();
//! let mut node = PeerNode::open(identity, config, Arc::new(WsTransport::new()), Arc::new(LogBridge))?;
//!
//! node.start().await?;
//! node.connect("192.168.1.20:9470").await?;
//! node.send_alert(&PestDetection::new("whitefly", 52, "north")).await?;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod bridge;
pub mod config;
pub mod error;
pub mod identity;
pub mod memory;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod store;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use alert::{AlertDirection, AlertRecord, PestDetection, RecentAlerts, Severity};
pub use bridge::{AlertBridge, BridgeEvent, ChannelBridge, LogBridge, UndeliverableNotice};
pub use config::NodeConfig;
pub use error::NetworkError;
pub use identity::{NodeIdentity, PeerId};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{Envelope, Heartbeat, MessageId, MessageKind, Payload, PestAlert, Query, QueryResponse};
pub use node::{NodeStatus, PeerNode, SweepReport};
pub use peer::{PeerEntry, PeerRegistry, PeerStatus};
pub use router::{RouteDecision, Router};
pub use store::{MessageStore, RecordState, StoreRecord, StoreStats};
pub use transport::{Transport, WsTransport};
