//! # Node Module
//!
//! Everything about the remote audio nodes that render playback:
//!
//! - [`pool`]: connection state per node, session placement, health snapshot
//!   and backoff-driven reconnection
//! - [`transport`]: the seam to the client that speaks the node protocol
//! - [`events`]: what nodes report back (track lifecycle, position, link state)
//! - [`backoff`]: reconnect delay policy

pub mod backoff;
pub mod events;
pub mod pool;
pub mod transport;

/// Identificador de un nodo configurado.
pub type NodeId = String;

pub use events::{InboundEvent, NodeEvent, PlayerEvent, TrackEndReason};
pub use pool::{NodeHealth, NodePool, NodeState, PoolHealth};
pub use transport::{ChannelTransport, Instruction, NodeConfig, NodeTransport, Outbound};
