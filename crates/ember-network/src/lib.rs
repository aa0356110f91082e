//! # ember-network
//! Peer-to-peer gossip and synchronization for the Ember protocol.
//!
//! Peers exchange gzip-compressed JSON envelopes over duplex WebSocket
//! connections. A well-known boot node provides rendezvous (peer lists) and
//! a relay path for peers that cannot accept direct connections.

pub mod config;
pub mod engine;
pub mod peers;
pub mod protocol;
pub mod sync;

pub use config::NetworkConfig;
pub use engine::{BlockSink, NodeContext, PeerEngine};
pub use protocol::{Envelope, MessageKind};
