//! Device discovery.
//!
//! Provides the discovery collaborator contract and a UDP broadcast
//! transport that delegates payload handling to a [`ReplyDecoder`].

pub mod listener;
pub mod udp;

pub use listener::{DiscoveryEvents, DiscoverySource};
pub use udp::{create_broadcast_socket, DiscoveredDevice, ReplyDecoder, UdpDiscovery};
