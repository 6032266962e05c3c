//! # kad-dht
//!
//! A Kademlia distributed hash table node: 160-bit SHA-1 identifiers, an XOR
//! metric, k-buckets with ping-before-evict, and iterative `find_node`,
//! `find_value` and `store` over a pluggable request/response transport.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: identifiers, distances, the routing table, the value store and
//!   the [`DhtNetwork`] seam the node talks through.
//! - [`node`]: the [`DhtNode`] state machine and the lookup engine.
//! - [`transport`]: the [`Transport`] trait and the handler table shared by
//!   the implementations in [`udp`] and [`local`].
//! - [`net`]: [`RpcNetwork`], a [`DhtNetwork`] over any [`Transport`].
//! - [`server`]: wires a node's inbound handlers to a transport.
//! - [`protocol`] / [`framing`]: the JSON envelope exchanged between peers.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kad_dht::{
//!     register_handlers, Contact, DhtConfig, DhtNode, NodeId, RpcNetwork, Transport, UdpTransport,
//! };
//!
//! # async fn launch() -> kad_dht::Result<()> {
//! let config = DhtConfig::default();
//! let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await?);
//! let me = Contact::new(NodeId::from_text("node1"), transport.local_addr());
//! let network = RpcNetwork::new(transport.clone(), me.clone(), config.send_timeout);
//! let node = DhtNode::new(me, network, config);
//! register_handlers(&node, transport.as_ref())?;
//!
//! let peer = Contact::new(NodeId::from_text("node2"), "127.0.0.1:4001".parse().unwrap());
//! node.insert_or_refresh(peer).await;
//! let replicas = node.store(NodeId::from_text("foo"), b"bar".to_vec()).await?;
//! # let _ = replicas;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod local;
pub mod net;
pub mod node;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod udp;

pub use crate::config::DhtConfig;
pub use crate::core::{
    sort_by_distance, Admission, Contact, DhtNetwork, Distance, FindValueReply, Key, NodeId,
    RoutingTable, Value, ID_LENGTH, NUM_BUCKETS,
};
pub use crate::error::{DhtError, Result};
pub use crate::local::{LocalNetwork, LocalTransport};
pub use crate::net::RpcNetwork;
pub use crate::node::{DhtNode, LookupSession};
pub use crate::protocol::Method;
pub use crate::server::register_handlers;
pub use crate::transport::{handler, InboundRequest, RequestHandler, RpcCall, Transport};
pub use crate::udp::UdpTransport;
