#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kad_dht::{
    register_handlers, Contact, DhtConfig, DhtNode, LocalNetwork, LocalTransport, NodeId,
    RpcNetwork, Transport, ID_LENGTH,
};

pub type TestDht = DhtNode<RpcNetwork<LocalTransport>>;

/// Short deadlines so failing peers never slow a test down.
pub fn test_config() -> DhtConfig {
    DhtConfig::default().with_timeouts(Duration::from_millis(500))
}

/// A node served over an in-process transport.
pub struct TestNode {
    pub node: TestDht,
    pub transport: Arc<LocalTransport>,
}

impl TestNode {
    pub fn new(network: &Arc<LocalNetwork>, id: NodeId, config: DhtConfig) -> Self {
        let transport = Arc::new(network.open_next());
        let contact = Contact::new(id, transport.local_addr());
        let rpc = RpcNetwork::new(transport.clone(), contact.clone(), config.send_timeout);
        let node = DhtNode::new(contact, rpc, config);
        register_handlers(&node, transport.as_ref()).expect("fresh transport has no handlers");
        Self { node, transport }
    }

    /// Node whose id is the SHA-1 of `name`.
    pub fn named(network: &Arc<LocalNetwork>, name: &str) -> Self {
        Self::new(network, NodeId::from_text(name), test_config())
    }

    pub fn contact(&self) -> Contact {
        self.node.contact().clone()
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Take the node off the network; requests to it fail from now on.
    pub fn kill(&self) {
        self.transport.close();
    }

    pub fn requests_sent(&self) -> usize {
        self.transport.requests_sent()
    }
}

/// Identifier whose leading bytes are `prefix`, zero elsewhere.
pub fn id_with_prefix(prefix: &[u8]) -> NodeId {
    let mut id = [0u8; ID_LENGTH];
    id[..prefix.len()].copy_from_slice(prefix);
    NodeId::new(id)
}

/// Let each node learn about the next one: `nodes[0] -> nodes[1] -> ...`.
pub async fn chain(nodes: &[&TestNode]) {
    for pair in nodes.windows(2) {
        pair[0].node.insert_or_refresh(pair[1].contact()).await;
    }
}

pub fn assert_sorted_by_distance(contacts: &[Contact], target: &NodeId) {
    for pair in contacts.windows(2) {
        assert!(
            target.distance(&pair[0].id) < target.distance(&pair[1].id),
            "{} should be closer to {} than {}",
            pair[0],
            target.short_hex(),
            pair[1]
        );
    }
}
