#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{assert_sorted_by_distance, chain, id_with_prefix, test_config, TestNode};
use kad_dht::{
    handler, register_handlers, Admission, Contact, DhtConfig, DhtError, DhtNetwork,
    LocalNetwork, NodeId, Transport,
};
use serde_json::Value as JsonValue;
use tokio::time::Instant;

#[tokio::test]
async fn dead_head_is_replaced_by_newcomer() {
    let network = LocalNetwork::new();
    let owner = TestNode::new(&network, id_with_prefix(&[0x00]), test_config().with_k(2));
    let head = TestNode::new(&network, id_with_prefix(&[0x80]), test_config());
    let second = TestNode::new(&network, id_with_prefix(&[0x81]), test_config());
    let newcomer = TestNode::new(&network, id_with_prefix(&[0x82]), test_config());

    owner.node.insert_or_refresh(head.contact()).await;
    owner.node.insert_or_refresh(second.contact()).await;
    head.kill();

    assert_eq!(
        owner.node.insert_or_refresh(newcomer.contact()).await,
        Admission::Replaced
    );
    assert_eq!(
        owner.node.bucket(0).await,
        vec![second.contact(), newcomer.contact()]
    );
}

#[tokio::test]
async fn inbound_request_replaces_a_dead_head_in_the_background() {
    let network = LocalNetwork::new();
    let owner = TestNode::new(&network, id_with_prefix(&[0x00]), test_config().with_k(1));
    let head = TestNode::new(&network, id_with_prefix(&[0x80]), test_config());
    let newcomer = TestNode::new(&network, id_with_prefix(&[0x81]), test_config());

    owner.node.insert_or_refresh(head.contact()).await;
    head.kill();

    assert!(owner.node.handle_ping(Some(newcomer.contact())).await);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !owner.node.knows(&newcomer.id()).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("newcomer admitted once the head probe fails");
    assert_eq!(owner.node.bucket(0).await, vec![newcomer.contact()]);
}

#[tokio::test]
async fn refreshing_a_known_contact_needs_no_probe() {
    let network = LocalNetwork::new();
    let owner = TestNode::new(&network, id_with_prefix(&[0x00]), test_config().with_k(2));
    let a = TestNode::new(&network, id_with_prefix(&[0x80]), test_config());
    let b = TestNode::new(&network, id_with_prefix(&[0x81]), test_config());

    owner.node.insert_or_refresh(a.contact()).await;
    owner.node.insert_or_refresh(b.contact()).await;
    assert_eq!(
        owner.node.insert_or_refresh(a.contact()).await,
        Admission::Refreshed
    );
    assert_eq!(owner.node.bucket(0).await, vec![b.contact(), a.contact()]);
    assert_eq!(owner.requests_sent(), 0);
}

#[tokio::test]
async fn own_contact_is_never_admitted() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    assert_eq!(a.node.insert_or_refresh(a.contact()).await, Admission::Ignored);
    assert_eq!(a.node.routing_len().await, 0);
}

#[tokio::test]
async fn find_value_prefers_local_copy() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    chain(&[&a, &b]).await;

    let key = NodeId::from_text("foo");
    a.node.handle_store(None, key, b"bar".to_vec()).await;

    let before = a.requests_sent();
    assert_eq!(a.node.find_value(key).await.unwrap(), b"bar".to_vec());
    assert_eq!(a.requests_sent(), before);
}

#[tokio::test]
async fn find_value_walks_towards_the_holder() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    let c = TestNode::named(&network, "node3");
    chain(&[&a, &b, &c]).await;

    let key = NodeId::from_text("foo");
    c.node.handle_store(None, key, b"bar".to_vec()).await;

    assert_eq!(a.node.find_value(key).await.unwrap(), b"bar".to_vec());
    assert!(!a.node.has_value(&key).await);
}

#[tokio::test]
async fn find_value_returns_without_waiting_for_slow_peers() {
    let network = LocalNetwork::new();
    let config = test_config().with_timeouts(Duration::from_secs(30));
    let origin = TestNode::new(&network, id_with_prefix(&[0x00]), config.clone());
    let holder = TestNode::new(&network, id_with_prefix(&[0x80]), config);

    let stalled = network.open_next();
    stalled
        .on_request(
            "FIND_VALUE",
            handler(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(JsonValue::Null)
            }),
        )
        .unwrap();
    let stalled_contact = Contact::new(id_with_prefix(&[0x81]), stalled.local_addr());

    origin.node.insert_or_refresh(holder.contact()).await;
    origin.node.insert_or_refresh(stalled_contact).await;

    let key = NodeId::from_text("foo");
    holder.node.handle_store(None, key, b"bar".to_vec()).await;

    let started = Instant::now();
    assert_eq!(origin.node.find_value(key).await.unwrap(), b"bar".to_vec());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn find_value_reports_missing_keys() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    chain(&[&a, &b]).await;

    let err = a
        .node
        .find_value(NodeId::from_text("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::NotFound));
}

#[tokio::test]
async fn lookup_converges_around_unreachable_contacts() {
    let network = LocalNetwork::new();
    // wide enough to consult every seed in the first round
    let origin = TestNode::new(
        &network,
        NodeId::from_text("origin"),
        test_config().with_alpha(16),
    );
    let live: Vec<TestNode> = (0..5)
        .map(|i| TestNode::named(&network, &format!("live{i}")))
        .collect();
    let dead: Vec<TestNode> = (0..3)
        .map(|i| TestNode::named(&network, &format!("dead{i}")))
        .collect();

    for node in live.iter().chain(dead.iter()) {
        origin.node.insert_or_refresh(node.contact()).await;
    }
    // every live node also knows every dead one
    for node in &live {
        for gone in &dead {
            node.node.insert_or_refresh(gone.contact()).await;
        }
    }
    for node in &dead {
        node.kill();
    }

    let target = NodeId::from_text("somewhere");
    let results = origin.node.find_node(target).await.unwrap();

    assert!(results.len() <= origin.node.config().k);
    assert_sorted_by_distance(&results, &target);
    for gone in &dead {
        assert!(!results.contains(&gone.contact()));
    }
    for node in &live {
        assert!(results.contains(&node.contact()));
    }
    assert!(results.contains(&origin.contact()));
}

#[tokio::test]
async fn inbound_requests_refresh_the_sender() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    chain(&[&a, &b]).await;
    assert!(!b.node.knows(&a.id()).await);

    assert!(a.node.network().ping(&b.contact()).await.unwrap());
    assert!(b.node.knows(&a.id()).await);
}

#[tokio::test]
async fn leave_forgets_contacts_but_still_answers_pings() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    chain(&[&a, &b]).await;

    a.node.leave().await;
    assert_eq!(a.node.routing_len().await, 0);

    assert_eq!(a.node.find_node(b.id()).await.unwrap(), vec![a.contact()]);

    assert!(b.node.network().ping(&a.contact()).await.unwrap());
    assert!(a.node.knows(&b.id()).await);
}

#[tokio::test]
async fn store_skips_peers_that_fail() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    let gone = TestNode::named(&network, "node3");
    chain(&[&a, &b]).await;
    chain(&[&a, &gone]).await;
    gone.kill();

    let key = NodeId::from_text("foo");
    let stored = a.node.store(key, b"bar".to_vec()).await.unwrap();

    let mut expected = vec![a.contact(), b.contact()];
    kad_dht::sort_by_distance(&mut expected, &key);
    assert_eq!(stored, expected);
    assert!(b.node.has_value(&key).await);
}

#[tokio::test]
async fn join_is_not_available() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let b = TestNode::named(&network, "node2");
    let err = a.node.join(b.contact()).await.unwrap_err();
    assert!(matches!(err, DhtError::NotImplemented(_)));
}

#[tokio::test]
async fn handlers_cannot_be_registered_twice() {
    let network = LocalNetwork::new();
    let a = TestNode::named(&network, "node1");
    let err = register_handlers(&a.node, a.transport.as_ref()).unwrap_err();
    assert!(matches!(err, DhtError::DuplicateHandler(m) if m == "PING"));
}

#[tokio::test]
async fn zero_sizes_from_a_config_file_are_raised_to_one() {
    let network = LocalNetwork::new();
    let config: DhtConfig = serde_json::from_str(r#"{"k": 0, "alpha": 0}"#).unwrap();
    let a = TestNode::new(&network, NodeId::from_text("node1"), config);
    let b = TestNode::named(&network, "node2");
    chain(&[&a, &b]).await;

    assert_eq!(a.node.config().k, 1);
    assert_eq!(a.node.config().alpha, 1);
    assert_eq!(a.node.routing_len().await, 1);

    let key = NodeId::from_text("foo");
    let stored = a.node.store(key, b"bar".to_vec()).await.unwrap();
    assert_eq!(stored.len(), 1);
}
