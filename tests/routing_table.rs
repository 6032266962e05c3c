use std::net::SocketAddr;

use kad_dht::core::{EvictionOutcome, TouchOutcome};
use kad_dht::{Contact, NodeId, RoutingTable, ID_LENGTH, NUM_BUCKETS};

fn make_node_id(byte: u8) -> NodeId {
    let mut id = [0u8; ID_LENGTH];
    id[0] = byte;
    NodeId::new(id)
}

fn make_contact(byte: u8) -> Contact {
    Contact::new(
        make_node_id(byte),
        SocketAddr::from(([127, 0, 0, 1], 4000 + byte as u16)),
    )
}

fn first_bytes(contacts: &[Contact]) -> Vec<u8> {
    contacts.iter().map(|c| c.id.as_bytes()[0]).collect()
}

#[test]
fn routing_table_orders_contacts_by_distance() {
    let mut table = RoutingTable::new(make_node_id(0x00), 4);
    for byte in [0x10, 0x20, 0x08] {
        table.touch(make_contact(byte));
    }

    let closest = table.closest(&make_node_id(0x18), 3);
    assert_eq!(first_bytes(&closest), vec![0x10, 0x08, 0x20]);
}

#[test]
fn routing_table_respects_bucket_capacity() {
    let mut table = RoutingTable::new(make_node_id(0x00), 2);
    let mut pending = Vec::new();
    for byte in [0x80, 0xC0, 0xA0, 0x90] {
        if let TouchOutcome::Full(eviction) = table.touch(make_contact(byte)) {
            pending.push(eviction);
        }
    }

    assert_eq!(pending.len(), 2);
    assert_eq!(table.len(), 2);
    assert_eq!(first_bytes(&table.bucket(0)), vec![0x80, 0xC0]);
}

#[test]
fn capacity_holds_through_many_evictions() {
    let k = 5;
    let mut table = RoutingTable::new(make_node_id(0x00), k);
    for byte in 0x80..=0xFFu8 {
        if let TouchOutcome::Full(eviction) = table.touch(make_contact(byte)) {
            let alive = byte % 2 == 0;
            let outcome = table.resolve_eviction(eviction, alive);
            assert_ne!(outcome, EvictionOutcome::Stale);
        }
        assert!(table.bucket(0).len() <= k);
    }
    assert_eq!(table.len(), k);
}

#[test]
fn bucket_index_follows_leading_zero_bits() {
    let self_id = make_node_id(0x00);
    for bit in 0..NUM_BUCKETS {
        let mut bytes = [0u8; ID_LENGTH];
        bytes[bit / 8] = 0x80 >> (bit % 8);
        let other = NodeId::new(bytes);
        assert_eq!(self_id.bucket_index(&other), Some(bit));
    }
}

#[test]
fn contacts_land_in_their_buckets() {
    let mut table = RoutingTable::new(make_node_id(0x00), 20);
    table.touch(make_contact(0x80));
    table.touch(make_contact(0x40));
    table.touch(make_contact(0x41));
    table.touch(make_contact(0x01));

    assert_eq!(first_bytes(&table.bucket(0)), vec![0x80]);
    assert_eq!(first_bytes(&table.bucket(1)), vec![0x40, 0x41]);
    assert_eq!(first_bytes(&table.bucket(7)), vec![0x01]);
    assert!(table.bucket(2).is_empty());
    assert_eq!(table.occupied_buckets(), 3);
}

#[test]
fn closest_is_a_prefix_of_the_full_ordering() {
    let self_id = NodeId::from_text("self");
    let mut table = RoutingTable::new(self_id, 20);
    for i in 0..64 {
        table.touch(Contact::new(
            NodeId::from_text(format!("peer{i}")),
            SocketAddr::from(([10, 0, 0, 1], 5000 + i as u16)),
        ));
    }
    let target = NodeId::from_text("target");
    let everything = table.closest(&target, usize::MAX);
    let top = table.closest(&target, 8);
    assert_eq!(top.len(), 8);
    assert_eq!(top[..], everything[..8]);
    assert!(!everything.iter().any(|c| c.id == self_id));
}
