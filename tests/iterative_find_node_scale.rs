#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{assert_sorted_by_distance, test_config, TestNode};
use futures::stream::{self, StreamExt};
use kad_dht::{LocalNetwork, NodeId};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;

const NODE_COUNT: usize = 128;
const K_PARAM: usize = 8;
const ALPHA_PARAM: usize = 3;
const TARGET_SAMPLES: usize = 32;
const ORIGINS_PER_TARGET: usize = 4;

#[derive(Debug, Serialize, Clone)]
struct SampleRow {
    origin_index: usize,
    target_index: usize,
    overlap_fraction: f64,
    closest_present: bool,
}

#[derive(Serialize)]
struct AggregateReport {
    node_count: usize,
    k: usize,
    alpha: usize,
    sample_count: usize,
    mean_overlap_fraction: f64,
    min_overlap_fraction: f64,
}

#[derive(Clone)]
struct QuerySpec {
    origin_index: usize,
    target_index: usize,
    target: NodeId,
    perfect_ids: Arc<Vec<NodeId>>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iterative_find_node_quality_report() {
    let network = LocalNetwork::new();
    let mut rng = StdRng::seed_from_u64(7);
    let config = test_config().with_k(K_PARAM).with_alpha(ALPHA_PARAM);

    let nodes: Vec<TestNode> = (0..NODE_COUNT)
        .map(|_| TestNode::new(&network, NodeId::new(rng.gen()), config.clone()))
        .collect();
    let contacts: Arc<Vec<_>> = Arc::new(nodes.iter().map(|n| n.contact()).collect());
    let node_ids: Vec<NodeId> = contacts.iter().map(|c| c.id).collect();

    stream::iter(nodes.iter().enumerate())
        .for_each_concurrent(Some(32), |(idx, node)| {
            let contacts = contacts.clone();
            let node = node.node.clone();
            async move {
                for (peer_idx, peer) in contacts.iter().enumerate() {
                    if idx != peer_idx {
                        node.insert_or_refresh(peer.clone()).await;
                    }
                }
            }
        })
        .await;

    let mut queries = Vec::with_capacity(TARGET_SAMPLES * ORIGINS_PER_TARGET);
    for target_index in 0..TARGET_SAMPLES {
        let target = NodeId::new(rng.gen());
        let perfect_ids = Arc::new(perfect_closest(&node_ids, &target));
        for _ in 0..ORIGINS_PER_TARGET {
            queries.push(QuerySpec {
                origin_index: rng.gen_range(0..NODE_COUNT),
                target_index,
                target,
                perfect_ids: perfect_ids.clone(),
            });
        }
    }

    let dht_nodes: Arc<Vec<_>> = Arc::new(nodes.iter().map(|n| n.node.clone()).collect());
    let samples = Arc::new(Mutex::new(Vec::with_capacity(queries.len())));

    stream::iter(queries)
        .for_each_concurrent(Some(16), |query| {
            let dht_nodes = dht_nodes.clone();
            let samples = samples.clone();
            async move {
                let results = dht_nodes[query.origin_index]
                    .find_node(query.target)
                    .await
                    .expect("iterative lookup succeeds");
                assert!(results.len() <= K_PARAM);
                assert_sorted_by_distance(&results, &query.target);

                let result_ids: HashSet<NodeId> = results.iter().map(|c| c.id).collect();
                let overlap = query
                    .perfect_ids
                    .iter()
                    .filter(|id| result_ids.contains(*id))
                    .count();
                let closest_present = query
                    .perfect_ids
                    .first()
                    .is_some_and(|best| result_ids.contains(best));

                samples.lock().await.push(SampleRow {
                    origin_index: query.origin_index,
                    target_index: query.target_index,
                    overlap_fraction: overlap as f64 / K_PARAM as f64,
                    closest_present,
                });
            }
        })
        .await;

    let mut samples = Arc::try_unwrap(samples)
        .expect("samples still referenced")
        .into_inner();
    samples.sort_by_key(|row| (row.target_index, row.origin_index));

    let overlaps: Vec<f64> = samples.iter().map(|row| row.overlap_fraction).collect();
    let report = AggregateReport {
        node_count: NODE_COUNT,
        k: K_PARAM,
        alpha: ALPHA_PARAM,
        sample_count: samples.len(),
        mean_overlap_fraction: overlaps.iter().sum::<f64>() / overlaps.len() as f64,
        min_overlap_fraction: overlaps.iter().copied().fold(1.0, f64::min),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("serialize report")
    );

    let missing: Vec<&SampleRow> = samples.iter().filter(|row| !row.closest_present).collect();
    assert!(missing.is_empty(), "closest node missing from results: {missing:?}");
}

fn perfect_closest(node_ids: &[NodeId], target: &NodeId) -> Vec<NodeId> {
    let mut sorted = node_ids.to_vec();
    sorted.sort_by(|a, b| target.cmp_distance(a, b));
    sorted.truncate(K_PARAM);
    sorted
}
