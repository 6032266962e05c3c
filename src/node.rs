//! The DHT node: routing-table maintenance, inbound RPC handling and the
//! iterative lookups.
//!
//! A lookup is a [`LookupSession`] driven round by round. Each round takes the
//! unconsulted contacts among the first `alpha` candidates, queries them all
//! concurrently and only moves on once every reply (or timeout) is in. The
//! lookup ends when a round has nobody left to ask.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::core::{
    sort_by_distance, Admission, Contact, DhtNetwork, EvictionOutcome, FindValueReply, Key,
    NodeId, PendingEviction, RoutingTable, TouchOutcome, Value, ValueStore,
};
use crate::error::{DhtError, Result};

/// A Kademlia node.
///
/// # Key Methods
///
/// * [`insert_or_refresh`](Self::insert_or_refresh) - Admit a contact, probing a full bucket's head
/// * [`find_node`](Self::find_node) - Iterative lookup of the contacts closest to an id
/// * [`find_value`](Self::find_value) - Iterative lookup of a stored value
/// * [`store`](Self::store) - Replicate a value on the closest nodes
/// * `handle_*` - Serve the four inbound RPCs
///
/// Cloning is cheap; clones share the routing table, the value store and the
/// network.
pub struct DhtNode<N: DhtNetwork> {
    id: NodeId,
    self_contact: Contact,
    config: DhtConfig,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<RwLock<ValueStore>>,
    network: Arc<N>,
}

impl<N: DhtNetwork> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            self_contact: self.self_contact.clone(),
            config: self.config.clone(),
            routing: self.routing.clone(),
            store: self.store.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: DhtNetwork> DhtNode<N> {
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Self {
        Self::with_shared_network(self_contact, Arc::new(network), config)
    }

    /// Like [`new`](Self::new), for a network the caller keeps a handle to.
    pub fn with_shared_network(self_contact: Contact, network: Arc<N>, config: DhtConfig) -> Self {
        let id = self_contact.id;
        let config = config.normalized();
        Self {
            id,
            routing: Arc::new(RwLock::new(RoutingTable::new(id, config.k))),
            store: Arc::new(RwLock::new(ValueStore::new())),
            self_contact,
            config,
            network,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> &Contact {
        &self.self_contact
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    // ------------------------------------------------------------------
    // Routing table maintenance
    // ------------------------------------------------------------------

    /// Admit `contact` into the routing table.
    ///
    /// When its bucket is full the bucket head is pinged first; this call
    /// returns once the bucket's final state is settled.
    pub async fn insert_or_refresh(&self, contact: Contact) -> Admission {
        let outcome = self.routing.write().await.touch(contact);
        match outcome {
            TouchOutcome::Ignored => Admission::Ignored,
            TouchOutcome::Inserted => Admission::Inserted,
            TouchOutcome::Refreshed => Admission::Refreshed,
            TouchOutcome::Full(pending) => probe_and_resolve(
                self.network.clone(),
                self.routing.clone(),
                pending,
                self.config.ping_timeout,
            )
            .await
            .into(),
        }
    }

    /// Admit `contact` without waiting for a liveness probe.
    ///
    /// A full bucket is resolved by a background task.
    pub async fn observe_contact(&self, contact: Contact) {
        let outcome = self.routing.write().await.touch(contact);
        if let TouchOutcome::Full(pending) = outcome {
            let network = self.network.clone();
            let routing = self.routing.clone();
            let timeout = self.config.ping_timeout;
            tokio::spawn(async move {
                probe_and_resolve(network, routing, pending, timeout).await;
            });
        }
    }

    async fn observe_sender(&self, from: Option<Contact>) {
        if let Some(from) = from {
            self.observe_contact(from).await;
        }
    }

    /// The `count` known contacts closest to `target`, nearest first.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.routing.read().await.closest(target, count)
    }

    pub async fn routing_len(&self) -> usize {
        self.routing.read().await.len()
    }

    /// Snapshot of one bucket, least recently seen first.
    pub async fn bucket(&self, index: usize) -> Vec<Contact> {
        self.routing.read().await.bucket(index)
    }

    pub async fn knows(&self, id: &NodeId) -> bool {
        self.routing.read().await.contains(id)
    }

    pub async fn occupied_buckets(&self) -> usize {
        self.routing.read().await.occupied_buckets()
    }

    // ------------------------------------------------------------------
    // Local storage
    // ------------------------------------------------------------------

    pub async fn get_local(&self, key: &Key) -> Option<Value> {
        self.store.read().await.get(key).cloned()
    }

    pub async fn has_value(&self, key: &Key) -> bool {
        self.store.read().await.contains(key)
    }

    pub async fn value_count(&self) -> usize {
        self.store.read().await.len()
    }

    async fn store_local(&self, key: Key, value: Value) {
        if self.store.write().await.insert(key, value).is_some() {
            trace!(key = %key.short_hex(), "overwrote stored value");
        }
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    pub async fn handle_ping(&self, from: Option<Contact>) -> bool {
        self.observe_sender(from).await;
        true
    }

    pub async fn handle_store(&self, from: Option<Contact>, key: Key, value: Value) {
        self.observe_sender(from).await;
        self.store_local(key, value).await;
    }

    pub async fn handle_find_node(&self, from: Option<Contact>, target: NodeId) -> Vec<Contact> {
        self.observe_sender(from).await;
        self.closest(&target, self.config.k).await
    }

    /// The stored value if there is one, otherwise the closest contacts.
    pub async fn handle_find_value(&self, from: Option<Contact>, key: Key) -> FindValueReply {
        self.observe_sender(from).await;
        match self.get_local(&key).await {
            Some(value) => FindValueReply::Value(value),
            None => FindValueReply::Nodes(self.closest(&key, self.config.k).await),
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    async fn start_session(&self, target: NodeId) -> LookupSession {
        let seeds = self.closest(&target, self.config.k).await;
        LookupSession::new(target, self.config.alpha, self.self_contact.clone(), seeds)
    }

    /// Spawn one RPC per contact, each bounded by the lookup timeout.
    fn spawn_round<R, F, Fut>(&self, round: Vec<Contact>, rpc: F) -> JoinSet<(Contact, Result<R>)>
    where
        R: Send + 'static,
        F: Fn(Arc<N>, Contact) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for contact in round {
            let call = rpc(self.network.clone(), contact.clone());
            let timeout = self.config.lookup_timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(DhtError::Timeout),
                };
                (contact, result)
            });
        }
        tasks
    }

    /// Find the `k` contacts closest to `target` in the whole network.
    ///
    /// The result may include this node itself and is sorted by distance to
    /// `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        let mut session = self.start_session(target).await;
        let mut rounds = 0usize;

        loop {
            let round = session.next_round();
            if round.is_empty() {
                break;
            }
            rounds += 1;
            trace!(lookup = %target.short_hex(), round = rounds, peers = round.len(), "find_node round");

            let mut tasks = self.spawn_round(round, move |network, contact| async move {
                network.find_node(&contact, target).await
            });
            while let Some(joined) = tasks.join_next().await {
                let (contact, result) = match joined {
                    Ok(settled) => settled,
                    Err(e) => {
                        warn!("lookup task failed: {e}");
                        continue;
                    }
                };
                match result {
                    Ok(nodes) => {
                        self.observe_contact(contact).await;
                        session.merge(nodes);
                    }
                    Err(e) if e.is_unreachable() => {
                        debug!(peer = %contact, "find_node unanswered: {e}");
                        session.drop_candidate(&contact.id);
                    }
                    Err(e) => {
                        warn!(peer = %contact, "find_node rejected: {e}");
                        session.drop_candidate(&contact.id);
                    }
                }
            }
        }

        let found = session.finish(self.config.k);
        debug!(lookup = %target.short_hex(), rounds, found = found.len(), "find_node done");
        Ok(found)
    }

    /// Look `key` up in the network.
    ///
    /// A locally stored value is returned without any RPC. Otherwise the
    /// first value any node returns wins and RPCs still in flight are
    /// aborted. [`DhtError::NotFound`] when no reachable node has it.
    pub async fn find_value(&self, key: Key) -> Result<Value> {
        if let Some(value) = self.get_local(&key).await {
            trace!(key = %key.short_hex(), "find_value served locally");
            return Ok(value);
        }

        let mut session = self.start_session(key).await;
        loop {
            let round = session.next_round();
            if round.is_empty() {
                break;
            }

            let mut tasks = self.spawn_round(round, move |network, contact| async move {
                network.find_value(&contact, key).await
            });
            while let Some(joined) = tasks.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(FindValueReply::Value(value)) => {
                        tasks.abort_all();
                        debug!(key = %key.short_hex(), peer = %contact, "value found");
                        self.observe_contact(contact).await;
                        return Ok(value);
                    }
                    Ok(FindValueReply::Nodes(nodes)) => {
                        self.observe_contact(contact).await;
                        session.merge(nodes);
                    }
                    Err(e) if e.is_unreachable() => {
                        debug!(peer = %contact, "find_value unanswered: {e}");
                        session.drop_candidate(&contact.id);
                    }
                    Err(e) => {
                        warn!(peer = %contact, "find_value rejected: {e}");
                        session.drop_candidate(&contact.id);
                    }
                }
            }
        }

        debug!(key = %key.short_hex(), "value not found");
        Err(DhtError::NotFound)
    }

    /// Store `value` under `key` here and on the closest nodes of the
    /// network.
    ///
    /// Returns the contacts that acknowledged the STORE, sorted by distance
    /// to `key`. This node counts as one when it is among the closest.
    pub async fn store(&self, key: Key, value: Value) -> Result<Vec<Contact>> {
        self.store_local(key, value.clone()).await;

        let closest = self.find_node(key).await?;
        let mut stored = Vec::with_capacity(closest.len());
        let mut tasks = JoinSet::new();
        for contact in closest {
            if contact.id == self.id {
                stored.push(contact);
                continue;
            }
            let network = self.network.clone();
            let value = value.clone();
            let timeout = self.config.send_timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, network.store(&contact, key, value)).await {
                    Ok(result) => result,
                    Err(_) => Err(DhtError::Timeout),
                };
                (contact, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => stored.push(contact),
                Err(e) => debug!(peer = %contact, "store failed: {e}"),
            }
        }

        sort_by_distance(&mut stored, &key);
        debug!(key = %key.short_hex(), replicas = stored.len(), "value stored");
        Ok(stored)
    }

    /// Join a network through `bootstrap`. Not available yet; seed the
    /// routing table with [`insert_or_refresh`](Self::insert_or_refresh).
    pub async fn join(&self, bootstrap: Contact) -> Result<()> {
        debug!(peer = %bootstrap, "join requested");
        Err(DhtError::NotImplemented("join"))
    }

    /// Forget every known contact. Inbound requests are still served.
    pub async fn leave(&self) {
        self.routing.write().await.clear();
        debug!(id = %self.id.short_hex(), "left the network");
    }
}

/// Ping the head of a full bucket and apply the result.
async fn probe_and_resolve<N: DhtNetwork>(
    network: Arc<N>,
    routing: Arc<RwLock<RoutingTable>>,
    pending: PendingEviction,
    timeout: Duration,
) -> EvictionOutcome {
    let alive = match tokio::time::timeout(timeout, network.ping(&pending.head)).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(err)) => {
            debug!(peer = %pending.head, "ping failed: {err}");
            false
        }
        Err(_) => {
            debug!(peer = %pending.head, "ping timed out");
            false
        }
    };
    let head = pending.head.clone();
    let outcome = routing.write().await.resolve_eviction(pending, alive);
    trace!(peer = %head, alive, ?outcome, "bucket head probed");
    outcome
}

/// Candidate list of one iterative lookup.
///
/// Candidates stay sorted by distance to the target. A contact is consulted
/// at most once; contacts whose RPC failed are removed and not re-admitted
/// when later replies mention them again.
#[derive(Debug)]
pub struct LookupSession {
    target: NodeId,
    alpha: usize,
    candidates: Vec<Contact>,
    consulted: HashSet<NodeId>,
    failed: HashSet<NodeId>,
}

impl LookupSession {
    /// Seed a session with `self_contact` (already consulted) and `seeds`.
    pub fn new(target: NodeId, alpha: usize, self_contact: Contact, seeds: Vec<Contact>) -> Self {
        let mut session = Self {
            target,
            alpha: alpha.max(1),
            candidates: Vec::new(),
            consulted: HashSet::new(),
            failed: HashSet::new(),
        };
        session.consulted.insert(self_contact.id);
        session.candidates.push(self_contact);
        session.merge(seeds);
        session
    }

    /// Unconsulted contacts among the first `alpha` candidates, marked as
    /// consulted. Empty when the lookup has converged.
    pub fn next_round(&mut self) -> Vec<Contact> {
        let round: Vec<Contact> = self
            .candidates
            .iter()
            .take(self.alpha)
            .filter(|c| !self.consulted.contains(&c.id))
            .cloned()
            .collect();
        for contact in &round {
            self.consulted.insert(contact.id);
        }
        round
    }

    /// Add newly learned contacts and restore distance order.
    pub fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            if self.failed.contains(&contact.id) || self.candidates.contains(&contact) {
                continue;
            }
            self.candidates.push(contact);
        }
        sort_by_distance(&mut self.candidates, &self.target);
    }

    /// Remove a contact whose RPC failed.
    pub fn drop_candidate(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.candidates.retain(|c| &c.id != id);
    }

    pub fn candidates(&self) -> &[Contact] {
        &self.candidates
    }

    pub fn finish(mut self, k: usize) -> Vec<Contact> {
        self.candidates.truncate(k);
        self.candidates
    }
}
