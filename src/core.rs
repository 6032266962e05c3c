//! Core DHT data model: transport-agnostic Kademlia building blocks.
//!
//! - **Identity & Hashing**: [`NodeId`] / [`Key`], SHA-1 derivation from text
//! - **Distance Metrics**: [`Distance`] and the bucket index derived from it
//! - **Routing**: [`RoutingTable`], [`Contact`] and the ping-before-evict policy
//! - **Storage**: [`ValueStore`], the node-local key/value map
//! - **Network seam**: [`DhtNetwork`], the typed RPC calls the node issues
//!
//! The node state machine and the lookup engine built on top of these types
//! live in [`crate::node`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{DhtError, Result};
use crate::protocol::ContactRecord;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier length in bytes (SHA-1 output).
pub const ID_LENGTH: usize = 20;

/// Number of buckets in a routing table, one per bit of the identifier.
pub const NUM_BUCKETS: usize = ID_LENGTH * 8;

/// A 160-bit identifier for nodes and stored values.
///
/// Node ids and value keys share one address space. The textual form is the
/// lowercase, zero-padded 40-character hex encoding of the bytes:
///
/// ```
/// use kad_dht::NodeId;
///
/// let id = NodeId::from_text("node1");
/// let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
/// assert_eq!(id, parsed);
/// assert_eq!(id.to_hex().len(), 40);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LENGTH]);

/// Keys of stored values live in the same space as node ids.
pub type Key = NodeId;

impl NodeId {
    pub const fn new(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a byte slice of exactly [`ID_LENGTH`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_LENGTH] = bytes.try_into().map_err(|_| {
            DhtError::InvalidIdentifier(format!(
                "expected {ID_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != ID_LENGTH * 2 {
            return Err(DhtError::InvalidIdentifier(format!(
                "expected {} hex characters, got {}",
                ID_LENGTH * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| DhtError::InvalidIdentifier(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Derive an identifier from arbitrary text with SHA-1.
    pub fn from_text<S: AsRef<[u8]>>(input: S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input.as_ref());
        Self(hasher.finalize().into())
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the bucket `other` belongs to in a table owned by `self`.
    ///
    /// This is the number of leading zero bits of the distance: 0 when the
    /// most significant bit differs, 159 when only the least significant bit
    /// differs. Identical identifiers have no bucket.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        self.distance(other).leading_zeros()
    }

    /// Order `a` and `b` by their distance to `self`.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Short hex prefix for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", self.short_hex())
    }
}

impl FromStr for NodeId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two identifiers, ordered most-significant byte first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; ID_LENGTH]);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Leading zero bits, `None` for the zero distance.
    pub fn leading_zeros(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(idx, byte)| idx * 8 + byte.leading_zeros() as usize)
    }
}

/// Stable in-place sort of contacts by distance to `target`.
pub fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
}

// ============================================================================
// Contacts
// ============================================================================

/// A remote peer: its identifier and the address its transport listens on.
///
/// Two contacts are the same peer iff their ids match; the address is
/// informational and may be stale. On the wire a contact is the record
/// `{id, address, port}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "ContactRecord", try_from = "ContactRecord")]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short_hex(), self.addr)
    }
}

// ============================================================================
// Routing table
// ============================================================================

/// One k-bucket, ordered from least-recently seen (head) to most-recently
/// seen (tail).
#[derive(Debug, Default, Clone)]
struct Bucket {
    contacts: Vec<Contact>,
}

/// Result of offering a contact to the routing table without probing.
#[derive(Debug)]
pub enum TouchOutcome {
    /// The contact is the table owner; nothing to do.
    Ignored,
    /// Newly appended to a bucket with spare room.
    Inserted,
    /// Already present, moved to the tail.
    Refreshed,
    /// The bucket is full; the head must be probed before deciding.
    Full(PendingEviction),
}

/// A full bucket waiting on the liveness probe of its head.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub bucket_index: usize,
    /// The least-recently seen contact that gets probed.
    pub head: Contact,
    /// The contact that replaces `head` if the probe fails.
    pub candidate: Contact,
}

/// What happened after a probe result was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Head answered; it moved to the tail and the candidate was dropped.
    KeptHead,
    /// Head did not answer; it was removed and the candidate appended.
    Replaced,
    /// The bucket changed while probing; nothing was applied.
    Stale,
}

/// Final result of [`crate::DhtNode::insert_or_refresh`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Ignored,
    Inserted,
    Refreshed,
    KeptHead,
    Replaced,
    Stale,
}

impl From<EvictionOutcome> for Admission {
    fn from(outcome: EvictionOutcome) -> Self {
        match outcome {
            EvictionOutcome::KeptHead => Admission::KeptHead,
            EvictionOutcome::Replaced => Admission::Replaced,
            EvictionOutcome::Stale => Admission::Stale,
        }
    }
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn move_to_tail(&mut self, pos: usize) {
        let existing = self.contacts.remove(pos);
        self.contacts.push(existing);
    }
}

/// Kademlia routing table: 160 lazily created buckets of at most `k` contacts.
///
/// The table is a plain synchronous structure. The liveness probe required
/// when a bucket is full is split into [`touch`](Self::touch), which reports a
/// [`PendingEviction`], and [`resolve_eviction`](Self::resolve_eviction), which
/// applies the probe result only if the probed contact is still the head.
/// Callers can therefore probe without holding any lock on the table.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: BTreeMap<usize, Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: BTreeMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Offer a contact: refresh it, append it, or report that the bucket's
    /// head has to be probed.
    pub fn touch(&mut self, contact: Contact) -> TouchOutcome {
        let Some(index) = self.self_id.bucket_index(&contact.id) else {
            return TouchOutcome::Ignored;
        };
        let k = self.k;
        let bucket = self.buckets.entry(index).or_default();

        if let Some(pos) = bucket.position(&contact.id) {
            bucket.move_to_tail(pos);
            return TouchOutcome::Refreshed;
        }

        if bucket.contacts.len() < k {
            bucket.contacts.push(contact);
            return TouchOutcome::Inserted;
        }

        match bucket.contacts.first() {
            Some(head) => TouchOutcome::Full(PendingEviction {
                bucket_index: index,
                head: head.clone(),
                candidate: contact,
            }),
            None => {
                bucket.contacts.push(contact);
                TouchOutcome::Inserted
            }
        }
    }

    /// Apply the outcome of probing `pending.head`.
    pub fn resolve_eviction(&mut self, pending: PendingEviction, head_alive: bool) -> EvictionOutcome {
        let Some(bucket) = self.buckets.get_mut(&pending.bucket_index) else {
            return EvictionOutcome::Stale;
        };
        let head_unchanged = bucket
            .contacts
            .first()
            .is_some_and(|head| head.id == pending.head.id);
        if !head_unchanged {
            return EvictionOutcome::Stale;
        }

        if head_alive {
            bucket.move_to_tail(0);
            return EvictionOutcome::KeptHead;
        }

        bucket.contacts.remove(0);
        if bucket.position(&pending.candidate.id).is_none() {
            bucket.contacts.push(pending.candidate);
        }
        EvictionOutcome::Replaced
    }

    /// The `count` known contacts closest to `target`, nearest first.
    ///
    /// All buckets are scanned: in a small or skewed network the bucket
    /// nominally covering `target` is often under-populated.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .values()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect();
        sort_by_distance(&mut all, target);
        all.truncate(count);
        all
    }

    /// Snapshot of one bucket, head first.
    pub fn bucket(&self, index: usize) -> Vec<Contact> {
        self.buckets
            .get(&index)
            .map(|b| b.contacts.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.self_id
            .bucket_index(id)
            .and_then(|idx| self.buckets.get(&idx))
            .is_some_and(|b| b.position(id).is_some())
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets that currently hold at least one contact.
    pub fn occupied_buckets(&self) -> usize {
        self.buckets.values().filter(|b| !b.contacts.is_empty()).count()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

// ============================================================================
// Local storage
// ============================================================================

/// Stored values are opaque bytes.
pub type Value = Vec<u8>;

/// Node-local key/value map. Last write wins, nothing expires.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: HashMap<Key, Value>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite, returning the previous value.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        self.values.insert(key, value)
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Reply to a FIND_VALUE request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    /// The responder holds the value.
    Value(Value),
    /// The responder does not; these are the closest contacts it knows.
    Nodes(Vec<Contact>),
}

/// Outbound RPC abstraction used by [`crate::DhtNode`].
///
/// Implementations turn the typed calls into requests on some transport, see
/// [`crate::RpcNetwork`]. Errors are per call; the node applies its own
/// deadlines on top of whatever the implementation enforces.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Send a FIND_NODE RPC for the contacts nearest `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_VALUE RPC.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply>;

    /// Send a STORE RPC.
    async fn store(&self, to: &Contact, key: Key, value: Value) -> Result<()>;

    /// Liveness probe. `Ok(true)` means the peer answered and is alive.
    async fn ping(&self, to: &Contact) -> Result<bool>;
}
