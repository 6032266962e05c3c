//! In-process transport for running many nodes inside one process.
//!
//! A [`LocalNetwork`] is a registry of address → handler table. Every
//! [`LocalTransport`] opened on it can reach the others by address; requests
//! still go through the JSON envelope encoding so handlers see exactly what
//! they would see over UDP. Closing an address makes it unreachable, which is
//! how tests simulate dead peers.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::trace;
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::framing::{decode_envelope, encode_envelope};
use crate::protocol::Envelope;
use crate::transport::{response_into_result, HandlerTable, RequestHandler, RpcCall, Transport};

const FIRST_LOCAL_PORT: u16 = 10_000;

pub struct LocalNetwork {
    hosts: RwLock<HashMap<SocketAddr, Arc<HandlerTable>>>,
    next_port: AtomicU16,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            next_port: AtomicU16::new(FIRST_LOCAL_PORT),
        }
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a transport at `addr`, replacing any host previously there.
    pub fn open(self: &Arc<Self>, addr: SocketAddr) -> LocalTransport {
        let handlers = Arc::new(HandlerTable::new());
        self.hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, handlers.clone());
        LocalTransport {
            network: self.clone(),
            addr,
            handlers,
            sent: AtomicUsize::new(0),
        }
    }

    /// Open a transport on the next free loopback port.
    pub fn open_next(self: &Arc<Self>) -> LocalTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.open(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// Make `addr` unreachable. Returns false if nothing was open there.
    pub fn close(&self, addr: &SocketAddr) -> bool {
        self.hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(addr)
            .is_some()
    }

    pub fn is_open(&self, addr: &SocketAddr) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(addr)
    }

    fn host(&self, addr: &SocketAddr) -> Option<Arc<HandlerTable>> {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(addr)
            .cloned()
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    addr: SocketAddr,
    handlers: Arc<HandlerTable>,
    sent: AtomicUsize,
}

impl LocalTransport {
    /// Requests this transport has attempted to send.
    pub fn requests_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Unregister from the network. Later sends to this address fail.
    pub fn close(&self) {
        self.network.close(&self.addr);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, call: RpcCall, timeout: Duration) -> Result<JsonValue> {
        self.sent.fetch_add(1, Ordering::Relaxed);

        let Some(recipient) = self.network.host(&to) else {
            return Err(DhtError::Connection(format!("recipient {to} not found")));
        };

        let id = Uuid::new_v4().to_string();
        let wire = encode_envelope(&Envelope::Request(call.into_request(id.clone())))?;
        let Envelope::Request(request) = decode_envelope(&wire)? else {
            return Err(DhtError::InvalidMessage("request decoded as response".into()));
        };
        trace!(from = %self.addr, %to, method = %request.method, "local request");

        let response = tokio::time::timeout(timeout, recipient.dispatch(request, self.addr))
            .await
            .map_err(|_| DhtError::Timeout)?;

        let wire = encode_envelope(&Envelope::Response(response))?;
        match decode_envelope(&wire)? {
            Envelope::Response(response) if response.id == id => response_into_result(response),
            _ => Err(DhtError::InvalidMessage("mismatched response".into())),
        }
    }

    fn on_request(&self, method: &str, handler: RequestHandler) -> Result<()> {
        self.handlers.register(method, handler)
    }
}
