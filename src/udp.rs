//! UDP transport: one JSON envelope per datagram.
//!
//! A background task owns the receive side of the socket. Inbound requests
//! are dispatched to the registered handlers on their own tasks, responses
//! are routed to the waiter registered under their correlation id. Responses
//! nobody waits for any more (late or unknown ids) are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::framing::{decode_envelope, encode_envelope, MAX_DATAGRAM_SIZE};
use crate::protocol::{Envelope, Request, Response};
use crate::transport::{response_into_result, HandlerTable, RequestHandler, RpcCall, Transport};

type Waiters = HashMap<String, oneshot::Sender<Response>>;
type PendingMap = Arc<Mutex<Waiters>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, Waiters> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns one entry of the pending map and removes it when dropped, including
/// when the caller of `send` gives up on the future.
struct PendingSlot {
    pending: PendingMap,
    id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: PendingMap,
    handlers: Arc<HandlerTable>,
    listener: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind a socket and start serving it.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handlers = Arc::new(HandlerTable::new());

        let listener = tokio::spawn(listen_loop(
            socket.clone(),
            pending.clone(),
            handlers.clone(),
        ));
        debug!(%local_addr, "udp transport listening");

        Ok(Self {
            socket,
            local_addr,
            pending,
            handlers,
            listener,
        })
    }

    /// Stop receiving. Outstanding requests will time out.
    pub fn close(&self) {
        self.listener.abort();
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, call: RpcCall, timeout: Duration) -> Result<JsonValue> {
        let id = Uuid::new_v4().to_string();
        let method = call.method.clone();
        let bytes = encode_envelope(&Envelope::Request(call.into_request(id.clone())))?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), tx);
        let _slot = PendingSlot {
            pending: self.pending.clone(),
            id: id.clone(),
        };

        if let Err(err) = self.socket.send_to(&bytes, to).await {
            return Err(DhtError::Connection(format!("send to {to} failed: {err}")));
        }
        trace!(%to, %method, %id, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response_into_result(response),
            Ok(Err(_)) => Err(DhtError::ChannelClosed),
            Err(_) => {
                debug!(%to, %method, "request timed out");
                Err(DhtError::Timeout)
            }
        }
    }

    fn on_request(&self, method: &str, handler: RequestHandler) -> Result<()> {
        self.handlers.register(method, handler)
    }
}

async fn listen_loop(socket: Arc<UdpSocket>, pending: PendingMap, handlers: Arc<HandlerTable>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms.
                debug!("udp recv error: {e}");
                continue;
            }
        };

        let envelope = match decode_envelope(&buffer[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, "dropping malformed datagram: {e}");
                continue;
            }
        };

        match envelope {
            Envelope::Request(request) => {
                let socket = socket.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    serve_request(socket, handlers, request, from).await;
                });
            }
            Envelope::Response(response) => {
                let waiter = lock_pending(&pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => trace!(%from, id = %response.id, "dropping unmatched response"),
                }
            }
        }
    }
}

async fn serve_request(
    socket: Arc<UdpSocket>,
    handlers: Arc<HandlerTable>,
    request: Request,
    from: SocketAddr,
) {
    let response = handlers.dispatch(request, from).await;
    let id = response.id.clone();
    let bytes = match encode_envelope(&Envelope::Response(response)) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%from, "failed to encode response: {e}");
            match encode_envelope(&Envelope::Response(Response::err(id, e))) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = socket.send_to(&bytes, from).await {
        debug!(%from, "failed to send response: {e}");
    }
}
