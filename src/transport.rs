//! Transport abstraction shared by the UDP and in-process implementations.
//!
//! A transport moves [`Envelope`](crate::protocol::Envelope)s between
//! addresses. It assigns correlation ids to outbound requests, matches
//! responses to their waiters, and dispatches inbound requests to the one
//! handler registered for their method.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::core::Contact;
use crate::error::{DhtError, Result};
use crate::protocol::{Request, Response};

/// A logical request before it is given a correlation id.
#[derive(Clone, Debug)]
pub struct RpcCall {
    pub method: String,
    pub params: Option<JsonValue>,
    pub from: Option<Contact>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            from: None,
        }
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_from(mut self, from: Contact) -> Self {
        self.from = Some(from);
        self
    }

    pub(crate) fn into_request(self, id: String) -> Request {
        Request {
            id,
            method: self.method,
            params: self.params,
            from: self.from,
        }
    }
}

/// What a handler sees of an inbound request.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    /// Address the request came from.
    pub source: SocketAddr,
    /// Contact the sender announced, if any.
    pub from: Option<Contact>,
    pub params: Option<JsonValue>,
}

/// Asynchronous handler for one RPC method.
pub type RequestHandler =
    Arc<dyn Fn(InboundRequest) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

/// Request/response transport between DHT peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address peers use to reach this transport.
    fn local_addr(&self) -> SocketAddr;

    /// Send `call` to `to` and wait up to `timeout` for the matching response.
    async fn send(&self, to: SocketAddr, call: RpcCall, timeout: Duration) -> Result<JsonValue>;

    /// Register the handler for `method`. A second registration for the same
    /// method fails with [`DhtError::DuplicateHandler`].
    fn on_request(&self, method: &str, handler: RequestHandler) -> Result<()>;
}

/// Method name → handler map used by transports to serve inbound requests.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, RequestHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: &str, handler: RequestHandler) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.contains_key(method) {
            return Err(DhtError::DuplicateHandler(method.to_string()));
        }
        handlers.insert(method.to_string(), handler);
        Ok(())
    }

    pub fn unregister(&self, method: &str) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.remove(method).is_some()
    }

    pub fn methods(&self) -> Vec<String> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut methods: Vec<String> = handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    fn get(&self, method: &str) -> Option<RequestHandler> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(method).cloned()
    }

    /// Run the handler for `request` and build the response to send back.
    ///
    /// Unknown methods and handler failures become error responses; they are
    /// never propagated to the caller of `dispatch`.
    pub async fn dispatch(&self, request: Request, source: SocketAddr) -> Response {
        let Request {
            id,
            method,
            params,
            from,
        } = request;

        let Some(handler) = self.get(&method) else {
            warn!(%method, %source, available = ?self.methods(), "unknown method");
            return Response::err(id, DhtError::UnknownMethod(method));
        };

        let inbound = InboundRequest {
            source,
            from,
            params,
        };
        match handler(inbound).await {
            Ok(result) => Response::ok(id, result),
            Err(err) => {
                debug!(%method, %source, "handler failed: {err}");
                Response::err(id, err)
            }
        }
    }
}

/// Turn a response into the caller's result.
pub(crate) fn response_into_result(response: Response) -> Result<JsonValue> {
    match response.error {
        Some(error) => Err(DhtError::Remote(error)),
        None => Ok(response.result.unwrap_or(JsonValue::Null)),
    }
}

/// Wrap an async closure as a [`RequestHandler`].
pub fn handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<JsonValue>> + Send + 'static,
{
    Arc::new(move |req| -> BoxFuture<'static, Result<JsonValue>> { Box::pin(f(req)) })
}
