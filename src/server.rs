//! Serving the DHT protocol on a [`Transport`].
//!
//! [`register_handlers`] installs one handler per [`Method`]. Each handler
//! decodes its params, lets the [`DhtNode`] do the work and encodes the
//! result. Malformed params come back to the caller as an RPC error; the
//! transport keeps serving.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::core::{DhtNetwork, FindValueReply};
use crate::error::{DhtError, Result};
use crate::node::DhtNode;
use crate::protocol::{FindNodeParams, FindValueParams, FindValueResult, Method, StoreParams};
use crate::transport::{handler, InboundRequest, Transport};

/// Wire `node` to the four inbound RPCs of `transport`.
///
/// Fails with [`DhtError::DuplicateHandler`] if any of the methods is
/// already served by this transport.
pub fn register_handlers<N, T>(node: &DhtNode<N>, transport: &T) -> Result<()>
where
    N: DhtNetwork,
    T: Transport + ?Sized,
{
    let ping = node.clone();
    transport.on_request(
        Method::Ping.as_str(),
        handler(move |req| serve_ping(ping.clone(), req)),
    )?;

    let store = node.clone();
    transport.on_request(
        Method::Store.as_str(),
        handler(move |req| serve_store(store.clone(), req)),
    )?;

    let find_node = node.clone();
    transport.on_request(
        Method::FindNode.as_str(),
        handler(move |req| serve_find_node(find_node.clone(), req)),
    )?;

    let find_value = node.clone();
    transport.on_request(
        Method::FindValue.as_str(),
        handler(move |req| serve_find_value(find_value.clone(), req)),
    )?;

    Ok(())
}

async fn serve_ping<N: DhtNetwork>(node: DhtNode<N>, req: InboundRequest) -> Result<JsonValue> {
    Ok(JsonValue::Bool(node.handle_ping(req.from).await))
}

async fn serve_store<N: DhtNetwork>(node: DhtNode<N>, req: InboundRequest) -> Result<JsonValue> {
    let StoreParams { key, value } = params(Method::Store, req.params)?;
    node.handle_store(req.from, key, value).await;
    Ok(JsonValue::Null)
}

async fn serve_find_node<N: DhtNetwork>(
    node: DhtNode<N>,
    req: InboundRequest,
) -> Result<JsonValue> {
    let FindNodeParams { id } = params(Method::FindNode, req.params)?;
    let nodes = node.handle_find_node(req.from, id).await;
    Ok(serde_json::to_value(nodes)?)
}

async fn serve_find_value<N: DhtNetwork>(
    node: DhtNode<N>,
    req: InboundRequest,
) -> Result<JsonValue> {
    let FindValueParams { key } = params(Method::FindValue, req.params)?;
    let result = match node.handle_find_value(req.from, key).await {
        FindValueReply::Value(value) => FindValueResult {
            value: Some(value),
            nodes: None,
        },
        FindValueReply::Nodes(nodes) => FindValueResult {
            value: None,
            nodes: Some(nodes),
        },
    };
    Ok(serde_json::to_value(result)?)
}

fn params<P: DeserializeOwned>(method: Method, raw: Option<JsonValue>) -> Result<P> {
    let raw = raw.ok_or_else(|| DhtError::InvalidMessage(format!("{method} without params")))?;
    serde_json::from_value(raw)
        .map_err(|e| DhtError::InvalidMessage(format!("malformed {method} params: {e}")))
}
