//! [`DhtNetwork`] over any [`Transport`].
//!
//! This module provides [`RpcNetwork`], which turns the node's typed calls
//! into JSON requests and decodes the typed replies. Every request carries the
//! local contact in `from` so the receiver can refresh its routing table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::core::{Contact, DhtNetwork, FindValueReply, Key, NodeId, Value};
use crate::error::{DhtError, Result};
use crate::protocol::{FindNodeParams, FindValueParams, FindValueResult, Method, StoreParams};
use crate::transport::{RpcCall, Transport};

/// Kademlia RPCs carried by a [`Transport`].
pub struct RpcNetwork<T: Transport> {
    transport: Arc<T>,
    self_contact: Contact,
    send_timeout: Duration,
}

impl<T: Transport> RpcNetwork<T> {
    pub fn new(transport: Arc<T>, self_contact: Contact, send_timeout: Duration) -> Self {
        Self {
            transport,
            self_contact,
            send_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn self_contact(&self) -> &Contact {
        &self.self_contact
    }

    async fn call<P, R>(&self, to: &Contact, method: Method, params: Option<P>) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let mut call = RpcCall::new(method.as_str()).with_from(self.self_contact.clone());
        if let Some(params) = params {
            call = call.with_params(serde_json::to_value(params)?);
        }
        let result = self.transport.send(to.addr, call, self.send_timeout).await?;
        serde_json::from_value(result).map_err(|e| {
            DhtError::InvalidMessage(format!("malformed {method} result from {to}: {e}"))
        })
    }
}

#[async_trait]
impl<T: Transport> DhtNetwork for RpcNetwork<T> {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        self.call(to, Method::FindNode, Some(FindNodeParams { id: target }))
            .await
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
        let result: FindValueResult = self
            .call(to, Method::FindValue, Some(FindValueParams { key }))
            .await?;
        match result {
            FindValueResult {
                value: Some(value), ..
            } => Ok(FindValueReply::Value(value)),
            FindValueResult {
                nodes: Some(nodes), ..
            } => Ok(FindValueReply::Nodes(nodes)),
            _ => Err(DhtError::InvalidMessage(format!(
                "FIND_VALUE result from {to} has neither value nor nodes"
            ))),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Value) -> Result<()> {
        let _: JsonValue = self
            .call(to, Method::Store, Some(StoreParams { key, value }))
            .await?;
        Ok(())
    }

    async fn ping(&self, to: &Contact) -> Result<bool> {
        self.call(to, Method::Ping, None::<()>).await
    }
}
