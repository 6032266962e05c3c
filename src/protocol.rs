//! DHT protocol message definitions.
//!
//! Every message on the wire is a JSON [`Envelope`]: either a request
//! `{id, method, params, from}` or a response `{id, result, error}`. A message
//! is a request iff it carries a `method` field; the distinction is made once,
//! when the envelope is deserialized.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::{Contact, Key, NodeId, Value};
use crate::error::DhtError;

/// The four RPC methods of the Kademlia protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    Store,
    FindNode,
    FindValue,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Ping,
        Method::Store,
        Method::FindNode,
        Method::FindValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "PING",
            Method::Store => "STORE",
            Method::FindNode => "FIND_NODE",
            Method::FindValue => "FIND_VALUE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| DhtError::UnknownMethod(s.to_string()))
    }
}

/// Wire form of a [`Contact`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Hex encoded node id.
    pub id: String,
    /// IP address of the peer's transport.
    pub address: String,
    pub port: u16,
}

impl From<Contact> for ContactRecord {
    fn from(contact: Contact) -> Self {
        Self {
            id: contact.id.to_hex(),
            address: contact.addr.ip().to_string(),
            port: contact.addr.port(),
        }
    }
}

impl TryFrom<ContactRecord> for Contact {
    type Error = DhtError;

    fn try_from(record: ContactRecord) -> Result<Self, Self::Error> {
        let id = NodeId::from_hex(&record.id)?;
        let ip: IpAddr = record
            .address
            .parse()
            .map_err(|e| DhtError::InvalidMessage(format!("bad address {}: {e}", record.address)))?;
        Ok(Contact::new(id, SocketAddr::new(ip, record.port)))
    }
}

/// Parameters of a STORE request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreParams {
    pub key: Key,
    pub value: Value,
}

/// Parameters of a FIND_NODE request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeParams {
    pub id: NodeId,
}

/// Parameters of a FIND_VALUE request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueParams {
    pub key: Key,
}

/// Result of a FIND_VALUE request: exactly one of the two fields is set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindValueResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<Contact>>,
}

/// An RPC request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id assigned by the sending transport.
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
    /// The sender's contact, when it takes part in the overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Contact>,
}

/// An RPC response, carrying the id of the request it answers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: String, result: JsonValue) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, error: impl ToString) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Anything that travels between two transports.
///
/// Untagged: deserialization tries [`Request`] first, which only matches
/// when a `method` field is present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(req) => &req.id,
            Envelope::Response(resp) => &resp.id,
        }
    }
}
