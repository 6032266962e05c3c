//! Tunable protocol parameters.
//!
//! Every node, routing table and lookup takes its `K`, `ALPHA` and timeouts
//! from a [`DhtConfig`] so tests can shrink them without touching globals.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;
/// Default number of contacts queried concurrently per lookup round.
pub const DEFAULT_ALPHA: usize = 3;
/// Default per-RPC deadline inside a lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default deadline for any other request sent through a transport.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default deadline for the liveness probe of a full bucket's head.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and number of contacts returned by lookups.
    pub k: usize,
    /// Lookup fan-out per round.
    pub alpha: usize,
    #[serde(rename = "lookup_timeout_ms", with = "duration_ms")]
    pub lookup_timeout: Duration,
    #[serde(rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl DhtConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    /// Raise `k` and `alpha` to at least one, as the builders do. Values
    /// deserialized from a config file bypass the builders.
    pub fn normalized(self) -> Self {
        let (k, alpha) = (self.k, self.alpha);
        self.with_k(k).with_alpha(alpha)
    }

    /// Apply the same deadline to lookups, sends and pings.
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self.send_timeout = timeout;
        self.ping_timeout = timeout;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
