//! Stand-alone DHT node speaking the JSON protocol over UDP.
//!
//! # Usage
//!
//! ```bash
//! kad-dht --bind 127.0.0.1:4000 --name node1
//! kad-dht --bind 127.0.0.1:4001 --name node2 --peer node1@127.0.0.1:4000 --store foo=bar
//! kad-dht --bind 127.0.0.1:4002 --peer node1@127.0.0.1:4000 --get foo
//! ```
//!
//! Identifiers on the command line are either 40 hex characters or any other
//! text, which is hashed with SHA-1.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kad_dht::{
    register_handlers, Admission, Contact, DhtConfig, DhtError, DhtNode, NodeId, RpcNetwork,
    Transport, UdpTransport,
};

/// A 40-character hex string is taken as the id itself; any other text is
/// hashed. Every flag that names an id or a key goes through here.
fn parse_id(s: &str) -> NodeId {
    NodeId::from_hex(s).unwrap_or_else(|_| NodeId::from_text(s))
}

#[derive(Clone, Debug)]
struct PeerArg(Contact);

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .rsplit_once('@')
            .context("peer must be given as ID@IP:PORT")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        Ok(PeerArg(Contact::new(parse_id(id_part), addr)))
    }
}

#[derive(Clone, Debug)]
struct StoreArg {
    key: String,
    value: String,
}

impl FromStr for StoreArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s.split_once('=').context("store must be given as KEY=VALUE")?;
        Ok(StoreArg {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kad-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Derive the node id from this name instead of picking a random one.
    #[arg(short, long)]
    name: Option<String>,

    /// Known peer, as ID@IP:PORT. Repeatable.
    #[arg(short, long = "peer", value_name = "PEER")]
    peers: Vec<PeerArg>,

    /// JSON file with a DhtConfig. Flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    k: Option<usize>,

    #[arg(long)]
    alpha: Option<usize>,

    #[arg(long, value_name = "MS")]
    lookup_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    send_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    ping_timeout_ms: Option<u64>,

    /// Store KEY=VALUE in the network after start-up. KEY may be hex or text,
    /// as for --get and --find.
    #[arg(long, value_name = "KEY=VALUE")]
    store: Option<StoreArg>,

    /// Look a key up in the network after start-up.
    #[arg(long, value_name = "KEY")]
    get: Option<String>,

    /// Find the nodes closest to an id after start-up.
    #[arg(long, value_name = "ID")]
    find: Option<String>,

    #[arg(short, long, default_value = "60")]
    telemetry_interval: u64,
}

impl Args {
    fn load_config(&self) -> Result<DhtConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => DhtConfig::default(),
        };
        if let Some(k) = self.k {
            config = config.with_k(k);
        }
        if let Some(alpha) = self.alpha {
            config = config.with_alpha(alpha);
        }
        if let Some(ms) = self.lookup_timeout_ms {
            config.lookup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ping_timeout_ms {
            config.ping_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let transport = Arc::new(
        UdpTransport::bind(args.bind)
            .await
            .with_context(|| format!("binding {}", args.bind))?,
    );

    let node_id = match &args.name {
        Some(name) => NodeId::from_text(name),
        None => NodeId::random(),
    };
    let self_contact = Contact::new(node_id, transport.local_addr());
    let network = RpcNetwork::new(transport.clone(), self_contact.clone(), config.send_timeout);
    let node = DhtNode::new(self_contact, network, config);
    register_handlers(&node, transport.as_ref()).context("registering handlers")?;

    info!(id = %node_id, addr = %transport.local_addr(), k = node.config().k, "DHT node started");

    for PeerArg(peer) in &args.peers {
        match node.insert_or_refresh(peer.clone()).await {
            Admission::Ignored => warn!(%peer, "ignoring own id given as peer"),
            admission => info!(%peer, ?admission, "seeded peer"),
        }
    }

    if let Some(StoreArg { key, value }) = &args.store {
        let replicas = node
            .store(parse_id(key), value.clone().into_bytes())
            .await?;
        info!(%key, replicas = replicas.len(), "stored");
        for contact in &replicas {
            println!("stored {key} on {contact}");
        }
    }

    if let Some(key) = &args.get {
        match node.find_value(parse_id(key)).await {
            Ok(value) => println!("{key} = {}", String::from_utf8_lossy(&value)),
            Err(DhtError::NotFound) => println!("{key} not found"),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(target) = &args.find {
        let target = parse_id(target);
        for contact in node.find_node(target).await? {
            println!("{} {}", contact.id, contact.addr);
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, leaving");
                break;
            }
            _ = interval.tick() => {
                info!(
                    contacts = node.routing_len().await,
                    buckets = node.occupied_buckets().await,
                    values = node.value_count().await,
                    "routing table snapshot"
                );
            }
        }
    }

    node.leave().await;
    transport.close();
    Ok(())
}
