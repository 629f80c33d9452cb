use std::net::SocketAddr;
use crate::InfoHash;

mod client;
mod discovery;
mod message;
mod node;
mod routing;

pub use client::DhtClient;
pub use discovery::{DiscoveryHandle, PeerDiscovery, PeerRx};
pub use message::{Envelope, Query, Response};
pub use node::{decode_nodes, decode_peer, encode_nodes, encode_peer, NodeId, NodeInfo};
pub use routing::{Node, RoutingTable, SharedTable, MAX_NODES};

type Result<T> = std::result::Result<T, DhtError>;

#[derive(thiserror::Error, Debug)]
pub enum DhtError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("query timed out")]
    Timeout,

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("query cancelled")]
    Cancelled,

    #[error("bootstrap endpoint could not be resolved")]
    NoBootstrap,

}

// The queries a DHT node answers. Peer discovery is written against this
// trait so a walk can be driven by anything that resolves queries, the
// production implementation being DhtClient over UDP.
#[async_trait::async_trait]
pub trait Dht: Send + Sync {

    async fn ping(&self, addr: SocketAddr) -> Result<Response>;

    async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Response>;

    async fn get_peers(&self, addr: SocketAddr, info_hash: InfoHash) -> Result<Response>;

}
