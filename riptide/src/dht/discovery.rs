use std::{
    collections::{HashSet, VecDeque},
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::Instrument;
use crate::{Config, InfoHash};
use super::{
    message::Response,
    node::{NodeId, NodeInfo},
    Dht, DhtError, Result,
};

pub type PeerRx = mpsc::UnboundedReceiver<SocketAddr>;
type PeerTx = mpsc::UnboundedSender<SocketAddr>;

pub struct DiscoveryHandle {

    // Deduplicated peers, delivered as the walk finds them.
    pub peer_rx: PeerRx,

    pub handle: JoinHandle<()>,

}

// An iterative get_peers walk over the DHT for one infohash. Runs until
// its consumer goes away; every individual failure is logged and skipped.
pub struct PeerDiscovery<D: Dht> {

    dht: Arc<D>,

    info_hash: InfoHash,

    bootstrap: String,

    requeue_interval: Duration,

    // Nodes to query next, closest to the infohash first.
    candidates: VecDeque<NodeInfo>,

    // Nodes already queried this round.
    visited: HashSet<NodeId>,

    // Every peer ever emitted; the output stream never repeats one.
    seen_peers: HashSet<SocketAddr>,

    peer_tx: PeerTx,

}

impl<D: Dht + 'static> PeerDiscovery<D> {

    pub fn start(dht: Arc<D>, info_hash: InfoHash, config: &Config) -> DiscoveryHandle {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut walk = PeerDiscovery {
            dht,
            info_hash,
            bootstrap: config.bootstrap.clone(),
            requeue_interval: config.requeue_interval,
            candidates: VecDeque::new(),
            visited: HashSet::new(),
            seen_peers: HashSet::new(),
            peer_tx,
        };

        let span = tracing::info_span!("discovery", info_hash = %hex::encode(info_hash));
        let handle = tokio::spawn(async move {
            match walk.run().await {
                Ok(()) | Err(DhtError::Cancelled) => tracing::debug!("discovery stopped"),
                Err(e) => tracing::warn!("discovery failed: {}", e),
            }
        }.instrument(span));

        DiscoveryHandle { peer_rx, handle }
    }

    async fn run(&mut self) -> Result<()> {

        let mut first_seed = true;
        loop {

            // Dedup can keep the channel untouched for whole rounds, so a
            // gone consumer has to be checked for explicitly.
            if self.peer_tx.is_closed() {
                return Err(DhtError::Cancelled);
            }

            let candidate = match self.candidates.pop_front() {
                Some(candidate) => candidate,
                None => {
                    if first_seed {
                        first_seed = false;
                    } else {
                        time::sleep(self.requeue_interval).await;
                    }
                    // A fresh round may legitimately revisit nodes.
                    self.visited.clear();
                    if let Some(seed) = self.bootstrap().await {
                        self.candidates.push_back(seed);
                    }
                    continue;
                },
            };
            self.visited.insert(candidate.id);

            match self.dht.get_peers(candidate.address, self.info_hash).await {
                Ok(Response::Peers { peers, .. }) => self.emit_peers(peers)?,
                Ok(Response::Nodes { nodes, .. }) => self.extend_candidates(nodes),
                Ok(other) => tracing::trace!("unhelpful answer from {}: {:?}", candidate.address, other),
                Err(e) => tracing::trace!("query to {} failed: {}", candidate.address, e),
            }
        }
    }

    // Ping the bootstrap endpoint; its pong carries the node id we need to
    // seed the walk.
    async fn bootstrap(&self) -> Option<NodeInfo> {

        let address = match self.resolve_bootstrap() {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!("cannot resolve {}: {}", self.bootstrap, e);
                return None;
            },
        };

        match self.dht.ping(address).await {
            Ok(Response::Pong { id }) => {
                tracing::debug!("bootstrap node answered: {}", id);
                Some(NodeInfo { id, address })
            },
            Ok(other) => {
                tracing::warn!("unexpected bootstrap answer: {:?}", other);
                None
            },
            Err(e) => {
                tracing::debug!("bootstrap ping failed: {}", e);
                None
            },
        }
    }

    fn resolve_bootstrap(&self) -> Result<SocketAddr> {
        self.bootstrap
            .to_socket_addrs()?
            .find(SocketAddr::is_ipv4)
            .ok_or(DhtError::NoBootstrap)
    }

    fn emit_peers(&mut self, peers: Vec<SocketAddr>) -> Result<()> {
        for peer in peers {
            if self.seen_peers.insert(peer) {
                tracing::debug!("discovered peer {}", peer);
                // A closed channel means the consumer is done with us.
                self.peer_tx.send(peer).map_err(|_| DhtError::Cancelled)?;
            }
        }
        Ok(())
    }

    // Queue the returned nodes ahead of everything else, closest to the
    // infohash first.
    fn extend_candidates(&mut self, mut nodes: Vec<NodeInfo>) {
        let target = NodeId(self.info_hash);
        nodes.sort_by_key(|node| node.id.distance(&target));
        for node in nodes.into_iter().rev() {
            if self.visited.contains(&node.id) {
                continue;
            }
            if self.candidates.iter().any(|c| c.id == node.id) {
                continue;
            }
            self.candidates.push_front(node);
        }
    }
}
