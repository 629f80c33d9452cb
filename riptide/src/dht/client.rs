use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::oneshot, task::JoinHandle, time};
use tracing::Instrument;
use crate::{Config, InfoHash};
use super::{
    message::{Body, Envelope, Query, Response, ResponseArgs},
    node::{NodeId, NodeInfo},
    routing::SharedTable,
    Dht, DhtError, Result,
};

// Largest datagram we are willing to parse.
const MAX_DATAGRAM: usize = 2048;

struct Transaction {
    waiter: oneshot::Sender<Result<Response>>,
    deadline: Instant,
}

// KRPC transport: sends queries with fresh transaction ids, routes
// responses back to their waiters, and answers queries from other nodes
// out of the routing table.
pub struct DhtClient {

    self_id: NodeId,

    socket: Arc<UdpSocket>,

    table: SharedTable,

    // In-flight queries keyed by transaction id.
    transactions: Mutex<HashMap<Vec<u8>, Transaction>>,

    next_transaction_id: AtomicU16,

    query_timeout: Duration,

}

impl DhtClient {

    pub async fn bind(table: SharedTable, config: &Config) -> Result<DhtClient> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(DhtClient {
            self_id: table.snapshot().self_id(),
            socket: Arc::new(socket),
            table,
            transactions: Mutex::new(HashMap::new()),
            next_transaction_id: AtomicU16::new(rand::random()),
            query_timeout: config.query_timeout,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    // Spawns the receive loop. The client is inert until this runs.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        let span = tracing::info_span!("dht", id = %self.self_id);
        tokio::spawn(async move {
            self.recv_loop().await;
        }.instrument(span))
    }

    async fn recv_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sweep = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                    Err(e) => {
                        tracing::error!("udp recv error: {}", e);
                        break;
                    },
                },
                _ = sweep.tick() => self.expire_transactions(),
            }
        }
        // Resolve leftover waiters so callers never hang.
        for (_, transaction) in self.transactions.lock().drain() {
            transaction.waiter.send(Err(DhtError::Cancelled)).ok();
        }
    }

    async fn handle_datagram(&self, raw: &[u8], addr: SocketAddr) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("malformed datagram from {}: {}", addr, e);
                return;
            },
        };

        match envelope.body {

            Body::Response { response } => {
                let Some(transaction) = self.transactions.lock().remove(&envelope.transaction_id) else {
                    tracing::trace!("unsolicited response from {}", addr);
                    return;
                };
                transaction.waiter.send(response.classify()).ok();
            },

            Body::Error { error } => {
                tracing::debug!("remote error from {}: {} {}", addr, error.0, error.1);
                if let Some(transaction) = self.transactions.lock().remove(&envelope.transaction_id) {
                    transaction.waiter.send(Err(DhtError::Remote {
                        code: error.0,
                        message: error.1,
                    })).ok();
                }
            },

            Body::Query { query } => self.handle_query(envelope.transaction_id, query, addr).await,
        }
    }

    // Every querier is a live node worth remembering; then answer. We are a
    // participant, not a tracker, so get_peers is answered with nodes only.
    async fn handle_query(&self, transaction_id: Vec<u8>, query: Query, addr: SocketAddr) {
        tracing::debug!("query from {}: {:?}", addr, query);

        self.table.update(|table| table.insert(NodeInfo {
            id: query.querier(),
            address: addr,
        }));

        let response = match query {
            Query::Ping { .. } => ResponseArgs::pong(self.self_id),
            Query::FindNode { target, .. } => self.closest_nodes(&target),
            Query::GetPeers { info_hash, .. } => self.closest_nodes(&info_hash),
        };

        let reply = Envelope::response(transaction_id, response);
        match reply.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    tracing::warn!("failed to answer {}: {}", addr, e);
                }
            },
            Err(e) => tracing::error!("failed to encode response: {}", e),
        }
    }

    fn closest_nodes(&self, target: &NodeId) -> ResponseArgs {
        let nodes = self.table.snapshot().find_bucket(target);
        ResponseArgs::nodes(self.self_id, &nodes)
    }

    fn expire_transactions(&self) {
        let now = Instant::now();
        let mut transactions = self.transactions.lock();
        let expired: Vec<Vec<u8>> = transactions
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in expired {
            if let Some(transaction) = transactions.remove(&tid) {
                transaction.waiter.send(Err(DhtError::Timeout)).ok();
            }
        }
    }

    // One query round trip. The transaction entry is removed on every exit
    // path; if the caller is cancelled mid-wait the sweep clears it within
    // one timeout.
    async fn query(&self, addr: SocketAddr, query: Query) -> Result<Response> {

        let tid = self
            .next_transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.transactions.lock().insert(tid.clone(), Transaction {
            waiter: waiter_tx,
            deadline: Instant::now() + self.query_timeout,
        });

        let envelope = Envelope::query(tid.clone(), query);
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.transactions.lock().remove(&tid);
                return Err(e);
            },
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            self.transactions.lock().remove(&tid);
            return Err(e.into());
        }

        match time::timeout(self.query_timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            // The receive loop is gone.
            Ok(Err(_)) => Err(DhtError::Cancelled),
            Err(_) => {
                self.transactions.lock().remove(&tid);
                Err(DhtError::Timeout)
            },
        }
    }
}

#[async_trait::async_trait]
impl Dht for DhtClient {

    async fn ping(&self, addr: SocketAddr) -> Result<Response> {
        self.query(addr, Query::Ping { id: self.self_id }).await
    }

    async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Response> {
        self.query(addr, Query::FindNode { id: self.self_id, target }).await
    }

    async fn get_peers(&self, addr: SocketAddr, info_hash: InfoHash) -> Result<Response> {
        self.query(addr, Query::GetPeers {
            id: self.self_id,
            info_hash: NodeId(info_hash),
        }).await
    }
}
