use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    block::BlockRequest,
    picker::PiecePicker,
    Config, InfoHash,
};

mod handshake;
mod message;
mod session;
mod state;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;
pub use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
type WeakPeerTx = mpsc::WeakUnboundedSender<PeerCommand>;
type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid payload for message ID: {0}")]
    InvalidMessage(u8),

    #[error("piece was never requested: {0:?}")]
    UnexpectedPiece(BlockRequest),

    #[error("peer did not answer request: {0:?}")]
    PeerDoesNotRespond(BlockRequest),

    #[error("peer never unchoked us")]
    UnchokeTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("command channel closed")]
    ChannelClosed,
}

// Commands processed one at a time by the session task. Everything that can
// change session state arrives here, including frames read off the socket.
pub enum PeerCommand {

    // Inbound frame, forwarded by the reader task.
    PeerMessage(Message),

    // Ask the peer for a block.
    Download(BlockRequest),

    // Declare interest even with nothing queued.
    Interested,

    // Timer ticks.
    SendKeepAlive,
    CheckRequest(BlockRequest),
    CheckUnchoke,

    // The reader task hit EOF or an error.
    SocketClosed(PeerError),

    Shutdown,

}

#[derive(Debug)]
pub enum Event {

    // A requested block arrived; the request has left the pipeline.
    Downloaded(BlockRequest, Vec<u8>),

    // Terminal. The socket is closed and outstanding requests were unpicked.
    Disconnected(PeerError),

}

// Read-only state shared by all peer sessions of one swarm.
pub struct SessionContext {

    pub info_hash: InfoHash,

    pub client_id: crate::ID,

    pub picker: Arc<dyn PiecePicker>,

    pub config: Config,

}

pub struct PeerHandle {

    // Commands to the session.
    pub peer_tx: PeerTx,

    // Downloaded blocks and the final disconnect.
    pub events: EventRx,

    pub session_handle: JoinHandle<()>,

}

impl PeerHandle {
    pub fn connect(address: SocketAddr, ctx: Arc<SessionContext>) -> Self {

        let (mut session, peer_tx, events) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            session.start().await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            events,
            session_handle,
        }
    }
}
