use std::net::SocketAddr;
use crate::{block::BlockRequest, Bitfield};

// The swarm-level block scheduler. Peer sessions only consume this
// interface; the implementation lives with the download orchestrator and
// serializes its own state internally, so all methods take &self.
pub trait PiecePicker: Send + Sync {

    // Choose the next block to request from a peer advertising the given
    // piece availability. None if the peer has nothing we want.
    fn pick(&self, availability: &Bitfield, peer: SocketAddr) -> Option<BlockRequest>;

    // A requested block arrived in full.
    fn complete(&self, request: BlockRequest, data: Vec<u8>);

    // Return an unfulfilled request to the pool so another peer can take it.
    fn unpick(&self, request: BlockRequest);

}
