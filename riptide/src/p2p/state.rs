use std::time::Instant;
use crate::Bitfield;

// Everything the session knows about one peer. Owned exclusively by the
// session's command-processor task; never shared.
#[derive(Debug)]
pub struct SessionState {

    // Whether we are serving the peer's requests.
    pub am_choking: bool,

    // Whether we want pieces the peer has. True implies an interested
    // message has been sent.
    pub am_interested: bool,

    // Whether the peer is serving our requests.
    pub peer_choking: bool,

    // Whether the peer wants our pieces.
    pub peer_interested: bool,

    // Pieces the peer claims to have. None until a bitfield or have arrives.
    pub peer_bitfield: Option<Bitfield>,

    // Set once the peer has unchoked us at least once.
    pub unchoke_received: bool,

    // When the last command finished processing.
    pub last_message_at: Instant,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
            unchoke_received: false,
            last_message_at: Instant::now(),
        }
    }
}

impl SessionState {

    // Record that the piece at idx is now available from the peer, growing
    // the bitfield if the peer never sent one or sent a short one.
    pub fn set_have(&mut self, idx: u32) {
        let bitfield = self.peer_bitfield.get_or_insert_with(Bitfield::new);
        if bitfield.len() <= idx as usize {
            bitfield.resize(idx as usize + 1, false);
        }
        bitfield.set(idx as usize, true);
    }
}
