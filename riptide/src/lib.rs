mod block;
mod config;
mod picker;

pub mod dht;
pub mod p2p;

// 20-byte identifiers used by both wire protocols.
pub type ID = [u8; 20];

// SHA-1 of a torrent's info dictionary, identifying the swarm.
pub type InfoHash = ID;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use block::{BlockData, BlockRequest, RequestQueue};
pub use config::Config;
pub use picker::PiecePicker;
