use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockRequest},
    Bitfield,
};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Advises the peer not to close the connection despite silence.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests will be served again.
    Unchoke,

    // The sender wants to request blocks.
    Interested,

    NotInterested,

    // The sender acquired the piece at this index.
    Have { idx: u32 },

    // One bit per piece, MSB first, sent right after the handshake.
    Bitfield(Bitfield),

    // Ask for a block: piece index, byte offset, length.
    Request(BlockRequest),

    // A block of piece data.
    Piece(BlockData),

    // Withdraw an earlier request.
    Cancel(BlockRequest),

    // The sender's DHT port.
    Port { port: u16 },

    // Any ID this client does not speak; carried so the session can ignore it.
    Unknown { id: u8 },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // <len=0013><id=6><index><begin><length>
            Message::Request(request) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(request.piece_idx);
                dst.put_u32(request.offset);
                dst.put_u32(request.len);
            },

            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            },

            // <len=0013><id=8><index><begin><length>
            Message::Cancel(request) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(request.piece_idx);
                dst.put_u32(request.offset);
                dst.put_u32(request.len);
            },

            // <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            Message::Unknown { id } => {
                dst.put_u32(1);
                dst.put_u8(id);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;

        // Wait for the whole frame.
        if src.remaining() < 4 + msg_len {
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_len = msg_len - 1;

        let msg = match id {
            0..=3 => {
                if payload_len != 0 {
                    return Err(PeerError::InvalidMessage(id));
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            },
            4 => {
                if payload_len != 4 {
                    return Err(PeerError::InvalidMessage(id));
                }
                Message::Have { idx: src.get_u32() }
            },
            5 => {
                let mut bitfield = vec![0; payload_len];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 | 8 => {
                if payload_len != 12 {
                    return Err(PeerError::InvalidMessage(id));
                }
                let request = BlockRequest {
                    piece_idx: src.get_u32(),
                    offset: src.get_u32(),
                    len: src.get_u32(),
                };
                if id == 6 { Message::Request(request) } else { Message::Cancel(request) }
            },
            7 => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage(id));
                }
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Piece(BlockData { piece_idx, offset, data })
            },
            9 => {
                if payload_len != 2 {
                    return Err(PeerError::InvalidMessage(id));
                }
                Message::Port { port: src.get_u16() }
            },
            id => {
                // Extension messages and anything newer than us.
                tracing::debug!("ignoring message with unknown id: {}", id);
                src.advance(payload_len);
                Message::Unknown { id }
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(r) => write!(f, "request {{ piece: {}, offset: {}, len: {} }}",
                r.piece_idx,
                r.offset,
                r.len,
            ),
            Message::Piece(b) => write!(f, "piece {{ piece: {}, offset: {}, len: {} }}",
                b.piece_idx,
                b.offset,
                b.data.len(),
            ),
            Message::Cancel(r) => write!(f, "cancel {{ piece: {}, offset: {}, len: {} }}",
                r.piece_idx,
                r.offset,
                r.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Unknown { id } => write!(f, "unknown message id {}", id),
        }
    }
}
