use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use bytes::{Buf, BufMut};
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use super::DhtError;

pub const NODE_ID_LEN: usize = 20;

// id ‖ IPv4 ‖ port.
const COMPACT_NODE_LEN: usize = 26;
const COMPACT_PEER_LEN: usize = 6;

// A 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {

    pub fn random() -> NodeId {
        let mut id = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill(&mut id);
        NodeId(id)
    }

    // XOR metric: the distance between two ids is their XOR read as an
    // unsigned 160-bit integer.
    pub fn distance(&self, other: &NodeId) -> U160 {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        U160(out)
    }
}

impl From<NodeId> for U160 {
    fn from(id: NodeId) -> U160 {
        U160(id.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Bencode represents ids as plain 20-byte strings.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "a 20-byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                let id: [u8; NODE_ID_LEN] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(NodeId(id))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<NodeId, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

// An unsigned 160-bit integer over big-endian bytes. Backs bucket bounds
// and XOR distances; comparison is numeric because the bytes are big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct U160(pub [u8; NODE_ID_LEN]);

impl U160 {

    pub const MIN: U160 = U160([0x00; NODE_ID_LEN]);
    pub const MAX: U160 = U160([0xff; NODE_ID_LEN]);

    // (a + b + 1) / 2 without needing a 161st bit: the carry out of the
    // addition becomes the top bit after the shift.
    pub fn center(a: &U160, b: &U160) -> U160 {
        let mut out = [0u8; NODE_ID_LEN];
        let mut carry = 1u16;
        for i in (0..NODE_ID_LEN).rev() {
            let sum = a.0[i] as u16 + b.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        let mut top = carry as u8;
        for byte in out.iter_mut() {
            let low = *byte & 1;
            *byte = (*byte >> 1) | (top << 7);
            top = low;
        }
        U160(out)
    }

    // The value one below self. Must not be called on zero.
    pub fn pred(&self) -> U160 {
        debug_assert_ne!(*self, U160::MIN, "predecessor of zero");
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (value, borrow) = byte.overflowing_sub(1);
            *byte = value;
            if !borrow {
                break;
            }
        }
        U160(out)
    }
}

impl std::fmt::Debug for U160 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// A DHT node's routable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: SocketAddr,
}

// Compact codecs. Only IPv4 endpoints have a compact form; others are
// skipped on encode and can never appear on decode.

pub fn encode_nodes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        if let IpAddr::V4(ip) = node.address.ip() {
            out.extend_from_slice(&node.id.0);
            out.extend_from_slice(&ip.octets());
            out.put_u16(node.address.port());
        }
    }
    out
}

pub fn decode_nodes(mut raw: &[u8]) -> Result<Vec<NodeInfo>, DhtError> {
    if raw.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::Malformed(format!(
            "compact node list of {} bytes",
            raw.len(),
        )));
    }
    let mut nodes = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    while raw.has_remaining() {
        let mut id = [0u8; NODE_ID_LEN];
        raw.copy_to_slice(&mut id);
        let ip = Ipv4Addr::from(raw.get_u32());
        let port = raw.get_u16();
        nodes.push(NodeInfo {
            id: NodeId(id),
            address: SocketAddr::new(ip.into(), port),
        });
    }
    Ok(nodes)
}

pub fn encode_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut out = [0u8; COMPACT_PEER_LEN];
            out[..4].copy_from_slice(&ip.octets());
            out[4..].copy_from_slice(&addr.port().to_be_bytes());
            Some(out)
        },
        IpAddr::V6(_) => None,
    }
}

pub fn decode_peer(mut raw: &[u8]) -> Result<SocketAddr, DhtError> {
    if raw.len() != COMPACT_PEER_LEN {
        return Err(DhtError::Malformed(format!("compact peer of {} bytes", raw.len())));
    }
    let ip = Ipv4Addr::from(raw.get_u32());
    let port = raw.get_u16();
    Ok(SocketAddr::new(ip.into(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_byte: u8, port: u16) -> NodeInfo {
        NodeInfo {
            id: NodeId([id_byte; NODE_ID_LEN]),
            address: SocketAddr::new(Ipv4Addr::new(10, 0, 0, id_byte).into(), port),
        }
    }

    #[test]
    fn test_distance_is_xor() {
        let a = NodeId([0b1100_0000; NODE_ID_LEN]);
        let b = NodeId([0b1010_0000; NODE_ID_LEN]);
        assert_eq!(a.distance(&b), U160([0b0110_0000; NODE_ID_LEN]));
        assert_eq!(a.distance(&a), U160::MIN);
        // Symmetric.
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_center_of_full_range() {
        // (0 + 2^160 - 1 + 1) / 2 = 2^159.
        let center = U160::center(&U160::MIN, &U160::MAX);
        let mut expected = [0u8; NODE_ID_LEN];
        expected[0] = 0x80;
        assert_eq!(center, U160(expected));
    }

    #[test]
    fn test_center_small_values() {
        let two = U160({ let mut b = [0; NODE_ID_LEN]; b[NODE_ID_LEN - 1] = 2; b });
        let six = U160({ let mut b = [0; NODE_ID_LEN]; b[NODE_ID_LEN - 1] = 6; b });
        let four = U160({ let mut b = [0; NODE_ID_LEN]; b[NODE_ID_LEN - 1] = 4; b });
        // (2 + 6 + 1) / 2 = 4.
        assert_eq!(U160::center(&two, &six), four);
    }

    #[test]
    fn test_pred_borrows_across_bytes() {
        let one_high = U160({ let mut b = [0; NODE_ID_LEN]; b[0] = 1; b });
        let mut expected = [0xff; NODE_ID_LEN];
        expected[0] = 0;
        assert_eq!(one_high.pred(), U160(expected));
        assert_eq!(U160::MAX.pred().0[NODE_ID_LEN - 1], 0xfe);
    }

    #[test]
    fn test_compact_nodes_roundtrip() {
        let nodes = vec![node(1, 6881), node(2, 51413)];
        let raw = encode_nodes(&nodes);
        assert_eq!(raw.len(), 52);
        assert_eq!(decode_nodes(&raw).unwrap(), nodes);
    }

    #[test]
    fn test_compact_nodes_skips_ipv6() {
        let v6 = NodeInfo {
            id: NodeId([9; NODE_ID_LEN]),
            address: "[::1]:6881".parse().unwrap(),
        };
        let raw = encode_nodes(&[node(1, 6881), v6]);
        assert_eq!(decode_nodes(&raw).unwrap(), vec![node(1, 6881)]);
    }

    #[test]
    fn test_compact_nodes_rejects_partial_entry() {
        assert!(decode_nodes(&[0u8; 27]).is_err());
    }

    #[test]
    fn test_compact_peer_roundtrip() {
        let addr: SocketAddr = "192.168.1.9:6881".parse().unwrap();
        let raw = encode_peer(&addr).unwrap();
        assert_eq!(raw, [192, 168, 1, 9, 0x1a, 0xe1]);
        assert_eq!(decode_peer(&raw).unwrap(), addr);
        assert!(decode_peer(&raw[..4]).is_err());
    }
}
