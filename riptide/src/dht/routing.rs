use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::InfoHash;
use super::node::{NodeId, NodeInfo, U160};

// Maximum number of nodes in one bucket.
pub const MAX_NODES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {

    pub id: NodeId,

    pub address: SocketAddr,

    // Recently responsive. Bad nodes are the eviction candidates when a
    // bucket overflows.
    pub is_good: bool,

}

impl Node {
    fn info(&self) -> NodeInfo {
        NodeInfo { id: self.id, address: self.address }
    }
}

// A leaf of the trie: all known nodes whose ids fall in [start, end].
// Bounds are inclusive so the top of the id space needs no extra bit.
#[derive(Debug, Clone)]
struct Bucket {
    start: U160,
    end: U160,
    nodes: Vec<Node>,
}

impl Bucket {

    fn contains(&self, key: &U160) -> bool {
        self.start <= *key && *key <= self.end
    }

    fn good(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_good)
    }
}

#[derive(Debug, Clone)]
enum Tree {
    Bucket(Bucket),
    Split {
        // Ids below the center go left, the rest right.
        center: U160,
        lower: Box<Tree>,
        higher: Box<Tree>,
    },
}

// The node directory of a DHT participant: a trie of buckets over the id
// space, plus the peers announced per infohash. All operations are total.
#[derive(Debug, Clone)]
pub struct RoutingTable {

    self_id: NodeId,

    root: Tree,

    // Which peers belong to which swarm; append-only.
    peers: HashMap<InfoHash, HashSet<SocketAddr>>,

}

impl RoutingTable {

    pub fn new(self_id: NodeId) -> RoutingTable {
        RoutingTable {
            self_id,
            root: Tree::Bucket(Bucket {
                start: U160::MIN,
                end: U160::MAX,
                nodes: Vec::new(),
            }),
            peers: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    // Add or refresh a node. Re-inserting a known id overwrites its address
    // and marks it good without changing its bucket position.
    pub fn insert(&mut self, node: NodeInfo) {
        let self_key = U160::from(self.self_id);
        Self::insert_node(
            &mut self.root,
            &self_key,
            Node { id: node.id, address: node.address, is_good: true },
        );
    }

    fn insert_node(tree: &mut Tree, self_key: &U160, node: Node) {

        if let Tree::Split { center, lower, higher } = tree {
            let child = if U160::from(node.id) < *center { lower } else { higher };
            return Self::insert_node(child, self_key, node);
        }
        let Tree::Bucket(bucket) = tree else { unreachable!() };

        if let Some(existing) = bucket.nodes.iter_mut().find(|n| n.id == node.id) {
            existing.address = node.address;
            existing.is_good = true;
            return;
        }

        if bucket.nodes.len() < MAX_NODES {
            bucket.nodes.push(node);
            return;
        }

        if !bucket.contains(self_key) {
            // A full bucket far from our own id evicts a bad node or drops
            // the newcomer.
            if let Some(idx) = bucket.nodes.iter().position(|n| !n.is_good) {
                bucket.nodes.remove(idx);
                bucket.nodes.push(node);
            }
            return;
        }

        // Our own neighbourhood keeps growing: split and place again. The
        // recursion keeps splitting while the target half stays full.
        let full = std::mem::replace(bucket, Bucket {
            start: U160::MIN,
            end: U160::MIN,
            nodes: Vec::new(),
        });
        *tree = Self::split(full);
        Self::insert_node(tree, self_key, node)
    }

    fn split(bucket: Bucket) -> Tree {
        let center = U160::center(&bucket.start, &bucket.end);
        let mut lower = Bucket { start: bucket.start, end: center.pred(), nodes: Vec::new() };
        let mut higher = Bucket { start: center, end: bucket.end, nodes: Vec::new() };
        for node in bucket.nodes {
            if U160::from(node.id) < center {
                lower.nodes.push(node);
            } else {
                higher.nodes.push(node);
            }
        }
        Tree::Split {
            center,
            lower: Box::new(Tree::Bucket(lower)),
            higher: Box::new(Tree::Bucket(higher)),
        }
    }

    // Remove a node wherever it lives. A split left with an empty half
    // collapses back into a single bucket covering the whole range.
    pub fn remove(&mut self, id: &NodeId) {
        Self::remove_node(&mut self.root, &U160::from(*id), id);
    }

    fn remove_node(tree: &mut Tree, key: &U160, id: &NodeId) {
        let Tree::Split { center, lower, higher } = tree else {
            let Tree::Bucket(bucket) = tree else { unreachable!() };
            bucket.nodes.retain(|n| n.id != *id);
            return;
        };

        if *key < *center {
            Self::remove_node(lower, key, id);
        } else {
            Self::remove_node(higher, key, id);
        }

        let merged = match (lower.as_mut(), higher.as_mut()) {
            (Tree::Bucket(l), Tree::Bucket(h)) if l.nodes.is_empty() => Some(Bucket {
                start: l.start,
                end: h.end,
                nodes: std::mem::take(&mut h.nodes),
            }),
            (Tree::Bucket(l), Tree::Bucket(h)) if h.nodes.is_empty() => Some(Bucket {
                start: l.start,
                end: h.end,
                nodes: std::mem::take(&mut l.nodes),
            }),
            _ => None,
        };
        if let Some(bucket) = merged {
            *tree = Tree::Bucket(bucket);
        }
    }

    // The good nodes sharing the longest id prefix with the target: the
    // contents of the leaf bucket covering it.
    pub fn find_bucket(&self, target: &NodeId) -> Vec<NodeInfo> {
        let key = U160::from(*target);
        let mut tree = &self.root;
        loop {
            match tree {
                Tree::Split { center, lower, higher } => {
                    tree = if key < *center { lower } else { higher };
                },
                Tree::Bucket(bucket) => {
                    return bucket.good().map(Node::info).collect();
                },
            }
        }
    }

    // Every good node, lazily, buckets nearest the target first: at each
    // split the walk descends the half covering the target before its
    // sibling.
    pub fn find_nodes(&self, target: &NodeId) -> FindNodes<'_> {
        let empty: &[Node] = &[];
        FindNodes {
            key: U160::from(*target),
            stack: vec![&self.root],
            bucket: empty.iter(),
        }
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        Self::collect_nodes(&self.root, &mut out);
        out
    }

    fn collect_nodes(tree: &Tree, out: &mut Vec<NodeInfo>) {
        match tree {
            Tree::Bucket(bucket) => out.extend(bucket.nodes.iter().map(Node::info)),
            Tree::Split { lower, higher, .. } => {
                Self::collect_nodes(lower, out);
                Self::collect_nodes(higher, out);
            },
        }
    }

    // One pass over the tree marking responsive and unresponsive nodes.
    pub fn update_goodness(&mut self, good_ids: &[NodeId], bad_ids: &[NodeId]) {
        let good: HashSet<&NodeId> = good_ids.iter().collect();
        let bad: HashSet<&NodeId> = bad_ids.iter().collect();
        Self::mark_nodes(&mut self.root, &good, &bad);
    }

    fn mark_nodes(tree: &mut Tree, good: &HashSet<&NodeId>, bad: &HashSet<&NodeId>) {
        match tree {
            Tree::Bucket(bucket) => {
                for node in bucket.nodes.iter_mut() {
                    if good.contains(&node.id) {
                        node.is_good = true;
                    } else if bad.contains(&node.id) {
                        node.is_good = false;
                    }
                }
            },
            Tree::Split { lower, higher, .. } => {
                Self::mark_nodes(lower, good, bad);
                Self::mark_nodes(higher, good, bad);
            },
        }
    }

    pub fn add_peer(&mut self, info_hash: InfoHash, peer: SocketAddr) {
        self.peers.entry(info_hash).or_default().insert(peer);
    }

    pub fn find_peers(&self, info_hash: &InfoHash) -> Option<&HashSet<SocketAddr>> {
        self.peers.get(info_hash)
    }
}

pub struct FindNodes<'a> {
    key: U160,
    stack: Vec<&'a Tree>,
    bucket: std::slice::Iter<'a, Node>,
}

impl<'a> Iterator for FindNodes<'a> {
    type Item = NodeInfo;

    fn next(&mut self) -> Option<NodeInfo> {
        loop {
            for node in self.bucket.by_ref() {
                if node.is_good {
                    return Some(node.info());
                }
            }
            match self.stack.pop()? {
                Tree::Bucket(bucket) => self.bucket = bucket.nodes.iter(),
                Tree::Split { center, lower, higher } => {
                    // Push the far half first so the near half pops first.
                    if self.key < *center {
                        self.stack.push(higher);
                        self.stack.push(lower);
                    } else {
                        self.stack.push(lower);
                        self.stack.push(higher);
                    }
                },
            }
        }
    }
}

// Shared handle to the table: one mutator at a time swaps in a fresh
// snapshot, readers keep whatever snapshot they loaded.
#[derive(Debug, Clone)]
pub struct SharedTable {
    inner: Arc<Mutex<Arc<RoutingTable>>>,
}

impl SharedTable {

    pub fn new(self_id: NodeId) -> SharedTable {
        SharedTable {
            inner: Arc::new(Mutex::new(Arc::new(RoutingTable::new(self_id)))),
        }
    }

    // A consistent view; never blocks on writers for longer than the swap.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.inner.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RoutingTable)) {
        let mut guard = self.inner.lock();
        let mut table = RoutingTable::clone(&guard);
        f(&mut table);
        *guard = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use super::*;
    use super::super::node::NODE_ID_LEN;

    // An id with the given most significant byte.
    fn id(msb: u8, salt: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = msb;
        bytes[NODE_ID_LEN - 1] = salt;
        NodeId(bytes)
    }

    fn info(node_id: NodeId, port: u16) -> NodeInfo {
        NodeInfo {
            id: node_id,
            address: SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), port),
        }
    }

    fn leaf_of(table: &RoutingTable, target: &NodeId) -> (U160, U160) {
        let key = U160::from(*target);
        let mut tree = &table.root;
        loop {
            match tree {
                Tree::Split { center, lower, higher } => {
                    tree = if key < *center { lower } else { higher };
                },
                Tree::Bucket(b) => return (b.start, b.end),
            }
        }
    }

    #[test]
    fn test_insert_up_to_capacity_keeps_one_bucket() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        for i in 0..MAX_NODES as u8 {
            table.insert(info(id(0x40, i), 6881));
        }
        assert!(matches!(table.root, Tree::Bucket(_)));
        assert_eq!(table.all_nodes().len(), MAX_NODES);
    }

    #[test]
    fn test_split_on_own_range_overflow() {
        // Self id zero, nine ids with a clear top bit. One split at 2^159
        // with an empty high half, then further splits below keep all nine.
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        for i in 1..=9u8 {
            let msb = if i % 2 == 1 { 0x00 } else { 0x40 };
            table.insert(info(id(msb, i), 6881));
        }
        assert_eq!(table.all_nodes().len(), 9);

        let Tree::Split { center, ref higher, .. } = table.root else {
            panic!("expected a split at the root");
        };
        let mut expected = [0u8; NODE_ID_LEN];
        expected[0] = 0x80;
        assert_eq!(center, U160(expected));
        match higher.as_ref() {
            Tree::Bucket(b) => assert!(b.nodes.is_empty()),
            _ => panic!("high half should be an empty bucket"),
        }
    }

    #[test]
    fn test_bucket_sizes_bounded_after_many_inserts() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        for msb in 0..64u8 {
            for salt in 0..4u8 {
                table.insert(info(id(msb, salt), 6881));
            }
        }
        fn check(tree: &Tree) {
            match tree {
                Tree::Bucket(b) => assert!(b.nodes.len() <= MAX_NODES),
                Tree::Split { lower, higher, .. } => {
                    check(lower);
                    check(higher);
                },
            }
        }
        check(&table.root);
    }

    #[test]
    fn test_partition_property() {
        // Every id lands in exactly one leaf whose range contains it, and
        // sibling ranges tile the space.
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        for i in 0..32u8 {
            table.insert(info(id(i.wrapping_mul(37), i), 6881));
        }
        for probe in [0x00, 0x01, 0x3f, 0x7f, 0x80, 0xc0, 0xff] {
            let (start, end) = leaf_of(&table, &id(probe, 0xaa));
            let key = U160::from(id(probe, 0xaa));
            assert!(start <= key && key <= end);
        }
        // Leaf ranges are contiguous over the whole space.
        fn ranges(tree: &Tree, out: &mut Vec<(U160, U160)>) {
            match tree {
                Tree::Bucket(b) => out.push((b.start, b.end)),
                Tree::Split { lower, higher, .. } => {
                    ranges(lower, out);
                    ranges(higher, out);
                },
            }
        }
        let mut out = Vec::new();
        ranges(&table.root, &mut out);
        assert_eq!(out.first().unwrap().0, U160::MIN);
        assert_eq!(out.last().unwrap().1, U160::MAX);
        for pair in out.windows(2) {
            assert_eq!(pair[1].0.pred(), pair[0].1);
        }
    }

    #[test]
    fn test_full_far_bucket_evicts_bad_or_drops() {
        // Self id high, so the low half of the space never splits once
        // isolated; fill a far bucket and overflow it.
        let mut table = RoutingTable::new(NodeId([0xff; NODE_ID_LEN]));
        for i in 0..MAX_NODES as u8 {
            table.insert(info(id(0xf0, i), 6881));
        }
        // Force a split so [0, 2^159) becomes a non-self bucket.
        table.insert(info(id(0x01, 0), 6881));
        for i in 1..MAX_NODES as u8 {
            table.insert(info(id(0x01, i), 6881));
        }

        // Overflow with all nodes good: dropped.
        table.insert(info(id(0x02, 0xaa), 6881));
        let all = table.all_nodes();
        assert!(!all.iter().any(|n| n.id == id(0x02, 0xaa)));

        // Mark one bad, overflow again: evicted and replaced.
        table.update_goodness(&[], &[id(0x01, 3)]);
        table.insert(info(id(0x02, 0xbb), 6881));
        let all = table.all_nodes();
        assert!(all.iter().any(|n| n.id == id(0x02, 0xbb)));
        assert!(!all.iter().any(|n| n.id == id(0x01, 3)));
    }

    #[test]
    fn test_reinsert_refreshes_address_and_goodness() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        table.insert(info(id(0x20, 1), 6881));
        table.update_goodness(&[], &[id(0x20, 1)]);
        table.insert(info(id(0x20, 1), 7000));

        let all = table.all_nodes();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address.port(), 7000);
        assert_eq!(table.find_bucket(&id(0x20, 1)).len(), 1);
    }

    #[test]
    fn test_find_bucket_only_good_nodes() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        table.insert(info(id(0x30, 1), 6881));
        table.insert(info(id(0x31, 2), 6881));
        table.update_goodness(&[], &[id(0x31, 2)]);
        let found = table.find_bucket(&id(0x30, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id(0x30, 1));
    }

    #[test]
    fn test_find_nodes_prefers_target_half() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        // Enough spread to split the root.
        for i in 0..9u8 {
            table.insert(info(id(i * 0x11, i), 6881));
        }
        let target = id(0xf0, 0);
        let ordered: Vec<NodeInfo> = table.find_nodes(&target).collect();
        assert_eq!(ordered.len(), 9);

        // Once a node from a nearer bucket has been yielded, no later node
        // may come from a bucket nearer than an earlier one: distances of
        // the first yields must come from the target's own half first.
        let high_half: Vec<bool> = ordered.iter().map(|n| n.id.0[0] >= 0x80).collect();
        let first_low = high_half.iter().position(|h| !h).unwrap_or(high_half.len());
        assert!(high_half[..first_low].iter().all(|h| *h));
        assert!(high_half[first_low..].iter().all(|h| !h));
    }

    #[test]
    fn test_remove_collapses_empty_sibling() {
        let mut table = RoutingTable::new(NodeId([0; NODE_ID_LEN]));
        for i in 0..9u8 {
            table.insert(info(id(0x10 + i, i), 6881));
        }
        assert!(matches!(table.root, Tree::Split { .. }));

        for i in 0..9u8 {
            table.remove(&id(0x10 + i, i));
        }
        // All leaves empty again: every split has collapsed.
        assert!(matches!(table.root, Tree::Bucket(_)));
        let Tree::Bucket(ref b) = table.root else { unreachable!() };
        assert_eq!(b.start, U160::MIN);
        assert_eq!(b.end, U160::MAX);
    }

    #[test]
    fn test_peer_index() {
        let mut table = RoutingTable::new(NodeId::random());
        let info_hash = [0x77; NODE_ID_LEN];
        let p1: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let p2: SocketAddr = "10.0.0.2:6881".parse().unwrap();

        assert!(table.find_peers(&info_hash).is_none());
        table.add_peer(info_hash, p1);
        table.add_peer(info_hash, p2);
        table.add_peer(info_hash, p1);

        let peers = table.find_peers(&info_hash).unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&p1) && peers.contains(&p2));
    }

    #[test]
    fn test_shared_table_snapshots_are_stable() {
        let shared = SharedTable::new(NodeId([0; NODE_ID_LEN]));
        let before = shared.snapshot();
        shared.update(|t| t.insert(info(id(0x42, 1), 6881)));

        // The old snapshot is untouched; a new one sees the write.
        assert_eq!(before.all_nodes().len(), 0);
        assert_eq!(shared.snapshot().all_nodes().len(), 1);
    }
}
