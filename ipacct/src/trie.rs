//! Sparse per-address counter trie.
//!
//! A trie covers one network and is at most three blocks deep:
//!
//! - depth 0: a single leaf block indexed by the low address byte
//! - depth 1: a branch indexed by bits 8-15, holding leaf blocks
//! - depth 2: a branch indexed by bits 16-23, holding depth-1 branches
//!
//! Branch children are allocated on first write. An absent child is
//! logically all-zero. Each block exclusively owns its children, so dropping
//! the root releases the whole structure.

use std::fmt;
use std::sync::Arc;

use crate::block::{BlockLease, BlockPool, FANOUT, try_boxed_array};
use crate::error::{AccountError, Result};
use crate::table::Network;

/// Number of branch levels above the leaf blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Depth {
    /// /24 or longer (and the match-all /0 network): one leaf block.
    Zero,
    /// /16 to /23: one branch level.
    One,
    /// /8 to /15: two branch levels.
    Two,
}

impl Depth {
    /// Derive the depth needed to cover a prefix of `prefix_len` bits.
    pub fn from_prefix_len(prefix_len: u8) -> Result<Depth> {
        match prefix_len {
            0 | 24..=32 => Ok(Depth::Zero),
            16..=23 => Ok(Depth::One),
            8..=15 => Ok(Depth::Two),
            _ => Err(AccountError::UnsupportedPrefix(prefix_len)),
        }
    }

    pub fn levels(self) -> u8 {
        match self {
            Depth::Zero => 0,
            Depth::One => 1,
            Depth::Two => 2,
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels())
    }
}

/// Packet and byte counters for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafCounter {
    pub src_packets: u64,
    pub src_bytes: u64,
    pub dst_packets: u64,
    pub dst_bytes: u64,
}

impl LeafCounter {
    /// A leaf counts as an item once either side has seen a packet.
    pub fn is_occupied(&self) -> bool {
        self.src_packets != 0 || self.dst_packets != 0
    }

    fn record_src(&mut self, bytes: u64) {
        self.src_packets = self.src_packets.wrapping_add(1);
        self.src_bytes = self.src_bytes.wrapping_add(bytes);
    }

    fn record_dst(&mut self, bytes: u64) {
        self.dst_packets = self.dst_packets.wrapping_add(1);
        self.dst_bytes = self.dst_bytes.wrapping_add(bytes);
    }
}

/// Result of counting one packet into a trie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Leaves that went from empty to occupied (0, 1 or 2).
    pub new_items: u32,
    /// The source side was skipped because a block could not be allocated.
    pub dropped_src: bool,
    /// The destination side was skipped because a block could not be allocated.
    pub dropped_dst: bool,
}

impl InsertOutcome {
    pub fn dropped(&self) -> bool {
        self.dropped_src || self.dropped_dst
    }
}

struct LeafBlock {
    slots: Box<[LeafCounter; FANOUT]>,
    _lease: BlockLease,
}

struct BranchBlock {
    /// 1: children are leaf blocks, indexed by bits 8-15.
    /// 2: children are level-1 branches, indexed by bits 16-23.
    level: u8,
    children: Box<[Option<Node>; FANOUT]>,
    _lease: BlockLease,
}

enum Node {
    Leaf(LeafBlock),
    Branch(BranchBlock),
}

impl LeafBlock {
    fn zeroed(pool: &Arc<BlockPool>) -> Result<Self> {
        let lease = pool.lease()?;
        Ok(LeafBlock {
            slots: try_boxed_array(LeafCounter::default)?,
            _lease: lease,
        })
    }
}

impl BranchBlock {
    fn empty(level: u8, pool: &Arc<BlockPool>) -> Result<Self> {
        let lease = pool.lease()?;
        Ok(BranchBlock {
            level,
            children: try_boxed_array(|| None)?,
            _lease: lease,
        })
    }
}

impl Node {
    fn empty(level: u8, pool: &Arc<BlockPool>) -> Result<Node> {
        if level == 0 {
            Ok(Node::Leaf(LeafBlock::zeroed(pool)?))
        } else {
            Ok(Node::Branch(BranchBlock::empty(level, pool)?))
        }
    }

    /// Find the leaf for `addr`, allocating missing blocks on the way down.
    fn leaf_mut(&mut self, addr: u32, pool: &Arc<BlockPool>) -> Result<&mut LeafCounter> {
        match self {
            Node::Leaf(block) => Ok(&mut block.slots[byte_at(addr, 0)]),
            Node::Branch(block) => {
                let slot = &mut block.children[byte_at(addr, block.level)];
                let child = match slot {
                    Some(child) => child,
                    None => slot.insert(Node::empty(block.level - 1, pool)?),
                };
                child.leaf_mut(addr, pool)
            }
        }
    }

    fn leaf(&self, addr: u32) -> Option<&LeafCounter> {
        match self {
            Node::Leaf(block) => Some(&block.slots[byte_at(addr, 0)]),
            Node::Branch(block) => block.children[byte_at(addr, block.level)]
                .as_ref()?
                .leaf(addr),
        }
    }

    /// Deep copy. On failure every block copied so far is dropped.
    fn try_clone(&self, pool: &Arc<BlockPool>) -> Result<Node> {
        match self {
            Node::Leaf(block) => {
                let mut copy = LeafBlock::zeroed(pool)?;
                *copy.slots = *block.slots;
                Ok(Node::Leaf(copy))
            }
            Node::Branch(block) => {
                let mut copy = BranchBlock::empty(block.level, pool)?;
                for (src, dst) in block.children.iter().zip(copy.children.iter_mut()) {
                    if let Some(child) = src {
                        *dst = Some(child.try_clone(pool)?);
                    }
                }
                Ok(Node::Branch(copy))
            }
        }
    }

    fn visit<F>(&self, prefix: u32, f: &mut F) -> Result<()>
    where
        F: FnMut(u32, &LeafCounter) -> Result<()>,
    {
        match self {
            Node::Leaf(block) => {
                for (i, leaf) in block.slots.iter().enumerate() {
                    if leaf.is_occupied() {
                        f(prefix | i as u32, leaf)?;
                    }
                }
            }
            Node::Branch(block) => {
                let shift = 8 * u32::from(block.level);
                for (i, child) in block.children.iter().enumerate() {
                    if let Some(child) = child {
                        child.visit(prefix | ((i as u32) << shift), f)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn count_occupied(&self) -> u32 {
        match self {
            Node::Leaf(block) => block.slots.iter().filter(|leaf| leaf.is_occupied()).count() as u32,
            Node::Branch(block) => block.children.iter().flatten().map(Node::count_occupied).sum(),
        }
    }
}

fn byte_at(addr: u32, level: u8) -> usize {
    ((addr >> (8 * u32::from(level))) & 0xff) as usize
}

/// Owned counter trie for one network.
pub struct CounterTrie {
    depth: Depth,
    root: Node,
    pool: Arc<BlockPool>,
}

impl CounterTrie {
    /// Allocate an empty trie (one zeroed root block).
    pub fn new(depth: Depth, pool: &Arc<BlockPool>) -> Result<Self> {
        Ok(CounterTrie {
            depth,
            root: Node::empty(depth.levels(), pool)?,
            pool: Arc::clone(pool),
        })
    }

    pub fn depth(&self) -> Depth {
        self.depth
    }

    /// Count one packet of `len` bytes.
    ///
    /// The source side is applied before the destination side, so a packet
    /// whose source and destination share a leaf adds at most one item. On
    /// the match-all network only the source side is counted, in slot 0.
    pub fn insert(&mut self, network: &Network, src: u32, dst: u32, len: u32) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let bytes = u64::from(len);

        let (src_key, count_dst) = if network.is_match_all() {
            (Some(0), false)
        } else {
            (network.contains(src).then_some(src), network.contains(dst))
        };

        if let Some(key) = src_key {
            match self.root.leaf_mut(key, &self.pool) {
                Ok(leaf) => {
                    if !leaf.is_occupied() {
                        outcome.new_items += 1;
                    }
                    leaf.record_src(bytes);
                }
                Err(_) => outcome.dropped_src = true,
            }
        }

        if count_dst {
            match self.root.leaf_mut(dst, &self.pool) {
                Ok(leaf) => {
                    if !leaf.is_occupied() {
                        outcome.new_items += 1;
                    }
                    leaf.record_dst(bytes);
                }
                Err(_) => outcome.dropped_dst = true,
            }
        }

        outcome
    }

    /// Counters for `addr`, if its leaf block exists.
    pub fn get(&self, addr: u32) -> Option<LeafCounter> {
        self.root.leaf(addr).copied()
    }

    /// Deep copy into freshly allocated blocks.
    pub fn try_clone(&self) -> Result<CounterTrie> {
        Ok(CounterTrie {
            depth: self.depth,
            root: self.root.try_clone(&self.pool)?,
            pool: Arc::clone(&self.pool),
        })
    }

    /// Visit every occupied leaf in ascending address order.
    ///
    /// Addresses are the in-network offsets OR-ed onto `base`.
    pub fn for_each_record<F>(&self, base: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &LeafCounter) -> Result<()>,
    {
        self.root.visit(base, &mut f)
    }

    /// Number of occupied leaves.
    pub fn occupied_leaves(&self) -> u32 {
        self.root.count_occupied()
    }
}

impl fmt::Debug for CounterTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterTrie")
            .field("depth", &self.depth)
            .field("occupied", &self.occupied_leaves())
            .finish()
    }
}
