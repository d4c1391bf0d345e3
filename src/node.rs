//! In-memory representation of the two physical node kinds (MHT nodes and
//! data nodes) that make up everything past the metadata block.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use static_assertions::const_assert_eq;

use crate::crypto::{AeadKey, AeadMac, AEAD_KEY_SIZE, AEAD_MAC_SIZE};

pub const NODE_SIZE: usize = 4096;
pub const ATTACHED_DATA_NODES_COUNT: usize = 96;
pub const CHILD_MHT_NODES_COUNT: usize = 32;

/// One (key, mac) pair recorded in a parent MHT node for a single child
/// (either a data node or a child MHT node).
#[derive(Clone, Copy, Default)]
pub struct MhtEntry {
    pub key: AeadKey,
    pub gmac: AeadMac,
}

const_assert_eq!(AEAD_KEY_SIZE + AEAD_MAC_SIZE, 32);
const_assert_eq!(
    ATTACHED_DATA_NODES_COUNT * 32 + CHILD_MHT_NODES_COUNT * 32,
    NODE_SIZE
);

impl MhtEntry {
    fn to_bytes(self, out: &mut [u8]) {
        out[0..16].copy_from_slice(self.key.as_ref());
        out[16..32].copy_from_slice(self.gmac.as_ref());
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut key = [0u8; AEAD_KEY_SIZE];
        let mut gmac = [0u8; AEAD_MAC_SIZE];
        key.copy_from_slice(&buf[0..16]);
        gmac.copy_from_slice(&buf[16..32]);
        MhtEntry {
            key: AeadKey(key),
            gmac: AeadMac(gmac),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.as_ref() == [0u8; AEAD_KEY_SIZE] && self.gmac.0 == [0u8; AEAD_MAC_SIZE]
    }
}

/// The plaintext content of an MHT node: exactly 128 fixed-size entries,
/// filling the 4096-byte node with no header (invariant A).
pub struct MhtNode {
    pub data_entries: Box<[MhtEntry; ATTACHED_DATA_NODES_COUNT]>,
    pub mht_entries: Box<[MhtEntry; CHILD_MHT_NODES_COUNT]>,
}

impl MhtNode {
    pub fn empty() -> Self {
        Self {
            data_entries: Box::new([MhtEntry::default(); ATTACHED_DATA_NODES_COUNT]),
            mht_entries: Box::new([MhtEntry::default(); CHILD_MHT_NODES_COUNT]),
        }
    }

    pub fn to_bytes(&self) -> Box<[u8; NODE_SIZE]> {
        let mut buf = Box::new([0u8; NODE_SIZE]);
        let mut off = 0;
        for e in self.data_entries.iter() {
            e.to_bytes(&mut buf[off..off + 32]);
            off += 32;
        }
        for e in self.mht_entries.iter() {
            e.to_bytes(&mut buf[off..off + 32]);
            off += 32;
        }
        debug_assert_eq!(off, NODE_SIZE);
        buf
    }

    pub fn from_bytes(buf: &[u8; NODE_SIZE]) -> Self {
        let mut data_entries = Box::new([MhtEntry::default(); ATTACHED_DATA_NODES_COUNT]);
        let mut mht_entries = Box::new([MhtEntry::default(); CHILD_MHT_NODES_COUNT]);
        let mut off = 0;
        for e in data_entries.iter_mut() {
            *e = MhtEntry::from_bytes(&buf[off..off + 32]);
            off += 32;
        }
        for e in mht_entries.iter_mut() {
            *e = MhtEntry::from_bytes(&buf[off..off + 32]);
            off += 32;
        }
        Self {
            data_entries,
            mht_entries,
        }
    }

}

/// Plaintext content of a data node: an opaque 4096-byte span of the
/// caller's logical stream.
pub struct DataNode {
    pub plaintext: Box<[u8; NODE_SIZE]>,
}

impl DataNode {
    pub fn zeroed() -> Self {
        Self {
            plaintext: Box::new([0u8; NODE_SIZE]),
        }
    }
}

impl Drop for DataNode {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.plaintext.zeroize();
    }
}

pub enum NodeKind {
    Mht(MhtNode),
    Data(DataNode),
}

/// A single node in the in-memory graph mirroring the on-disk tree.
/// `parent` is a `Weak` reference: the cache owns every node by physical
/// number, and a strong parent pointer would make every subtree a
/// reference cycle the moment a child is fetched.
pub struct Node {
    pub physical_number: u64,
    pub kind: NodeKind,
    pub parent: Option<Weak<RefCell<Node>>>,
    /// Set once the node is first created or modified; cleared after a
    /// successful re-encryption during flush.
    pub dirty: bool,
    /// True until the node's first successful flush; distinguishes a
    /// logically-new block (recovery log need not record its prior state,
    /// there isn't one) from a modified existing block.
    pub new_node: bool,
}

pub type NodeRef = Rc<RefCell<Node>>;

impl Node {
    /// A root MHT with nothing in it yet. Not dirty: an empty tree has
    /// nothing to re-encrypt, and a freshly created or reopened file must
    /// never write a root MHT block until a write actually grows the tree.
    pub fn new_root() -> NodeRef {
        Rc::new(RefCell::new(Node {
            physical_number: ROOT_MHT_PHYSICAL_NUMBER,
            kind: NodeKind::Mht(MhtNode::empty()),
            parent: None,
            dirty: false,
            new_node: true,
        }))
    }

    pub fn new_mht(physical_number: u64, parent: &NodeRef) -> NodeRef {
        Rc::new(RefCell::new(Node {
            physical_number,
            kind: NodeKind::Mht(MhtNode::empty()),
            parent: Some(Rc::downgrade(parent)),
            dirty: true,
            new_node: true,
        }))
    }

    pub fn new_data(physical_number: u64, parent: &NodeRef) -> NodeRef {
        Rc::new(RefCell::new(Node {
            physical_number,
            kind: NodeKind::Data(DataNode::zeroed()),
            parent: Some(Rc::downgrade(parent)),
            dirty: true,
            new_node: true,
        }))
    }

    pub fn as_mht(&self) -> &MhtNode {
        match &self.kind {
            NodeKind::Mht(m) => m,
            NodeKind::Data(_) => panic!("node is not an MHT node"),
        }
    }

    pub fn as_mht_mut(&mut self) -> &mut MhtNode {
        match &mut self.kind {
            NodeKind::Mht(m) => m,
            NodeKind::Data(_) => panic!("node is not an MHT node"),
        }
    }

    pub fn as_data(&self) -> &DataNode {
        match &self.kind {
            NodeKind::Data(d) => d,
            NodeKind::Mht(_) => panic!("node is not a data node"),
        }
    }

    pub fn as_data_mut(&mut self) -> &mut DataNode {
        match &mut self.kind {
            NodeKind::Data(d) => d,
            NodeKind::Mht(_) => panic!("node is not a data node"),
        }
    }
}

pub const ROOT_MHT_PHYSICAL_NUMBER: u64 = 1;
pub const METADATA_PHYSICAL_NUMBER: u64 = 0;
