//! Pure logical <-> physical offset arithmetic. No I/O, no caching, no
//! allocation: every function here is total over its documented domain and
//! trivially unit-testable in isolation.

use crate::metadata::MD_USER_DATA_SIZE;
use crate::node::{ATTACHED_DATA_NODES_COUNT, CHILD_MHT_NODES_COUNT, NODE_SIZE};

/// `mht_order` is the 0-based, breadth-first index of an MHT node among all
/// MHT nodes in the tree (root = 0). Physical block numbers are assigned in
/// repeating groups of 97: one MHT node followed by its 96 attached data
/// nodes, offset by one block for the metadata node at physical 0.
const GROUP_SIZE: u64 = 1 + ATTACHED_DATA_NODES_COUNT as u64;

pub fn mht_physical_number(mht_order: u64) -> u64 {
    mht_order * GROUP_SIZE + 1
}

pub fn data_physical_number(mht_order: u64, data_index: usize) -> u64 {
    debug_assert!(data_index < ATTACHED_DATA_NODES_COUNT);
    mht_order * GROUP_SIZE + 2 + data_index as u64
}

/// Parent MHT order and this node's slot index within its parent's child
/// MHT array, for any non-root `mht_order` (a complete
/// `CHILD_MHT_NODES_COUNT`-ary tree in level order: `child = parent*k + i + 1`).
pub fn mht_parent(mht_order: u64) -> Option<(u64, usize)> {
    if mht_order == 0 {
        return None;
    }
    let k = CHILD_MHT_NODES_COUNT as u64;
    let parent = (mht_order - 1) / k;
    let slot = ((mht_order - 1) % k) as usize;
    Some((parent, slot))
}

pub fn mht_child(mht_order: u64, slot: usize) -> u64 {
    debug_assert!(slot < CHILD_MHT_NODES_COUNT);
    mht_order * CHILD_MHT_NODES_COUNT as u64 + slot as u64 + 1
}

/// Inverse of [`mht_physical_number`]/[`data_physical_number`]: every
/// physical block number past the metadata block falls in group
/// `(p-1)/GROUP_SIZE`, whether it names the group's MHT node or one of its
/// attached data nodes (the MHT node's own `p-1` is an exact multiple of
/// `GROUP_SIZE`; a data node's is not, but floors to the same group).
pub fn order_from_physical(physical_number: u64) -> u64 {
    debug_assert!(physical_number >= 1);
    (physical_number - 1) / GROUP_SIZE
}

/// The data index within its owning group for a data node's physical
/// number. Only meaningful when `physical_number` names a data node, not an
/// MHT node.
pub fn data_index_from_physical(physical_number: u64) -> usize {
    (((physical_number - 1) % GROUP_SIZE) - 1) as usize
}

/// Which data node (0-based, logical, across the whole file) owns a given
/// logical offset at or past the inline region, and the byte offset within
/// that 4096-byte node.
pub fn data_node_for_offset(offset: u64) -> (u64, usize) {
    debug_assert!(offset as usize >= MD_USER_DATA_SIZE);
    let rel = offset - MD_USER_DATA_SIZE as u64;
    (rel / NODE_SIZE as u64, (rel % NODE_SIZE as u64) as usize)
}

/// The `mht_order` owning a given logical data node number, and that data
/// node's slot within the owning MHT's data array.
pub fn mht_for_data_node(data_node_number: u64) -> (u64, usize) {
    (
        data_node_number / ATTACHED_DATA_NODES_COUNT as u64,
        (data_node_number % ATTACHED_DATA_NODES_COUNT as u64) as usize,
    )
}

/// Inverse of [`data_node_for_offset`]: the logical offset of the first
/// byte of a given data node.
pub fn offset_for_data_node(data_node_number: u64) -> u64 {
    MD_USER_DATA_SIZE as u64 + data_node_number * NODE_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_first_group() {
        assert_eq!(mht_physical_number(0), 1);
        assert_eq!(data_physical_number(0, 0), 2);
        assert_eq!(data_physical_number(0, 95), 97);
        assert_eq!(mht_physical_number(1), 98);
    }

    #[test]
    fn parent_child_roundtrip() {
        for order in 0..2000u64 {
            let child = mht_child(order, 5);
            assert_eq!(mht_parent(child), Some((order, 5)));
        }
    }

    #[test]
    fn offset_roundtrip() {
        for n in [0u64, 1, 95, 96, 1000] {
            let off = offset_for_data_node(n);
            assert_eq!(data_node_for_offset(off), (n, 0));
            assert_eq!(data_node_for_offset(off + 10), (n, 10));
        }
    }

    #[test]
    fn mht_for_data_node_matches_capacity() {
        assert_eq!(mht_for_data_node(0), (0, 0));
        assert_eq!(mht_for_data_node(95), (0, 95));
        assert_eq!(mht_for_data_node(96), (1, 0));
    }

    #[test]
    fn physical_inverse_round_trips() {
        for order in 0..10u64 {
            assert_eq!(order_from_physical(mht_physical_number(order)), order);
            for idx in [0usize, 1, 50, 95] {
                let p = data_physical_number(order, idx);
                assert_eq!(order_from_physical(p), order);
                assert_eq!(data_index_from_physical(p), idx);
            }
        }
    }
}
