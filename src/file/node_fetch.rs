//! Node fetch: walks the path from root to a target data node,
//! fetching each ancestor from cache or disk (or creating it, on the write
//! path), promoting every ancestor touched to MRU, and enforcing the cache
//! capacity by flushing before it would otherwise overflow.

use std::rc::Rc;

use crate::error::FsResult;
use crate::nav;
use crate::node::{DataNode, MhtNode, Node, NodeKind, NodeRef, NODE_SIZE};

use super::FileInner;

impl FileInner {
    /// Root-to-target chain of `(mht_order, slot_in_parent)`, root first.
    fn ancestor_chain(mht_order: u64) -> Vec<(u64, Option<usize>)> {
        let mut chain = vec![(mht_order, None)];
        let mut cur = mht_order;
        while let Some((parent, slot)) = nav::mht_parent(cur) {
            chain.push((parent, Some(slot)));
            cur = parent;
        }
        chain.reverse();
        chain
    }

    /// Fetches (reading and decrypting from disk if necessary) or, when
    /// `create_if_missing` is set, creates the MHT node at `mht_order`,
    /// along with every ancestor on the path from the root.
    pub(crate) fn fetch_mht(
        &mut self,
        mht_order: u64,
        create_if_missing: bool,
    ) -> FsResult<Option<NodeRef>> {
        if mht_order == 0 {
            self.touch_cache(&self.root.clone());
            return Ok(Some(self.root.clone()));
        }

        let chain = Self::ancestor_chain(mht_order);
        let mut current = self.root.clone();
        for (order, slot) in chain.into_iter().skip(1) {
            let slot = slot.expect("non-root entries always have a parent slot");
            let physical = nav::mht_physical_number(order);

            if let Some(cached) = self.cache.get(physical) {
                current = cached;
                continue;
            }

            let entry = current.borrow().as_mht().mht_entries[slot];
            let node = if entry.is_empty() {
                if !create_if_missing {
                    return Ok(None);
                }
                let node = Node::new_mht(physical, &current);
                // A brand-new MHT node is dirty by construction, but its
                // parent (possibly the root) isn't automatically touched;
                // propagate now so the ancestor chain satisfies invariant A
                // even if no leaf write happens to trigger it later.
                Self::mark_ancestors_dirty(&node);
                node
            } else {
                let mut block = [0u8; NODE_SIZE];
                self.disk.read_block(physical, &mut block)?;
                let mut ciphertext = vec![0u8; NODE_SIZE];
                let mut plaintext = vec![0u8; NODE_SIZE];
                // MHT nodes have no header: the whole block is ciphertext,
                // AAD-bound to nothing extra beyond the key/mac pair already
                // authenticating it from the parent.
                ciphertext.copy_from_slice(&block);
                self.crypto.aead_decrypt(
                    &entry.key,
                    &crate::crypto::ZERO_NONCE,
                    &[],
                    &ciphertext,
                    &entry.gmac,
                    &mut plaintext,
                )?;
                let mht = MhtNode::from_bytes(plaintext.as_slice().try_into().unwrap());
                Rc::new(std::cell::RefCell::new(Node {
                    physical_number: physical,
                    kind: NodeKind::Mht(mht),
                    parent: Some(Rc::downgrade(&current)),
                    dirty: false,
                    new_node: false,
                }))
            };

            self.ensure_cache_room()?;
            self.cache.insert(physical, node.clone());
            current = node;
        }
        Ok(Some(current))
    }

    /// Fetches or creates the data node holding logical data-node index
    /// `data_node_number`. Returns `None` on the read path when the node
    /// was never written (a sparse hole reads as zero without touching disk).
    pub(crate) fn fetch_data(
        &mut self,
        data_node_number: u64,
        create_if_missing: bool,
    ) -> FsResult<Option<NodeRef>> {
        let (mht_order, data_index) = nav::mht_for_data_node(data_node_number);
        let physical = nav::data_physical_number(mht_order, data_index);

        if let Some(cached) = self.cache.get(physical) {
            return Ok(Some(cached));
        }

        let parent = match self.fetch_mht(mht_order, create_if_missing)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let entry = parent.borrow().as_mht().data_entries[data_index];
        let node = if entry.is_empty() {
            if !create_if_missing {
                return Ok(None);
            }
            let node = Node::new_data(physical, &parent);
            Self::mark_ancestors_dirty(&node);
            node
        } else {
            let mut block = [0u8; NODE_SIZE];
            self.disk.read_block(physical, &mut block)?;
            let mut plaintext = DataNode::zeroed();
            self.crypto.aead_decrypt(
                &entry.key,
                &crate::crypto::ZERO_NONCE,
                &[],
                &block,
                &entry.gmac,
                plaintext.plaintext.as_mut_slice(),
            )?;
            Rc::new(std::cell::RefCell::new(Node {
                physical_number: physical,
                kind: NodeKind::Data(plaintext),
                parent: Some(Rc::downgrade(&parent)),
                dirty: false,
                new_node: false,
            }))
        };

        self.ensure_cache_room()?;
        self.cache.insert(physical, node.clone());
        Ok(Some(node))
    }

    fn touch_cache(&mut self, node: &NodeRef) {
        self.cache.insert(node.borrow().physical_number, node.clone());
    }

    /// Evicts the LRU entry if it is clean; otherwise forces a full flush
    /// (which clears every node's dirty bit) and retries once.
    fn ensure_cache_room(&mut self) -> FsResult {
        if !self.cache.is_full() {
            return Ok(());
        }
        if let Some((_, lru)) = self.cache.peek_lru() {
            if !lru.borrow().dirty {
                self.cache.evict_lru();
                return Ok(());
            }
        }
        self.flush()?;
        if self.cache.is_full() {
            self.cache.evict_lru();
        }
        Ok(())
    }
}
