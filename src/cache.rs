//! Write-back node cache. Thin wrapper over `lru::LruCache` adding the
//! MRU-to-LRU snapshot the flush engine needs to walk dirty nodes
//! deepest-first.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::node::NodeRef;

pub struct NodeCache {
    inner: LruCache<u64, NodeRef>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: LruCache::new(cap),
        }
    }

    /// Peek without promoting to MRU; used when a caller only needs to
    /// check presence (e.g. the dirty-node collector during flush).
    pub fn find(&self, physical_number: u64) -> Option<NodeRef> {
        self.inner.peek(&physical_number).cloned()
    }

    /// Fetch and promote to MRU.
    pub fn get(&mut self, physical_number: u64) -> Option<NodeRef> {
        self.inner.get(&physical_number).cloned()
    }

    pub fn insert(&mut self, physical_number: u64, node: NodeRef) {
        self.inner.put(physical_number, node);
    }

    pub fn remove(&mut self, physical_number: u64) -> Option<NodeRef> {
        self.inner.pop(&physical_number)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.inner.cap().get()
    }

    /// The current least-recently-used entry, without evicting it.
    pub fn peek_lru(&self) -> Option<(u64, NodeRef)> {
        self.inner.peek_lru().map(|(k, v)| (*k, v.clone()))
    }

    pub fn evict_lru(&mut self) -> Option<(u64, NodeRef)> {
        self.inner.pop_lru()
    }

    /// Snapshot of every cached node, most-recently-used first. Flush uses
    /// this to collect the dirty set once, then sorts that (small) set
    /// rather than touching the cache's own ordering.
    pub fn snapshot_mru_first(&self) -> Vec<NodeRef> {
        self.inner.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = NodeCache::new(2);
        let root = Node::new_root();
        cache.insert(1, root.clone());
        let a = Node::new_data(2, &root);
        cache.insert(2, a);
        assert!(cache.get(1).is_some()); // promotes 1 to MRU, 2 becomes LRU
        let b = Node::new_data(3, &root);
        cache.insert(3, b);
        assert!(cache.find(2).is_none());
        assert!(cache.find(1).is_some());
        assert!(cache.find(3).is_some());
    }
}
