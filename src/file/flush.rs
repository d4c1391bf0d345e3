//! Crash-consistent flush / commit engine: S1 write the recovery log, S2 set
//! the metadata update flag, S3 re-encrypt the dirty subtree bottom-up, S4
//! re-encrypt and commit metadata, S5 write it durably, S6 delete the
//! recovery log. S0 (idle, nothing dirty) is the fast path out at the top.

use log::debug;
use std::rc::Rc;

use crate::crypto::ZERO_NONCE;
use crate::error::{FsError, FsResult};
use crate::host::RecoveryRecord;
use crate::nav;
use crate::node::{NodeKind, NodeRef, METADATA_PHYSICAL_NUMBER, NODE_SIZE};

use super::FileInner;

impl FileInner {
    pub(crate) fn flush(&mut self) -> FsResult {
        if !self.any_dirty() {
            return Ok(());
        }

        debug!("flush: S1 write recovery log");
        self.s1_write_recovery_log()?;

        debug!("flush: S2 set update flag");
        self.s2_set_update_flag()?;

        debug!("flush: S3 re-encrypt dirty tree");
        self.s3_reencrypt_tree()?;

        debug!("flush: S4/S5 commit metadata");
        self.metadata.set_update_flag(false);
        let ciphertext = self
            .metadata
            .encrypt(self.crypto.as_ref(), &self.kdk)
            .map_err(|_| FsError::CryptoError)?;
        self.metadata
            .write_to_disk(self.disk.as_mut(), &*ciphertext)
            .map_err(|_| FsError::WriteToDiskFailed)?;
        self.disk.flush().map_err(|_| FsError::WriteToDiskFailed)?;
        self.metadata_dirty = false;

        debug!("flush: S6 delete recovery log");
        self.recovery_log
            .delete()
            .map_err(|_| FsError::CantWriteRecoveryFile)?;

        Ok(())
    }

    fn any_dirty(&self) -> bool {
        self.metadata_dirty
            || self.root.borrow().dirty
            || self
                .cache
                .snapshot_mru_first()
                .iter()
                .any(|n| n.borrow().dirty)
    }

    /// Every dirty node, root included even though the root lives outside
    /// the LRU cache proper (it is always reachable via `self.root`, so it
    /// never gets a chance to be evicted and re-fetched through the cache).
    fn dirty_nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self
            .cache
            .snapshot_mru_first()
            .into_iter()
            .filter(|n| n.borrow().dirty)
            .collect();
        if self.root.borrow().dirty && !nodes.iter().any(|n| Rc::ptr_eq(n, &self.root)) {
            nodes.push(self.root.clone());
        }
        nodes
    }

    fn s1_write_recovery_log(&mut self) -> FsResult {
        self.recovery_log
            .create()
            .map_err(|_| FsError::CantOpenRecoveryFile)?;

        for node in self.dirty_nodes() {
            let (physical_number, new_node) = {
                let n = node.borrow();
                (n.physical_number, n.new_node)
            };
            if new_node {
                continue; // no prior on-disk image exists to protect
            }
            let mut preimage = vec![0u8; NODE_SIZE];
            self.disk
                .read_block(physical_number, &mut preimage)
                .map_err(|_| FsError::CantWriteRecoveryFile)?;
            self.recovery_log
                .append(&RecoveryRecord {
                    physical_number,
                    preimage,
                })
                .map_err(|_| FsError::CantWriteRecoveryFile)?;
        }

        // The metadata block's pre-image is appended last: recovery replays
        // log records in order, so a tree partially restored from its
        // records followed by a restored metadata block is consistent,
        // while restoring metadata first and the tree second would not be.
        if self.disk.block_count() > METADATA_PHYSICAL_NUMBER {
            let mut preimage = vec![0u8; NODE_SIZE];
            self.disk
                .read_block(METADATA_PHYSICAL_NUMBER, &mut preimage)
                .map_err(|_| FsError::CantWriteRecoveryFile)?;
            self.recovery_log
                .append(&RecoveryRecord {
                    physical_number: METADATA_PHYSICAL_NUMBER,
                    preimage,
                })
                .map_err(|_| FsError::CantWriteRecoveryFile)?;
        }

        self.recovery_log
            .commit()
            .map_err(|_| FsError::CantWriteRecoveryFile)?;
        self.recovery_log
            .close()
            .map_err(|_| FsError::CantWriteRecoveryFile)
    }

    /// Marks the metadata block as mid-flush and persists that alone, so a
    /// crash between here and S5 leaves an unambiguous signal for recovery
    /// even before any tree node has been touched.
    fn s2_set_update_flag(&mut self) -> FsResult {
        self.metadata.set_update_flag(true);
        let ciphertext = self
            .metadata
            .encrypt(self.crypto.as_ref(), &self.kdk)
            .map_err(|_| FsError::CryptoError)?;
        self.metadata
            .write_to_disk(self.disk.as_mut(), &*ciphertext)
            .map_err(|_| FsError::WriteToDiskFailed)?;
        self.disk.flush().map_err(|_| FsError::WriteToDiskFailed)
    }

    fn s3_reencrypt_tree(&mut self) -> FsResult {
        let mut dirty = self.dirty_nodes();

        // Data nodes first (mutual order immaterial), then MHT nodes
        // deepest-first by descending physical number, so a child's new key
        // is always written into its parent's entry array before the
        // parent itself is re-encrypted. The root (no parent entry to
        // update) sorts last among MHT nodes since it has the lowest
        // physical number.
        dirty.sort_by_key(|n| {
            let n = n.borrow();
            let rank = match &n.kind {
                NodeKind::Data(_) => 0u8,
                NodeKind::Mht(_) => 1u8,
            };
            (rank, u64::MAX - n.physical_number)
        });

        for node in dirty {
            self.reencrypt_node(&node)?;
        }
        Ok(())
    }

    fn reencrypt_node(&mut self, node: &NodeRef) -> FsResult {
        let physical_number = node.borrow().physical_number;
        let key = self
            .session
            .derive_node_key(self.crypto.as_ref(), physical_number)
            .map_err(|_| FsError::CryptoError)?;

        let is_data = matches!(node.borrow().kind, NodeKind::Data(_));
        let plaintext: Vec<u8> = {
            let n = node.borrow();
            match &n.kind {
                NodeKind::Data(d) => d.plaintext.to_vec(),
                NodeKind::Mht(m) => m.to_bytes().to_vec(),
            }
        };
        let mut ciphertext = vec![0u8; NODE_SIZE];
        let mac = self
            .crypto
            .aead_encrypt(&key, &ZERO_NONCE, &[], &plaintext, &mut ciphertext)
            .map_err(|_| FsError::CryptoError)?;

        self.disk
            .write_block(physical_number, &ciphertext)
            .map_err(|_| FsError::WriteToDiskFailed)?;

        let parent = node.borrow().parent.clone().and_then(|w| w.upgrade());
        match parent {
            Some(parent) => {
                if is_data {
                    let data_index = nav::data_index_from_physical(physical_number);
                    parent.borrow_mut().as_mht_mut().data_entries[data_index] =
                        crate::node::MhtEntry { key, gmac: mac };
                } else {
                    let order = nav::order_from_physical(physical_number);
                    let (_, slot) =
                        nav::mht_parent(order).expect("non-root mht always has a parent slot");
                    parent.borrow_mut().as_mht_mut().mht_entries[slot] =
                        crate::node::MhtEntry { key, gmac: mac };
                }
                parent.borrow_mut().dirty = true;
            }
            None => {
                // Root MHT: its key/mac are bound into the metadata block
                // rather than a parent's entry array.
                self.metadata.encrypted.mht_key = key;
                self.metadata.encrypted.mht_gmac = mac;
            }
        }

        let mut n = node.borrow_mut();
        n.dirty = false;
        n.new_node = false;
        Ok(())
    }
}
