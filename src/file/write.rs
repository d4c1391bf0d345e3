use crate::error::{FsError, FsResult};
use crate::metadata::MD_USER_DATA_SIZE;
use crate::nav;
use crate::node::NODE_SIZE;

use super::FileInner;

impl FileInner {
    pub(crate) fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        crate::ensure!(self.writable, FsError::NotSupported);
        if buf.is_empty() {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let offset = self.offset;
            if (offset as usize) < MD_USER_DATA_SIZE {
                let n = (MD_USER_DATA_SIZE - offset as usize).min(buf.len() - done);
                self.metadata.encrypted.inline_data[offset as usize..offset as usize + n]
                    .copy_from_slice(&buf[done..done + n]);
                self.metadata_dirty = true;
                done += n;
                self.offset += n as u64;
                continue;
            }

            let (data_node_number, in_node_offset) = nav::data_node_for_offset(offset);
            let n = (NODE_SIZE - in_node_offset).min(buf.len() - done);
            let node = self
                .fetch_data(data_node_number, true)?
                .expect("create_if_missing always yields a node");
            {
                let mut node = node.borrow_mut();
                node.as_data_mut().plaintext[in_node_offset..in_node_offset + n]
                    .copy_from_slice(&buf[done..done + n]);
                node.dirty = true;
            }
            Self::mark_ancestors_dirty(&node);
            done += n;
            self.offset += n as u64;
        }

        if self.offset > self.metadata.encrypted.size {
            self.metadata.encrypted.size = self.offset;
            self.metadata_dirty = true;
        }
        Ok(done)
    }

    /// Grows or (never shrinks, per non-goal) leaves the logical length.
    /// Growing never materializes the skipped range; reads of the gap
    /// return zero until actually written, matching [`FileInner::read`]'s
    /// sparse-hole handling.
    pub(crate) fn set_size(&mut self, new_size: u64) -> FsResult {
        crate::ensure!(self.writable, FsError::NotSupported);
        crate::ensure!(
            new_size >= self.metadata.encrypted.size,
            FsError::NotImplemented
        );
        if new_size != self.metadata.encrypted.size {
            self.metadata.encrypted.size = new_size;
            self.metadata_dirty = true;
        }
        Ok(())
    }

    /// Propagates Invariant A (a dirty node's whole ancestor chain up to
    /// the root is dirty) from a just-modified leaf. Stops at the first
    /// already-dirty ancestor: everything above it was marked on some
    /// earlier write in this same dirty generation.
    pub(crate) fn mark_ancestors_dirty(node: &crate::node::NodeRef) {
        let mut current = node.borrow().parent.clone();
        while let Some(weak) = current {
            let Some(parent) = weak.upgrade() else { break };
            let mut p = parent.borrow_mut();
            if p.dirty {
                break;
            }
            p.dirty = true;
            current = p.parent.clone();
        }
    }
}
