use crate::error::{FsError, FsResult};
use crate::metadata::MD_USER_DATA_SIZE;
use crate::nav;
use crate::node::NODE_SIZE;

use super::FileInner;

impl FileInner {
    /// Copies up to `buf.len()` bytes starting at the current offset,
    /// truncated to whatever remains before the logical end of the file,
    /// and returns the number of bytes actually copied. Callers that need
    /// an exact, fails-short read (the public `ProtectedFile::read`) check
    /// the returned count against `buf.len()` themselves.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        crate::ensure!(self.readable, FsError::NotSupported);

        let size = self.metadata.encrypted.size;
        if self.offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min((size - self.offset) as usize);
        let mut done = 0usize;
        while done < want {
            let offset = self.offset;
            if (offset as usize) < MD_USER_DATA_SIZE {
                let n = (MD_USER_DATA_SIZE - offset as usize).min(want - done);
                buf[done..done + n]
                    .copy_from_slice(&self.metadata.encrypted.inline_data[offset as usize..offset as usize + n]);
                done += n;
                self.offset += n as u64;
                continue;
            }

            let (data_node_number, in_node_offset) = nav::data_node_for_offset(offset);
            let n = (NODE_SIZE - in_node_offset).min(want - done);
            match self.fetch_data(data_node_number, false)? {
                Some(node) => {
                    let node = node.borrow();
                    let plain = &node.as_data().plaintext;
                    buf[done..done + n].copy_from_slice(&plain[in_node_offset..in_node_offset + n]);
                }
                None => {
                    // sparse hole: never written, reads as zero.
                    buf[done..done + n].fill(0);
                }
            }
            done += n;
            self.offset += n as u64;
        }
        Ok(done)
    }
}
