//! Public handle and the single-threaded core it guards.

mod close;
mod flush;
mod node_fetch;
mod open;
mod read;
mod write;

use std::sync::Mutex;

use crate::cache::NodeCache;
use crate::crypto::{AeadKey, CryptoProvider};
use crate::error::{FileStatus, FsError, FsResult};
use crate::host::{BlockDevice, RecoveryLog};
use crate::kdf::SessionMasterKey;
use crate::metadata::Metadata;
use crate::node::NodeRef;

pub use open::{CreateOptions, OpenOptions};

/// Caller-facing handle. Every public method locks the single `Mutex`
/// around the core, which is single-threaded and not reentrant on one
/// context; the lock exists to turn an accidental concurrent call into a
/// clean error instead of silent corruption, not to make the core suitable
/// for contention.
pub struct ProtectedFile {
    inner: Mutex<FileInner>,
}

pub(crate) struct FileInner {
    pub(crate) disk: Box<dyn BlockDevice>,
    pub(crate) recovery_log: Box<dyn RecoveryLog>,
    pub(crate) crypto: Box<dyn CryptoProvider>,
    pub(crate) kdk: AeadKey,
    pub(crate) metadata: Metadata,
    pub(crate) root: NodeRef,
    pub(crate) cache: NodeCache,
    pub(crate) session: SessionMasterKey,
    pub(crate) offset: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// Set whenever the encrypted metadata part (inline data, size, path,
    /// or the root MHT key/mac binding) changes independent of whether any
    /// tree node does, so a pure inline-region write still gets committed
    /// at flush without spuriously touching the root MHT block (the inline
    /// fast path never allocates one).
    pub(crate) metadata_dirty: bool,
    pub(crate) status: FileStatus,
    pub(crate) last_error: Option<FsError>,
}

impl ProtectedFile {
    pub fn open(opts: OpenOptions) -> FsResult<Self> {
        Ok(Self {
            inner: Mutex::new(FileInner::open(opts)?),
        })
    }

    pub fn create(opts: CreateOptions) -> FsResult<Self> {
        Ok(Self {
            inner: Mutex::new(FileInner::create(opts)?),
        })
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut FileInner) -> FsResult<T>) -> FsResult<T> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.check_status()?;
        f(&mut guard).map_err(|e| {
            guard.last_error = Some(e);
            guard.status = e.into();
            e
        })
    }

    /// Fills `buf` completely from the current offset. Fails with
    /// `UnexpectedEof` rather than returning a short count if fewer bytes
    /// remain before the logical end of the file than `buf` holds.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.with_inner(|f| {
            let n = f.read(buf)?;
            crate::ensure!(n == buf.len(), FsError::UnexpectedEof);
            Ok(n)
        })
    }

    /// Seeks to `offset`, then reads exactly as [`ProtectedFile::read`] does.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.with_inner(|f| {
            f.offset = offset;
            let n = f.read(buf)?;
            crate::ensure!(n == buf.len(), FsError::UnexpectedEof);
            Ok(n)
        })
    }

    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        self.with_inner(|f| f.write(buf))
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.with_inner(|f| {
            f.offset = offset;
            f.write(buf)
        })
    }

    pub fn seek(&self, offset: u64) -> FsResult<u64> {
        self.with_inner(|f| {
            f.offset = offset;
            Ok(f.offset)
        })
    }

    pub fn tell(&self) -> FsResult<u64> {
        self.with_inner(|f| Ok(f.offset))
    }

    pub fn file_size(&self) -> FsResult<u64> {
        self.with_inner(|f| Ok(f.metadata.encrypted.size))
    }

    pub fn set_size(&self, new_size: u64) -> FsResult {
        self.with_inner(|f| f.set_size(new_size))
    }

    pub fn flush(&self) -> FsResult {
        self.with_inner(|f| f.flush())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult {
        self.with_inner(|f| f.rename(old_path, new_path))
    }

    pub fn clear_cache(&self) -> FsResult {
        self.with_inner(|f| f.clear_cache())
    }

    /// Reclaims a handle whose last error was `FlushError` or
    /// `WriteToDiskFailed` back to `Ok`. Any other status (a crypto failure,
    /// a corrupted in-memory handle) is terminal and this is a silent
    /// no-op, matching the upstream `clearerr`-style recoverability split.
    pub fn clear_error(&self) -> FsResult {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(e) = guard.last_error {
            if e.is_reclaimable() {
                guard.status = FileStatus::Ok;
                guard.last_error = None;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> FileStatus {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.status
    }

    pub fn last_error(&self) -> Option<FsError> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.last_error
    }

    pub fn close(self) -> FsResult {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.close()
    }
}

impl FileInner {
    pub(crate) fn check_status(&self) -> FsResult {
        if self.status.is_ok() {
            Ok(())
        } else {
            Err(self.last_error.unwrap_or(FsError::Unexpected))
        }
    }

    pub(crate) fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult {
        crate::ensure!(
            self.metadata.encrypted.path_matches(old_path),
            FsError::NameMismatch
        );
        self.metadata.encrypted.set_path(new_path)?;
        self.metadata_dirty = true;
        Ok(())
    }

    pub(crate) fn clear_cache(&mut self) -> FsResult {
        self.flush()?;
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OpensslCrypto;
    use crate::host::mem_env::{SharedMemBlockDevice, SharedMemRecoveryLog};
    use crate::metadata::MD_USER_DATA_SIZE;
    use crate::node::{ATTACHED_DATA_NODES_COUNT, NODE_SIZE};

    fn create_file(
        disk: SharedMemBlockDevice,
        log: SharedMemRecoveryLog,
        path: &str,
    ) -> ProtectedFile {
        ProtectedFile::create(CreateOptions::new(
            Box::new(disk),
            Box::new(log),
            Box::new(OpensslCrypto),
            AeadKey([7u8; 16]),
            path,
        ))
        .unwrap()
    }

    fn open_file(
        disk: SharedMemBlockDevice,
        log: SharedMemRecoveryLog,
        path: &str,
    ) -> FsResult<ProtectedFile> {
        ProtectedFile::open(OpenOptions::new(
            Box::new(disk),
            Box::new(log),
            Box::new(OpensslCrypto),
            AeadKey([7u8; 16]),
            path,
        ))
    }

    /// S-INLINE: a write that fits entirely inside the metadata block's
    /// inline region never allocates a data or MHT node; the file stays a
    /// single block on disk across a close/reopen cycle.
    #[test]
    fn s_inline_round_trip_single_block() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        pf.write_at(&[0x41u8; 128], 0).unwrap();
        pf.close().unwrap();
        assert_eq!(disk.read_raw(0).len(), NODE_SIZE);
        assert_eq!(disk.block_count(), 1);

        let pf = open_file(disk, log, "demo.pf").unwrap();
        let mut buf = [0u8; 128];
        assert_eq!(pf.read_at(&mut buf, 0).unwrap(), 128);
        assert_eq!(buf, [0x41u8; 128]);
    }

    /// S-ONE-NODE: a write just past the inline region allocates exactly
    /// one data node under the root MHT: meta + root + 1 data = 3 blocks.
    #[test]
    fn s_one_node_round_trip() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        let len = MD_USER_DATA_SIZE + 10;
        let data = vec![0x5Au8; len];
        pf.write_at(&data, 0).unwrap();
        pf.close().unwrap();
        assert_eq!(disk.block_count(), 3);

        let pf = open_file(disk, log, "demo.pf").unwrap();
        let mut buf = vec![0u8; len];
        assert_eq!(pf.read_at(&mut buf, 0).unwrap(), len);
        assert_eq!(buf, data);
    }

    /// S-CROSS-MHT: growing past the root's 96 attached data nodes forces
    /// allocation of the first non-root MHT node; full read after reopen
    /// still matches.
    #[test]
    fn s_cross_mht_round_trip() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        let len = (ATTACHED_DATA_NODES_COUNT + 1) * NODE_SIZE;
        let mut data = vec![0u8; len];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        pf.write_at(&data, MD_USER_DATA_SIZE as u64).unwrap();
        pf.close().unwrap();

        let pf = open_file(disk, log, "demo.pf").unwrap();
        let mut buf = vec![0u8; len];
        assert_eq!(
            pf.read_at(&mut buf, MD_USER_DATA_SIZE as u64).unwrap(),
            len
        );
        assert_eq!(buf, data);
    }

    /// Flipping a byte in an on-disk data block is detected as
    /// MAC_MISMATCH on the next read that touches it, and latches the
    /// handle into Corrupted.
    #[test]
    fn s_bitflip_detected_as_mac_mismatch() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        let len = MD_USER_DATA_SIZE + 10;
        pf.write_at(&vec![0x5Au8; len], 0).unwrap();
        pf.close().unwrap();

        let mut block = disk.read_raw(2);
        block[0] ^= 0xFF;
        disk.write_raw(2, &block);

        let pf = open_file(disk, log, "demo.pf").unwrap();
        let mut buf = vec![0u8; len];
        let err = pf.read_at(&mut buf, 0).unwrap_err();
        assert_eq!(err, FsError::MacMismatch);
        assert_eq!(pf.status(), FileStatus::Corrupted);
    }

    /// Opening with a different path than the one recorded at create time
    /// is rejected.
    #[test]
    fn path_binding_rejects_mismatch() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        pf.close().unwrap();

        let err = open_file(disk, log, "other.pf").unwrap_err();
        assert_eq!(err, FsError::NameMismatch);
    }

    /// `set_size` past the current length zero-fills the gap, observable
    /// on the next read, without eagerly materializing any node.
    #[test]
    fn s_grow_zero_fills() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        let target = 3 * NODE_SIZE as u64 + MD_USER_DATA_SIZE as u64;
        pf.set_size(target).unwrap();
        let mut buf = [0xFFu8; NODE_SIZE];
        assert_eq!(
            pf.read_at(&mut buf, MD_USER_DATA_SIZE as u64).unwrap(),
            NODE_SIZE
        );
        assert_eq!(buf, [0u8; NODE_SIZE]);
        assert_eq!(pf.file_size().unwrap(), target);
    }

    /// `set_size` below the current length is refused and does not
    /// mutate state.
    #[test]
    fn shrink_is_rejected() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk, log, "demo.pf");
        pf.write_at(&[1, 2, 3, 4], 0).unwrap();
        let before = pf.file_size().unwrap();
        assert!(pf.set_size(1).is_err());
        assert_eq!(pf.file_size().unwrap(), before);
    }

    /// A recovery log left behind mid-flush (simulating a crash after the
    /// log was written and the update flag set, but before the log was
    /// deleted) is replayed on the next open, restoring the pre-crash
    /// block contents rather than surfacing corruption.
    #[test]
    fn s_crash_replays_stale_recovery_log() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        let len = MD_USER_DATA_SIZE + 10;
        pf.write_at(&vec![0x11u8; len], 0).unwrap();
        pf.close().unwrap();

        let committed_block0 = disk.read_raw(0);

        // Simulate a crash mid-flush: corrupt block 0 in place (as a
        // half-applied S2/S5 write would) and plant a recovery log whose
        // sole record restores the last-committed image.
        let mut garbage = committed_block0.clone();
        garbage[10] ^= 0xFF;
        disk.write_raw(0, &garbage);
        log.plant(vec![crate::host::RecoveryRecord {
            physical_number: 0,
            preimage: committed_block0.clone(),
        }]);

        let pf = open_file(disk.clone(), log, "demo.pf").unwrap();
        assert_eq!(disk.read_raw(0), committed_block0);
        let mut buf = vec![0u8; len];
        assert_eq!(pf.read_at(&mut buf, 0).unwrap(), len);
        assert_eq!(buf, vec![0x11u8; len]);
        assert_eq!(pf.status(), FileStatus::Ok);
    }

    /// `enable_recovery(false)` refuses to replay a log left behind by a
    /// previous crash, surfacing `RecoveryImpossible` instead.
    #[test]
    fn recovery_disabled_surfaces_recovery_impossible() {
        let disk = SharedMemBlockDevice::new();
        let log = SharedMemRecoveryLog::new();
        let pf = create_file(disk.clone(), log.clone(), "demo.pf");
        pf.close().unwrap();
        log.plant(vec![crate::host::RecoveryRecord {
            physical_number: 0,
            preimage: disk.read_raw(0),
        }]);

        let err = ProtectedFile::open(
            OpenOptions::new(
                Box::new(disk),
                Box::new(log),
                Box::new(OpensslCrypto),
                AeadKey([7u8; 16]),
                "demo.pf",
            )
            .enable_recovery(false),
        )
        .unwrap_err();
        assert_eq!(err, FsError::RecoveryImpossible);
    }
}
