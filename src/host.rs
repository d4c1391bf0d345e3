//! Host I/O abstraction. The node graph and flush engine only ever see
//! `&mut dyn BlockDevice` / `&mut dyn RecoveryLog`; everything OS-specific
//! (file descriptors, advisory locks, retry loops) lives behind these two
//! traits.

use crate::error::{FsError, FsResult};
use crate::node::NODE_SIZE;

/// Random-access, block-sized storage for the fixed-layout container file.
/// Implementations must treat `read`/`write` as exact, whole-block transfers.
pub trait BlockDevice {
    fn read_block(&mut self, number: u64, buf: &mut [u8]) -> FsResult;
    fn write_block(&mut self, number: u64, buf: &[u8]) -> FsResult;
    fn flush(&mut self) -> FsResult;
    /// Highest block number ever written, plus one. Zero for a brand-new file.
    fn block_count(&self) -> u64;
}

/// One record appended to the side recovery log: the physical block number
/// together with the pre-image ciphertext the flush engine is about to
/// overwrite in the main container.
#[derive(Clone)]
pub struct RecoveryRecord {
    pub physical_number: u64,
    pub preimage: Vec<u8>,
}

/// The append-only side log used to make the six-stage flush crash
/// consistent, plus the replay path a fresh open uses to recover from one
/// left behind by a crash between [`RecoveryLog::append`] and
/// [`RecoveryLog::delete`].
pub trait RecoveryLog {
    /// True if a recovery log exists (from a previous, interrupted flush).
    fn exists(&self) -> FsResult<bool>;
    /// Create (truncating any previous contents) and open the log for append.
    fn create(&mut self) -> FsResult;
    fn append(&mut self, record: &RecoveryRecord) -> FsResult;
    /// Marks everything appended so far as durably committed.
    fn commit(&mut self) -> FsResult;
    fn close(&mut self) -> FsResult;
    /// Replays every committed record, in log order, returning them so the
    /// caller can apply them to the main container. Records after the last
    /// commit marker (if any) are discarded as an aborted, not-yet-durable
    /// append.
    fn replay(&self) -> FsResult<Vec<RecoveryRecord>>;
    fn delete(&mut self) -> FsResult;
}

/// One block plus its side recovery log, bundled the way a caller supplies
/// them to `ProtectedFile::open`/`create`.
pub struct HostEnvironment<B: BlockDevice, L: RecoveryLog> {
    pub disk: B,
    pub recovery: L,
}

impl<B: BlockDevice, L: RecoveryLog> HostEnvironment<B, L> {
    pub fn new(disk: B, recovery: L) -> Self {
        Self { disk, recovery }
    }
}

/// A plain file on the host filesystem, opened and advisory-locked the way
/// a long running process holds its working files: exclusive for a
/// writer, shared for a reader, non-blocking so a second writer fails
/// fast instead of wedging.
#[cfg(unix)]
pub mod std_env {
    use super::*;
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};

    pub struct StdBlockFile {
        file: std::fs::File,
        size_blocks: u64,
    }

    impl StdBlockFile {
        pub fn open(path: &Path, readonly: bool) -> FsResult<Self> {
            let mut opts = OpenOptions::new();
            opts.read(true);
            if !readonly {
                opts.write(true).create(true);
            }
            let file = opts
                .mode(0o600)
                .custom_flags(libc::O_LARGEFILE)
                .open(path)
                .map_err(os_err)?;

            let op = (if readonly { libc::LOCK_SH } else { libc::LOCK_EX }) | libc::LOCK_NB;
            let fd = file.as_raw_fd();
            if unsafe { libc::flock(fd, op) } < 0 {
                return Err(os_err(std::io::Error::last_os_error()));
            }

            let len = file.metadata().map_err(os_err)?.len();
            Ok(Self {
                file,
                size_blocks: len / NODE_SIZE as u64,
            })
        }
    }

    impl Drop for StdBlockFile {
        fn drop(&mut self) {
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }

    impl BlockDevice for StdBlockFile {
        fn read_block(&mut self, number: u64, buf: &mut [u8]) -> FsResult {
            crate::ensure!(buf.len() == NODE_SIZE, FsError::NotBlockAligned);
            use std::io::Read;
            self.file
                .seek(SeekFrom::Start(number * NODE_SIZE as u64))
                .map_err(os_err)?;
            self.file.read_exact(buf).map_err(os_err)
        }

        fn write_block(&mut self, number: u64, buf: &[u8]) -> FsResult {
            crate::ensure!(buf.len() == NODE_SIZE, FsError::NotBlockAligned);
            use std::io::Write;
            self.file
                .seek(SeekFrom::Start(number * NODE_SIZE as u64))
                .map_err(os_err)?;
            self.file.write_all(buf).map_err(os_err)?;
            self.size_blocks = self.size_blocks.max(number + 1);
            Ok(())
        }

        fn flush(&mut self) -> FsResult {
            self.file.sync_data().map_err(os_err)
        }

        fn block_count(&self) -> u64 {
            self.size_blocks
        }
    }

    /// Side log for the flush engine: each record is `u64 physical_number`
    /// followed by a full 4096-byte pre-image, with single commit-marker
    /// bytes demarcating what has actually reached disk (grounded in the
    /// journal-flag replay scheme: a record following the last commit byte
    /// is an aborted write and is not replayed).
    pub struct StdRecoveryLog {
        path: PathBuf,
        file: Option<std::fs::File>,
    }

    const FLAG_RECORD: u8 = 0;
    const FLAG_COMMIT: u8 = 1;
    const RECORD_LEN: usize = 8 + NODE_SIZE;

    impl StdRecoveryLog {
        pub fn new(path: PathBuf) -> Self {
            Self { path, file: None }
        }
    }

    impl RecoveryLog for StdRecoveryLog {
        fn exists(&self) -> FsResult<bool> {
            Ok(self.path.exists())
        }

        fn create(&mut self) -> FsResult {
            let cstr = CString::new(self.path.to_str().ok_or(FsError::InvalidParameter)?)
                .map_err(|_| FsError::InvalidParameter)?;
            let _ = cstr;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(os_err)?;
            self.file = Some(file);
            Ok(())
        }

        fn append(&mut self, record: &RecoveryRecord) -> FsResult {
            use std::io::Write;
            let file = self.file.as_mut().ok_or(FsError::CantWriteRecoveryFile)?;
            crate::ensure!(
                record.preimage.len() == NODE_SIZE,
                FsError::InvalidParameter
            );
            file.write_all(&[FLAG_RECORD]).map_err(os_err)?;
            file.write_all(&record.physical_number.to_le_bytes())
                .map_err(os_err)?;
            file.write_all(&record.preimage).map_err(os_err)
        }

        fn commit(&mut self) -> FsResult {
            use std::io::Write;
            let file = self.file.as_mut().ok_or(FsError::CantWriteRecoveryFile)?;
            file.write_all(&[FLAG_COMMIT]).map_err(os_err)?;
            file.sync_data().map_err(os_err)
        }

        fn close(&mut self) -> FsResult {
            self.file = None;
            Ok(())
        }

        fn replay(&self) -> FsResult<Vec<RecoveryRecord>> {
            let bytes = std::fs::read(&self.path).map_err(os_err)?;
            Ok(parse_log(&bytes))
        }

        fn delete(&mut self) -> FsResult {
            self.file = None;
            if self.path.exists() {
                std::fs::remove_file(&self.path).map_err(os_err)?;
            }
            Ok(())
        }
    }

    fn parse_log(bytes: &[u8]) -> Vec<RecoveryRecord> {
        let mut all = Vec::new();
        let mut last_committed = 0usize;
        let mut pos = 0usize;
        while pos < bytes.len() {
            match bytes[pos] {
                FLAG_RECORD if pos + 1 + RECORD_LEN <= bytes.len() => {
                    let number = u64::from_le_bytes(bytes[pos + 1..pos + 9].try_into().unwrap());
                    let preimage = bytes[pos + 9..pos + 1 + RECORD_LEN].to_vec();
                    all.push(RecoveryRecord {
                        physical_number: number,
                        preimage,
                    });
                    pos += 1 + RECORD_LEN;
                }
                FLAG_COMMIT => {
                    last_committed = all.len();
                    pos += 1;
                }
                _ => break,
            }
        }
        all.truncate(last_committed);
        all
    }

    fn os_err(e: std::io::Error) -> FsError {
        FsError::OsError(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// An entirely in-memory block device and recovery log, used by tests and
/// by anything embedding this container without a real filesystem.
pub mod mem_env {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemBlockDevice {
        blocks: HashMap<u64, Vec<u8>>,
        block_count: u64,
    }

    impl MemBlockDevice {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&mut self, number: u64, buf: &mut [u8]) -> FsResult {
            crate::ensure!(buf.len() == NODE_SIZE, FsError::NotBlockAligned);
            match self.blocks.get(&number) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn write_block(&mut self, number: u64, buf: &[u8]) -> FsResult {
            crate::ensure!(buf.len() == NODE_SIZE, FsError::NotBlockAligned);
            self.blocks.insert(number, buf.to_vec());
            self.block_count = self.block_count.max(number + 1);
            Ok(())
        }

        fn flush(&mut self) -> FsResult {
            Ok(())
        }

        fn block_count(&self) -> u64 {
            self.block_count
        }
    }

    #[derive(Default)]
    pub struct MemRecoveryLog {
        records: Vec<RecoveryRecord>,
        staged: Vec<RecoveryRecord>,
        exists: bool,
    }

    impl MemRecoveryLog {
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulates a crash: commits are kept, anything appended but never
        /// committed since is dropped, and future calls still see the log
        /// as existing until the next `delete`.
        pub fn crash_after_last_commit(&mut self) {
            self.staged.clear();
        }
    }

    impl RecoveryLog for MemRecoveryLog {
        fn exists(&self) -> FsResult<bool> {
            Ok(self.exists)
        }

        fn create(&mut self) -> FsResult {
            self.records.clear();
            self.staged.clear();
            self.exists = true;
            Ok(())
        }

        fn append(&mut self, record: &RecoveryRecord) -> FsResult {
            crate::ensure!(
                record.preimage.len() == NODE_SIZE,
                FsError::InvalidParameter
            );
            self.staged.push(record.clone());
            Ok(())
        }

        fn commit(&mut self) -> FsResult {
            self.records.append(&mut self.staged);
            Ok(())
        }

        fn close(&mut self) -> FsResult {
            Ok(())
        }

        fn replay(&self) -> FsResult<Vec<RecoveryRecord>> {
            Ok(self.records.clone())
        }

        fn delete(&mut self) -> FsResult {
            self.records.clear();
            self.staged.clear();
            self.exists = false;
            Ok(())
        }
    }

    /// A handle-clonable [`MemBlockDevice`]/[`MemRecoveryLog`] pair for
    /// tests that need to tamper with or inspect on-disk bytes out of band
    /// while a [`crate::ProtectedFile`] still owns the boxed trait object
    /// (bit-flip and crash-consistency scenarios; see `file::tests`).
    #[derive(Clone, Default)]
    pub struct SharedMemBlockDevice(std::rc::Rc<std::cell::RefCell<MemBlockDevice>>);

    impl SharedMemBlockDevice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn read_raw(&self, number: u64) -> Vec<u8> {
            let mut buf = vec![0u8; NODE_SIZE];
            self.0.borrow_mut().read_block(number, &mut buf).unwrap();
            buf
        }

        pub fn write_raw(&self, number: u64, data: &[u8]) {
            self.0.borrow_mut().write_block(number, data).unwrap();
        }
    }

    impl BlockDevice for SharedMemBlockDevice {
        fn read_block(&mut self, number: u64, buf: &mut [u8]) -> FsResult {
            self.0.borrow_mut().read_block(number, buf)
        }
        fn write_block(&mut self, number: u64, buf: &[u8]) -> FsResult {
            self.0.borrow_mut().write_block(number, buf)
        }
        fn flush(&mut self) -> FsResult {
            self.0.borrow_mut().flush()
        }
        fn block_count(&self) -> u64 {
            self.0.borrow().block_count()
        }
    }

    #[derive(Clone, Default)]
    pub struct SharedMemRecoveryLog(std::rc::Rc<std::cell::RefCell<MemRecoveryLog>>);

    impl SharedMemRecoveryLog {
        pub fn new() -> Self {
            Self::default()
        }

        /// Forces the log to appear present with exactly `records`
        /// already committed, as if a flush had reached S1/S2 and then
        /// crashed before S6 deleted it.
        pub fn plant(&self, records: Vec<RecoveryRecord>) {
            let mut inner = self.0.borrow_mut();
            inner.records = records;
            inner.staged.clear();
            inner.exists = true;
        }
    }

    impl RecoveryLog for SharedMemRecoveryLog {
        fn exists(&self) -> FsResult<bool> {
            self.0.borrow().exists()
        }
        fn create(&mut self) -> FsResult {
            self.0.borrow_mut().create()
        }
        fn append(&mut self, record: &RecoveryRecord) -> FsResult {
            self.0.borrow_mut().append(record)
        }
        fn commit(&mut self) -> FsResult {
            self.0.borrow_mut().commit()
        }
        fn close(&mut self) -> FsResult {
            self.0.borrow_mut().close()
        }
        fn replay(&self) -> FsResult<Vec<RecoveryRecord>> {
            self.0.borrow().replay()
        }
        fn delete(&mut self) -> FsResult {
            self.0.borrow_mut().delete()
        }
    }
}
