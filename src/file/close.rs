//! Close: a best-effort final flush, then release everything.
//! Secret material (the KDK, the session master key, cached plaintext) is
//! zeroized by each type's own `Drop` impl as the fields go out of scope —
//! nothing extra to do here beyond clearing the cache and dropping `self`.

use crate::error::{FileStatus, FsResult};

use super::FileInner;

impl FileInner {
    pub(crate) fn close(&mut self) -> FsResult {
        // A corrupted handle or a prior crypto failure has nothing safe left
        // to flush; anything else gets one last attempt to persist pending
        // writes before the handle goes away.
        let should_flush = matches!(
            self.status,
            FileStatus::Ok | FileStatus::FlushError | FileStatus::WriteToDiskFailed
        );
        let result = if should_flush { self.flush() } else { Ok(()) };

        self.cache.clear();
        self.status = FileStatus::Closed;
        if let Err(e) = result {
            self.last_error = Some(e);
        }
        result
    }
}
