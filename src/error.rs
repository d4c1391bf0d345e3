use thiserror::Error;

pub type FsResult<T = ()> = core::result::Result<T, FsError>;

/// Failure modes surfaced by the container, mirroring the status codes a
/// caller needs to distinguish a retryable I/O hiccup from a terminal
/// integrity failure.
#[derive(Error, Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidParameter,
    #[error("name too long")]
    NameTooLong,
    #[error("file not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not supported in this mode")]
    NotSupported,
    #[error("shrinking an existing protected file is not implemented")]
    NotImplemented,
    #[error("read past the end of the file: fewer bytes available than requested")]
    UnexpectedEof,
    #[error("host I/O error (errno {0})")]
    OsError(i32),
    #[error("block is not node-size aligned")]
    NotBlockAligned,
    #[error("file is not a protected file (bad magic)")]
    NotProtectedFile,
    #[error("unsupported format version")]
    UnsupportedVersion,
    #[error("recovery is required before this file can be opened")]
    RecoveryNeeded,
    #[error("recovery cannot proceed: no recovery log is available or recovery was disabled on open")]
    RecoveryImpossible,
    #[error("recovery file could not be opened")]
    CantOpenRecoveryFile,
    #[error("recovery file could not be written")]
    CantWriteRecoveryFile,
    #[error("recovery replay failed")]
    RecoveryFailed,
    #[error("MAC verification failed, data is corrupted or tampered")]
    MacMismatch,
    #[error("the bound path does not match the name this file was opened with")]
    NameMismatch,
    #[error("the key id is all zero, cannot regenerate the metadata key")]
    NoKeyId,
    #[error("underlying cryptographic operation failed")]
    CryptoError,
    #[error("a previous flush failed and the file must be reopened")]
    FlushError,
    #[error("a previous write to disk failed and the file must be reopened")]
    WriteToDiskFailed,
    #[error("file handle state is corrupted beyond recovery")]
    MemoryCorrupted,
    #[error("operation attempted on a closed file")]
    Closed,
    #[error("internal invariant violated")]
    Unexpected,
}

impl FsError {
    /// Status classes that [`crate::file::FileInner::clear_error`] can reclaim from.
    /// `CryptoError` is deliberately excluded: a key-derivation or MAC failure
    /// never becomes valid by retrying.
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, FsError::FlushError | FsError::WriteToDiskFailed)
    }
}

/// Coarse-grained state of a [`crate::ProtectedFile`] handle, gating which
/// operations are still permitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileStatus {
    Ok,
    NotInitialized,
    FlushError,
    WriteToDiskFailed,
    CryptoError,
    Corrupted,
    MemoryCorrupted,
    Closed,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::NotInitialized
    }
}

impl FileStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FileStatus::Ok)
    }
}

impl From<FsError> for FileStatus {
    fn from(e: FsError) -> Self {
        match e {
            FsError::FlushError => FileStatus::FlushError,
            FsError::WriteToDiskFailed => FileStatus::WriteToDiskFailed,
            FsError::CryptoError => FileStatus::CryptoError,
            FsError::MemoryCorrupted | FsError::Unexpected => FileStatus::MemoryCorrupted,
            FsError::MacMismatch
            | FsError::NotProtectedFile
            | FsError::NameMismatch
            | FsError::RecoveryFailed
            | FsError::RecoveryImpossible => FileStatus::Corrupted,
            _ => FileStatus::Ok,
        }
    }
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}

#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err)
    };
}
