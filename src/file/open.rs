//! Open/create entry points: run recovery first, then either load and
//! decrypt the existing metadata block and root MHT, or lay down a fresh
//! empty tree and persist it with one initial flush.

use crate::crypto::{AeadKey, CryptoProvider};
use crate::error::{FsError, FsResult};
use crate::host::{BlockDevice, RecoveryLog};
use crate::kdf::SessionMasterKey;
use crate::metadata::Metadata;
use crate::node::{Node, NodeKind, NODE_SIZE, ROOT_MHT_PHYSICAL_NUMBER};

use super::FileInner;

/// Matches the cache capacity the upstream SGX implementation defaults to:
/// 48 node-sized pages held write-back before a flush is forced.
pub const DEFAULT_CACHE_CAPACITY: usize = 48;

pub struct OpenOptions {
    pub disk: Box<dyn BlockDevice>,
    pub recovery_log: Box<dyn RecoveryLog>,
    pub crypto: Box<dyn CryptoProvider>,
    pub kdk: AeadKey,
    pub path: String,
    pub writable: bool,
    pub append: bool,
    pub cache_capacity: usize,
    pub enable_recovery: bool,
}

impl OpenOptions {
    pub fn new(
        disk: Box<dyn BlockDevice>,
        recovery_log: Box<dyn RecoveryLog>,
        crypto: Box<dyn CryptoProvider>,
        kdk: AeadKey,
        path: impl Into<String>,
    ) -> Self {
        Self {
            disk,
            recovery_log,
            crypto,
            kdk,
            path: path.into(),
            writable: true,
            append: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            enable_recovery: true,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    /// When `false`, a side log left behind by a crashed flush is left
    /// untouched and `open` fails with `RecoveryImpossible` instead of
    /// replaying it: a caller that turned recovery off does not get it
    /// silently turned back on by a leftover log.
    pub fn enable_recovery(mut self, enable_recovery: bool) -> Self {
        self.enable_recovery = enable_recovery;
        self
    }
}

pub struct CreateOptions {
    pub disk: Box<dyn BlockDevice>,
    pub recovery_log: Box<dyn RecoveryLog>,
    pub crypto: Box<dyn CryptoProvider>,
    pub kdk: AeadKey,
    pub path: String,
    pub cache_capacity: usize,
    pub enable_recovery: bool,
}

impl CreateOptions {
    pub fn new(
        disk: Box<dyn BlockDevice>,
        recovery_log: Box<dyn RecoveryLog>,
        crypto: Box<dyn CryptoProvider>,
        kdk: AeadKey,
        path: impl Into<String>,
    ) -> Self {
        Self {
            disk,
            recovery_log,
            crypto,
            kdk,
            path: path.into(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            enable_recovery: true,
        }
    }

    pub fn cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn enable_recovery(mut self, enable_recovery: bool) -> Self {
        self.enable_recovery = enable_recovery;
        self
    }
}

impl FileInner {
    pub(crate) fn open(mut opts: OpenOptions) -> FsResult<Self> {
        if opts.recovery_log.exists()? {
            crate::ensure!(opts.enable_recovery, FsError::RecoveryImpossible);
        }
        crate::recovery::recover(opts.disk.as_mut(), opts.recovery_log.as_mut())?;

        let (plain, ciphertext) = Metadata::read_from_disk(opts.disk.as_mut())?;
        crate::ensure!(plain.magic == crate::metadata::MAGIC, FsError::NotProtectedFile);
        crate::ensure!(
            plain.major_version == crate::metadata::MAJOR_VERSION,
            FsError::UnsupportedVersion
        );
        crate::ensure!(plain.update_flag == 0, FsError::RecoveryNeeded);

        let mut metadata = Metadata {
            plain,
            encrypted: crate::metadata::EncryptedPart::new(&opts.path)?,
        };
        metadata.decrypt(opts.crypto.as_ref(), &opts.kdk, &ciphertext)?;
        crate::ensure!(
            metadata.encrypted.path_matches(&opts.path),
            FsError::NameMismatch
        );

        // A file whose plaintext never outgrew the inline region never got
        // a root MHT block written: `block_count()` here is ground truth
        // for whether physical block 1 exists at all.
        let root = if opts.disk.block_count() > ROOT_MHT_PHYSICAL_NUMBER {
            let mut block = [0u8; NODE_SIZE];
            opts.disk.read_block(ROOT_MHT_PHYSICAL_NUMBER, &mut block)?;
            let mut plaintext = vec![0u8; NODE_SIZE];
            opts.crypto.aead_decrypt(
                &metadata.encrypted.mht_key,
                &crate::crypto::ZERO_NONCE,
                &[],
                &block,
                &metadata.encrypted.mht_gmac,
                &mut plaintext,
            )?;
            let mht = crate::node::MhtNode::from_bytes(plaintext.as_slice().try_into().unwrap());
            std::rc::Rc::new(std::cell::RefCell::new(Node {
                physical_number: ROOT_MHT_PHYSICAL_NUMBER,
                kind: NodeKind::Mht(mht),
                parent: None,
                dirty: false,
                new_node: false,
            }))
        } else {
            Node::new_root()
        };

        let offset = if opts.append && opts.writable {
            metadata.encrypted.size
        } else {
            0
        };

        Ok(Self {
            session: SessionMasterKey::new(opts.crypto.as_ref())?,
            disk: opts.disk,
            recovery_log: opts.recovery_log,
            crypto: opts.crypto,
            kdk: opts.kdk,
            metadata,
            root,
            cache: crate::cache::NodeCache::new(opts.cache_capacity),
            offset,
            readable: true,
            writable: opts.writable,
            metadata_dirty: false,
            status: crate::error::FileStatus::Ok,
            last_error: None,
        })
    }

    pub(crate) fn create(mut opts: CreateOptions) -> FsResult<Self> {
        if opts.recovery_log.exists()? {
            crate::ensure!(opts.enable_recovery, FsError::RecoveryImpossible);
        }
        crate::recovery::recover(opts.disk.as_mut(), opts.recovery_log.as_mut())?;

        let key_id = crate::kdf::random_key(opts.crypto.as_ref())?;
        let metadata = Metadata::new(&opts.path, key_id)?;

        let mut inner = Self {
            session: SessionMasterKey::new(opts.crypto.as_ref())?,
            disk: opts.disk,
            recovery_log: opts.recovery_log,
            crypto: opts.crypto,
            kdk: opts.kdk,
            metadata,
            root: Node::new_root(),
            cache: crate::cache::NodeCache::new(opts.cache_capacity),
            offset: 0,
            readable: true,
            writable: true,
            metadata_dirty: true,
            status: crate::error::FileStatus::Ok,
            last_error: None,
        };
        // Persist the empty metadata block immediately so a freshly
        // created file can be reopened even if nothing is ever written to
        // it. The root MHT stays clean (nothing has grown the tree yet),
        // so this flush writes exactly one block: a file that never
        // outgrows MD_USER_DATA_SIZE stays a single block on disk.
        inner.flush()?;
        Ok(inner)
    }
}
