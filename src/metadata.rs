//! Codec for block 0: the plain header (magic, version, update flag, key id)
//! and the AEAD-protected section (logical size, bound path, MHT root key,
//! and the inline user-data region).

use subtle::ConstantTimeEq;

use crate::crypto::{AeadKey, AeadMac, CryptoProvider, AEAD_MAC_SIZE, ZERO_NONCE};
use crate::error::{FsError, FsResult};
use crate::host::BlockDevice;
use crate::kdf::derive_metadata_key;
use crate::node::{NODE_SIZE, METADATA_PHYSICAL_NUMBER};

pub const MAGIC: u64 = 0x5046_5f46_494c_4530; // "PF_FILE0"
pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

pub const PATH_MAX_LEN: usize = 260;
pub const MD_USER_DATA_SIZE: usize = 3072;

const PLAIN_HEADER_LEN: usize = 8 + 1 + 1 + 1 + 16 + AEAD_MAC_SIZE; // 43
const ENCRYPTED_PART_LEN: usize = 8 + PATH_MAX_LEN + 4 + 16 + 16 + MD_USER_DATA_SIZE; // 3376
const CIPHERTEXT_OFFSET: usize = 64;

static_assertions::const_assert!(PLAIN_HEADER_LEN <= CIPHERTEXT_OFFSET);
static_assertions::const_assert!(CIPHERTEXT_OFFSET + ENCRYPTED_PART_LEN <= NODE_SIZE);

/// The part of block 0 that is never encrypted: enough to identify the
/// file, detect an in-progress/crashed flush, and re-derive the metadata
/// key from the caller's KDK.
#[derive(Clone)]
pub struct PlainHeader {
    pub magic: u64,
    pub major_version: u8,
    pub minor_version: u8,
    pub update_flag: u8,
    pub meta_data_key_id: [u8; 16],
    pub meta_data_gmac: AeadMac,
}

impl PlainHeader {
    fn to_bytes(&self) -> [u8; PLAIN_HEADER_LEN] {
        let mut buf = [0u8; PLAIN_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8] = self.major_version;
        buf[9] = self.minor_version;
        buf[10] = self.update_flag;
        buf[11..27].copy_from_slice(&self.meta_data_key_id);
        buf[27..43].copy_from_slice(self.meta_data_gmac.as_ref());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut meta_data_key_id = [0u8; 16];
        meta_data_key_id.copy_from_slice(&buf[11..27]);
        let mut gmac = [0u8; AEAD_MAC_SIZE];
        gmac.copy_from_slice(&buf[27..43]);
        Self {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            major_version: buf[8],
            minor_version: buf[9],
            update_flag: buf[10],
            meta_data_key_id,
            meta_data_gmac: AeadMac(gmac),
        }
    }

    /// The AAD binding ciphertext to plain header: everything but the mac
    /// field itself.
    fn aad(&self) -> [u8; PLAIN_HEADER_LEN - AEAD_MAC_SIZE] {
        let mut out = [0u8; PLAIN_HEADER_LEN - AEAD_MAC_SIZE];
        out.copy_from_slice(&self.to_bytes()[0..PLAIN_HEADER_LEN - AEAD_MAC_SIZE]);
        out
    }
}

/// The part of block 0 protected by AEAD.
pub struct EncryptedPart {
    pub size: u64,
    path: [u8; PATH_MAX_LEN],
    path_len: u32,
    pub mht_key: AeadKey,
    pub mht_gmac: AeadMac,
    pub inline_data: Box<[u8; MD_USER_DATA_SIZE]>,
}

impl EncryptedPart {
    pub fn new(path: &str) -> FsResult<Self> {
        let bytes = path.as_bytes();
        crate::ensure!(!bytes.is_empty() && bytes.len() < PATH_MAX_LEN, FsError::NameTooLong);
        let mut buf = [0u8; PATH_MAX_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            size: 0,
            path: buf,
            path_len: bytes.len() as u32,
            mht_key: AeadKey::default(),
            mht_gmac: AeadMac::default(),
            inline_data: Box::new([0u8; MD_USER_DATA_SIZE]),
        })
    }

    pub fn path(&self) -> &str {
        std::str::from_utf8(&self.path[..self.path_len as usize]).unwrap_or("")
    }

    pub fn set_path(&mut self, path: &str) -> FsResult {
        let bytes = path.as_bytes();
        crate::ensure!(!bytes.is_empty() && bytes.len() < PATH_MAX_LEN, FsError::NameTooLong);
        self.path = [0u8; PATH_MAX_LEN];
        self.path[..bytes.len()].copy_from_slice(bytes);
        self.path_len = bytes.len() as u32;
        Ok(())
    }

    /// Constant-time check that `candidate` is the path this file was
    /// bound to, defending against a substitution attack that swaps in a
    /// differently-named file's blocks.
    pub fn path_matches(&self, candidate: &str) -> bool {
        let bytes = candidate.as_bytes();
        if bytes.len() as u32 != self.path_len {
            return false;
        }
        self.path[..bytes.len()].ct_eq(bytes).into()
    }

    fn to_bytes(&self) -> Box<[u8; ENCRYPTED_PART_LEN]> {
        let mut buf = Box::new([0u8; ENCRYPTED_PART_LEN]);
        let mut off = 0;
        buf[off..off + 8].copy_from_slice(&self.size.to_le_bytes());
        off += 8;
        buf[off..off + PATH_MAX_LEN].copy_from_slice(&self.path);
        off += PATH_MAX_LEN;
        buf[off..off + 4].copy_from_slice(&self.path_len.to_le_bytes());
        off += 4;
        buf[off..off + 16].copy_from_slice(self.mht_key.as_ref());
        off += 16;
        buf[off..off + 16].copy_from_slice(self.mht_gmac.as_ref());
        off += 16;
        buf[off..off + MD_USER_DATA_SIZE].copy_from_slice(&*self.inline_data);
        off += MD_USER_DATA_SIZE;
        debug_assert_eq!(off, ENCRYPTED_PART_LEN);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut off = 0;
        let size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let mut path = [0u8; PATH_MAX_LEN];
        path.copy_from_slice(&buf[off..off + PATH_MAX_LEN]);
        off += PATH_MAX_LEN;
        let path_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut mht_key = [0u8; 16];
        mht_key.copy_from_slice(&buf[off..off + 16]);
        off += 16;
        let mut mht_gmac = [0u8; AEAD_MAC_SIZE];
        mht_gmac.copy_from_slice(&buf[off..off + 16]);
        off += 16;
        let mut inline_data = Box::new([0u8; MD_USER_DATA_SIZE]);
        inline_data.copy_from_slice(&buf[off..off + MD_USER_DATA_SIZE]);
        Self {
            size,
            path,
            path_len,
            mht_key: AeadKey(mht_key),
            mht_gmac: AeadMac(mht_gmac),
            inline_data,
        }
    }
}

impl Drop for EncryptedPart {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.inline_data.zeroize();
    }
}

pub struct Metadata {
    pub plain: PlainHeader,
    pub encrypted: EncryptedPart,
}

impl Metadata {
    pub fn new(path: &str, meta_data_key_id: [u8; 16]) -> FsResult<Self> {
        Ok(Self {
            plain: PlainHeader {
                magic: MAGIC,
                major_version: MAJOR_VERSION,
                minor_version: MINOR_VERSION,
                update_flag: 0,
                meta_data_key_id,
                meta_data_gmac: AeadMac::default(),
            },
            encrypted: EncryptedPart::new(path)?,
        })
    }

    pub fn set_update_flag(&mut self, set: bool) {
        self.plain.update_flag = if set { 1 } else { 0 };
    }

    pub fn update_flag(&self) -> bool {
        self.plain.update_flag != 0
    }

    /// Derives the metadata key from `kdk` and this instance's stored key
    /// id, decrypts the AEAD section in place, and writes the result back
    /// into `self.encrypted`.
    pub fn decrypt(
        &mut self,
        crypto: &dyn CryptoProvider,
        kdk: &AeadKey,
        ciphertext: &[u8; ENCRYPTED_PART_LEN],
    ) -> FsResult {
        let key = derive_metadata_key(crypto, kdk, &self.plain.meta_data_key_id)?;
        let mut plaintext = vec![0u8; ENCRYPTED_PART_LEN];
        crypto.aead_decrypt(
            &key,
            &ZERO_NONCE,
            &self.plain.aad(),
            ciphertext,
            &self.plain.meta_data_gmac,
            &mut plaintext,
        )?;
        self.encrypted = EncryptedPart::from_bytes(&plaintext);
        Ok(())
    }

    /// Encrypts the AEAD section under a metadata key freshly derived from
    /// `kdk`, rotating `meta_data_key_id` to a new random nonce first (so a
    /// re-flushed metadata block never reuses a (key, nonce) pair).
    pub fn encrypt(
        &mut self,
        crypto: &dyn CryptoProvider,
        kdk: &AeadKey,
    ) -> FsResult<Box<[u8; ENCRYPTED_PART_LEN]>> {
        crypto.random(&mut self.plain.meta_data_key_id)?;
        let key = derive_metadata_key(crypto, kdk, &self.plain.meta_data_key_id)?;
        let plaintext = self.encrypted.to_bytes();
        let mut ciphertext = Box::new([0u8; ENCRYPTED_PART_LEN]);
        let mac = crypto.aead_encrypt(
            &key,
            &ZERO_NONCE,
            &self.plain.aad(),
            &*plaintext,
            &mut *ciphertext,
        )?;
        self.plain.meta_data_gmac = mac;
        Ok(ciphertext)
    }

    pub fn write_to_disk(&self, disk: &mut dyn BlockDevice, ciphertext: &[u8]) -> FsResult {
        let mut block = [0u8; NODE_SIZE];
        block[0..PLAIN_HEADER_LEN].copy_from_slice(&self.plain.to_bytes());
        block[CIPHERTEXT_OFFSET..CIPHERTEXT_OFFSET + ENCRYPTED_PART_LEN]
            .copy_from_slice(ciphertext);
        disk.write_block(METADATA_PHYSICAL_NUMBER, &block)
    }

    /// Reads block 0 and returns the plain header plus the still-encrypted
    /// section; callers must call [`Metadata::decrypt`] before trusting
    /// anything in `encrypted`.
    pub fn read_from_disk(
        disk: &mut dyn BlockDevice,
    ) -> FsResult<(PlainHeader, [u8; ENCRYPTED_PART_LEN])> {
        let mut block = [0u8; NODE_SIZE];
        disk.read_block(METADATA_PHYSICAL_NUMBER, &mut block)?;
        let plain = PlainHeader::from_bytes(&block[0..PLAIN_HEADER_LEN]);
        let mut ciphertext = [0u8; ENCRYPTED_PART_LEN];
        ciphertext.copy_from_slice(
            &block[CIPHERTEXT_OFFSET..CIPHERTEXT_OFFSET + ENCRYPTED_PART_LEN],
        );
        Ok((plain, ciphertext))
    }
}

pub const ENCRYPTED_PART_SIZE: usize = ENCRYPTED_PART_LEN;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OpensslCrypto;
    use crate::host::mem_env::MemBlockDevice;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = OpensslCrypto;
        let kdk = AeadKey([5u8; 16]);
        let mut meta = Metadata::new("demo.pf", [0u8; 16]).unwrap();
        meta.encrypted.size = 42;
        let ciphertext = meta.encrypt(&c, &kdk).unwrap();

        let mut reopened = Metadata {
            plain: meta.plain.clone(),
            encrypted: EncryptedPart::new("demo.pf").unwrap(),
        };
        reopened.decrypt(&c, &kdk, &ciphertext).unwrap();
        assert_eq!(reopened.encrypted.size, 42);
        assert!(reopened.encrypted.path_matches("demo.pf"));
        assert!(!reopened.encrypted.path_matches("other.pf"));
    }

    #[test]
    fn wrong_kdk_fails() {
        let c = OpensslCrypto;
        let kdk = AeadKey([5u8; 16]);
        let mut meta = Metadata::new("demo.pf", [0u8; 16]).unwrap();
        let ciphertext = meta.encrypt(&c, &kdk).unwrap();

        let wrong_kdk = AeadKey([6u8; 16]);
        let mut reopened = Metadata {
            plain: meta.plain.clone(),
            encrypted: EncryptedPart::new("demo.pf").unwrap(),
        };
        assert!(reopened.decrypt(&c, &wrong_kdk, &ciphertext).is_err());
    }

    #[test]
    fn disk_roundtrip() {
        let c = OpensslCrypto;
        let kdk = AeadKey([1u8; 16]);
        let mut disk = MemBlockDevice::new();
        let mut meta = Metadata::new("demo.pf", [0u8; 16]).unwrap();
        let ciphertext = meta.encrypt(&c, &kdk).unwrap();
        meta.write_to_disk(&mut disk, &*ciphertext).unwrap();

        let (plain, ciphertext2) = Metadata::read_from_disk(&mut disk).unwrap();
        assert_eq!(plain.magic, MAGIC);
        let mut reopened = Metadata {
            plain,
            encrypted: EncryptedPart::new("demo.pf").unwrap(),
        };
        reopened.decrypt(&c, &kdk, &ciphertext2).unwrap();
        assert!(reopened.encrypted.path_matches("demo.pf"));
    }
}
