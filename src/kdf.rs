//! NIST SP 800-108-style single-block KDF, built on AEAD-as-PRF
//! ([`CryptoProvider::derive`]).

use crate::crypto::{AeadKey, CryptoProvider};
use crate::error::FsResult;

const LABEL_LEN: usize = 64;

const LABEL_MASTER_KEY: &[u8] = b"PROTECTED-FS-MASTER-KEY";
const LABEL_RANDOM_KEY: &[u8] = b"PROTECTED-FS-RANDOM-KEY";
const LABEL_METADATA_KEY: &[u8] = b"PROTECTED-FS-METADATA-KEY";

/// The fixed 96-byte structure fed to the AEAD as associated data; its
/// encoded bytes ARE the KDF's input block, per SP 800-108 counter mode
/// with a single 128-bit output block (`index` is always 1 here since we
/// never need more than one output block).
fn packed(label: &[u8], node_number: u64, nonce: &[u8; 16]) -> [u8; 96] {
    assert!(label.len() <= LABEL_LEN);
    let mut buf = [0u8; 96];
    buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // index
    buf[4..4 + label.len()].copy_from_slice(label);
    buf[68..76].copy_from_slice(&node_number.to_le_bytes());
    buf[76..92].copy_from_slice(nonce);
    buf[92..96].copy_from_slice(&0x80u32.to_le_bytes()); // output length in bits
    buf
}

fn derive_with_label(
    crypto: &dyn CryptoProvider,
    key: &AeadKey,
    label: &[u8],
    node_number: u64,
    nonce: &[u8; 16],
) -> FsResult<AeadKey> {
    let input = packed(label, node_number, nonce);
    crypto.derive(key, &input)
}

/// A fresh, randomly generated key used to seed both the session master
/// key and the metadata key's nonce.
pub fn random_key(crypto: &dyn CryptoProvider) -> FsResult<[u8; 16]> {
    let mut out = [0u8; 16];
    crypto.random(&mut out)?;
    Ok(out)
}

/// Derives the metadata block's key directly from the caller's KDK and the
/// nonce stored (in the clear) alongside the metadata block, so a file can
/// be reopened knowing only the KDK.
pub fn derive_metadata_key(
    crypto: &dyn CryptoProvider,
    kdk: &AeadKey,
    meta_data_key_id: &[u8; 16],
) -> FsResult<AeadKey> {
    derive_with_label(crypto, kdk, LABEL_METADATA_KEY, 0, meta_data_key_id)
}

/// Keys derived per node from the current session master key, rotated
/// automatically by [`SessionMasterKey`] every [`MAX_MASTER_KEY_USAGES`]
/// derivations.
pub const MAX_MASTER_KEY_USAGES: u32 = 65536;

pub struct SessionMasterKey {
    key: AeadKey,
    nonce: [u8; 16],
    usages: u32,
}

impl SessionMasterKey {
    /// Generates a fresh, randomized session master key, as happens once
    /// per open/create (never persisted, never derived from the KDK).
    pub fn new(crypto: &dyn CryptoProvider) -> FsResult<Self> {
        let mut seed = AeadKey::default();
        crypto.random(&mut seed.0)?;
        let mut nonce = [0u8; 16];
        crypto.random(&mut nonce)?;
        let key = derive_with_label(crypto, &seed, LABEL_RANDOM_KEY, 0, &nonce)?;
        Ok(Self {
            key,
            nonce,
            usages: 0,
        })
    }

    fn rotate(&mut self, crypto: &dyn CryptoProvider) -> FsResult {
        let mut seed = AeadKey::default();
        crypto.random(&mut seed.0)?;
        crypto.random(&mut self.nonce)?;
        self.key = derive_with_label(crypto, &seed, LABEL_RANDOM_KEY, 0, &self.nonce)?;
        self.usages = 0;
        Ok(())
    }

    /// Derives the per-node key for `physical_number`, transparently
    /// rotating the session master key first if it has hit its usage cap.
    pub fn derive_node_key(
        &mut self,
        crypto: &dyn CryptoProvider,
        physical_number: u64,
    ) -> FsResult<AeadKey> {
        if self.usages >= MAX_MASTER_KEY_USAGES {
            self.rotate(crypto)?;
        }
        self.usages += 1;
        derive_with_label(
            crypto,
            &self.key,
            LABEL_MASTER_KEY,
            physical_number,
            &self.nonce,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OpensslCrypto;

    #[test]
    fn distinct_nodes_get_distinct_keys() {
        let c = OpensslCrypto;
        let mut session = SessionMasterKey::new(&c).unwrap();
        let k1 = session.derive_node_key(&c, 1).unwrap();
        let k2 = session.derive_node_key(&c, 2).unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn rotates_after_usage_cap() {
        let c = OpensslCrypto;
        let mut session = SessionMasterKey::new(&c).unwrap();
        session.usages = MAX_MASTER_KEY_USAGES;
        let key_before = session.key.0;
        let _ = session.derive_node_key(&c, 1).unwrap();
        assert_ne!(session.key.0, key_before);
        assert_eq!(session.usages, 1);
    }

    #[test]
    fn metadata_key_is_kdk_bound() {
        let c = OpensslCrypto;
        let kdk = AeadKey([9u8; 16]);
        let nonce = [3u8; 16];
        let a = derive_metadata_key(&c, &kdk, &nonce).unwrap();
        let b = derive_metadata_key(&c, &kdk, &nonce).unwrap();
        assert_eq!(a.0, b.0);
        let other_kdk = AeadKey([8u8; 16]);
        let c2 = derive_metadata_key(&c, &other_kdk, &nonce).unwrap();
        assert_ne!(a.0, c2.0);
    }
}
