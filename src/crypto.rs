//! AEAD and CSPRNG adapter. The container never speaks `openssl` directly
//! outside this module; everywhere else it holds a `&dyn CryptoProvider`.

use openssl::symm::{Cipher, Crypter, Mode};
use zeroize::Zeroize;

use crate::error::{FsError, FsResult};

pub const AEAD_KEY_SIZE: usize = 16;
pub const AEAD_MAC_SIZE: usize = 16;
pub const AEAD_NONCE_SIZE: usize = 12;

/// A 128-bit AES-GCM key. Zeroized on drop since instances of this type
/// frequently hold the caller's KDK, a session master key, or a key
/// derived from either.
#[derive(Clone, Copy, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct AeadKey(pub [u8; AEAD_KEY_SIZE]);

impl AeadKey {
    pub const fn zeroed() -> Self {
        AeadKey([0u8; AEAD_KEY_SIZE])
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for AeadKey {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AeadKey(..)")
    }
}

impl subtle::ConstantTimeEq for AeadKey {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub struct AeadMac(pub [u8; AEAD_MAC_SIZE]);

impl AsRef<[u8]> for AeadMac {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The node-physical-number-derived nonce used for every keyed operation in
/// this container is all-zero: every key that an AES-GCM invocation is
/// keyed with is used exactly once (it is itself freshly derived per node,
/// per session, or per KDF call), so nonce reuse under a fixed key never
/// occurs despite the fixed nonce.
pub const ZERO_NONCE: [u8; AEAD_NONCE_SIZE] = [0u8; AEAD_NONCE_SIZE];

/// Abstracts the AEAD primitive and the CSPRNG so the node graph, metadata
/// codec and KDF never call into a crypto library directly.
pub trait CryptoProvider {
    fn aead_encrypt(
        &self,
        key: &AeadKey,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> FsResult<AeadMac>;

    fn aead_decrypt(
        &self,
        key: &AeadKey,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
        mac: &AeadMac,
        plaintext: &mut [u8],
    ) -> FsResult<()>;

    fn random(&self, buf: &mut [u8]) -> FsResult<()>;

    /// AEAD-as-PRF: encrypts zero bytes of plaintext under `aad`, returning
    /// the resulting tag as a derived key. Used by the KDF only.
    fn derive(&self, key: &AeadKey, aad: &[u8]) -> FsResult<AeadKey> {
        let mut ignored = [0u8; 0];
        let mac = self.aead_encrypt(key, &ZERO_NONCE, aad, &[], &mut ignored)?;
        Ok(AeadKey(mac.0))
    }
}

/// Real AES-128-GCM via `openssl`, the same crate the host environment's
/// block layer was already built against.
#[derive(Default)]
pub struct OpensslCrypto;

impl CryptoProvider for OpensslCrypto {
    fn aead_encrypt(
        &self,
        key: &AeadKey,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> FsResult<AeadMac> {
        ensure_len(plaintext.len(), ciphertext.len())?;
        let cipher = Cipher::aes_128_gcm();
        let mut crypter =
            Crypter::new(cipher, Mode::Encrypt, key.as_ref(), Some(nonce)).map_err(to_crypto)?;
        crypter.aad_update(aad).map_err(to_crypto)?;
        let mut written = 0usize;
        if !plaintext.is_empty() {
            written += crypter
                .update(plaintext, ciphertext)
                .map_err(to_crypto)?;
        }
        written += crypter.finalize(&mut ciphertext[written..]).map_err(to_crypto)?;
        debug_assert_eq!(written, plaintext.len());
        let mut tag = [0u8; AEAD_MAC_SIZE];
        crypter.get_tag(&mut tag).map_err(to_crypto)?;
        Ok(AeadMac(tag))
    }

    fn aead_decrypt(
        &self,
        key: &AeadKey,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
        mac: &AeadMac,
        plaintext: &mut [u8],
    ) -> FsResult<()> {
        ensure_len(ciphertext.len(), plaintext.len())?;
        let cipher = Cipher::aes_128_gcm();
        let mut crypter =
            Crypter::new(cipher, Mode::Decrypt, key.as_ref(), Some(nonce)).map_err(to_crypto)?;
        crypter.aad_update(aad).map_err(to_crypto)?;
        let mut tag = mac.0;
        crypter.set_tag(&mut tag).map_err(to_crypto)?;
        let mut written = 0usize;
        if !ciphertext.is_empty() {
            written += crypter
                .update(ciphertext, plaintext)
                .map_err(to_crypto)?;
        }
        let verified = crypter.finalize(&mut plaintext[written..]);
        match verified {
            Ok(n) => {
                written += n;
                debug_assert_eq!(written, ciphertext.len());
                Ok(())
            }
            Err(_) => {
                plaintext.zeroize();
                Err(FsError::MacMismatch)
            }
        }
    }

    fn random(&self, buf: &mut [u8]) -> FsResult<()> {
        openssl::rand::rand_bytes(buf).map_err(to_crypto)
    }
}

fn ensure_len(a: usize, b: usize) -> FsResult {
    if a == b {
        Ok(())
    } else {
        Err(FsError::InvalidParameter)
    }
}

fn to_crypto<E>(_e: E) -> FsError {
    FsError::CryptoError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let c = OpensslCrypto;
        let key = AeadKey([7u8; AEAD_KEY_SIZE]);
        let pt = b"hello protected world";
        let mut ct = vec![0u8; pt.len()];
        let mac = c
            .aead_encrypt(&key, &ZERO_NONCE, b"aad", pt, &mut ct)
            .unwrap();
        let mut out = vec![0u8; pt.len()];
        c.aead_decrypt(&key, &ZERO_NONCE, b"aad", &ct, &mac, &mut out)
            .unwrap();
        assert_eq!(out, pt);
    }

    #[test]
    fn tamper_detected() {
        let c = OpensslCrypto;
        let key = AeadKey([7u8; AEAD_KEY_SIZE]);
        let pt = b"hello protected world";
        let mut ct = vec![0u8; pt.len()];
        let mac = c
            .aead_encrypt(&key, &ZERO_NONCE, b"aad", pt, &mut ct)
            .unwrap();
        ct[0] ^= 1;
        let mut out = vec![0u8; pt.len()];
        assert!(c
            .aead_decrypt(&key, &ZERO_NONCE, b"aad", &ct, &mac, &mut out)
            .is_err());
    }

    #[test]
    fn derive_is_deterministic() {
        let c = OpensslCrypto;
        let key = AeadKey([1u8; AEAD_KEY_SIZE]);
        let a = c.derive(&key, b"context-a").unwrap();
        let b = c.derive(&key, b"context-a").unwrap();
        let d = c.derive(&key, b"context-b").unwrap();
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, d.0);
    }
}
