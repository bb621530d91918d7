//! `XChaCha20-Poly1305` AEAD primitives.
//!
//! Provides the key, nonce and tag types used by the session cipher:
//! - 256-bit keys, zeroized on drop
//! - 192-bit nonces carrying a big-endian sequence value
//! - 128-bit authentication tags
//! - In-place encryption/decryption with detached tags
//!
//! Nonces are never random here. Every nonce is derived from a role-owned
//! sequence (see [`crate::sequence`]), so uniqueness under a key is a property
//! of the sequence rather than of chance.

use crate::CryptoError;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{AeadInPlace, KeyInit},
};
use rand_core::{CryptoRng, RngCore};
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Leading nonce bytes that must be zero for the nonce to carry a sequence.
const SEQUENCE_OFFSET: usize = NONCE_SIZE - 16;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Encode a sequence value as a 24-byte big-endian counter.
    #[must_use]
    pub fn from_sequence(value: u128) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[SEQUENCE_OFFSET..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Decode the sequence value carried by this nonce.
    ///
    /// Returns `None` when the high bytes are set, which no sealer ever
    /// produces.
    #[must_use]
    pub fn sequence(&self) -> Option<u128> {
        if self.0[..SEQUENCE_OFFSET].iter().any(|&b| b != 0) {
            return None;
        }
        let mut low = [0u8; 16];
        low.copy_from_slice(&self.0[SEQUENCE_OFFSET..]);
        Some(u128::from_be_bytes(low))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// Authentication tag (16 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// Create a tag from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; TAG_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop. `Debug` never prints key material.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Exposes the raw key material. Only the handshake should need this.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Encrypt in-place, returning the authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        aad: &[u8],
    ) -> Result<Tag, CryptoError> {
        let tag = self
            .cipher()
            .encrypt_in_place_detached(nonce.as_generic(), aad, buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok(Tag(tag_bytes))
    }

    /// Decrypt in-place, verifying the authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthenticationFailed` if the tag does not verify.
    pub fn decrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        tag: &Tag,
        aad: &[u8],
    ) -> Result<(), CryptoError> {
        self.cipher()
            .decrypt_in_place_detached(
                nonce.as_generic(),
                aad,
                buffer,
                chacha20poly1305::Tag::from_slice(&tag.0),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AeadKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_nonce_sequence_roundtrip() {
        for value in [0u128, 1, 2, 255, 256, u64::MAX as u128 + 7, u128::MAX] {
            let nonce = Nonce::from_sequence(value);
            assert_eq!(nonce.sequence(), Some(value));
        }
    }

    #[test]
    fn test_nonce_is_big_endian() {
        let nonce = Nonce::from_sequence(0x0102);
        let bytes = nonce.as_bytes();
        assert_eq!(bytes[22], 0x01);
        assert_eq!(bytes[23], 0x02);
        assert!(bytes[..22].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_nonce_high_bytes_rejected() {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[0] = 1;
        assert_eq!(Nonce::from_bytes(bytes).sequence(), None);
    }

    #[test]
    fn test_nonce_from_slice_length() {
        assert!(Nonce::from_slice(&[0u8; 24]).is_some());
        assert!(Nonce::from_slice(&[0u8; 23]).is_none());
        assert!(Nonce::from_slice(&[0u8; 25]).is_none());
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(AeadKey::from_slice(&[7u8; 32]).is_ok());
        assert_eq!(
            AeadKey::from_slice(&[7u8; 31]).unwrap_err(),
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = AeadKey::new([0xAB; 32]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_in_place_roundtrip() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::from_sequence(2);
        let mut buffer = b"raw ip packet".to_vec();

        let tag = key.encrypt_in_place(&nonce, &mut buffer, b"").unwrap();
        assert_ne!(&buffer[..], b"raw ip packet");

        key.decrypt_in_place(&nonce, &mut buffer, &tag, b"").unwrap();
        assert_eq!(&buffer[..], b"raw ip packet");
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let mut buffer = b"payload".to_vec();
        let tag = key
            .encrypt_in_place(&Nonce::from_sequence(2), &mut buffer, b"")
            .unwrap();

        let result = key.decrypt_in_place(&Nonce::from_sequence(4), &mut buffer, &tag, b"");
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::from_sequence(3);
        let mut buffer = b"payload".to_vec();
        let tag = key.encrypt_in_place(&nonce, &mut buffer, b"").unwrap();

        let mut bad = *tag.as_bytes();
        bad[0] ^= 0x01;
        let result = key.decrypt_in_place(&nonce, &mut buffer, &Tag::from_bytes(bad), b"");
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }
}
