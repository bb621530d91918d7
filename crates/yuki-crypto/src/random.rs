//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::CryptoError;
use crate::aead::AeadKey;
use rand_core::{OsRng, RngCore};

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|_| CryptoError::RandomFailed)
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a fresh session key.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn generate_session_key() -> Result<AeadKey, CryptoError> {
    random_32().map(AeadKey::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_32_differs() {
        let a = random_32().unwrap();
        let b = random_32().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_keys_are_fresh() {
        let a = generate_session_key().unwrap();
        let b = generate_session_key().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_fill_random_empty() {
        let mut buf = [];
        assert!(fill_random(&mut buf).is_ok());
    }
}
