//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD open failed (tag did not verify)
    #[error("authentication failed: tag mismatch")]
    AuthenticationFailed,

    /// Envelope shorter than its header or its declared length
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Nonce outside the receive window (replayed, stale, wrong parity or too far ahead)
    #[error("nonce rejected: replay or out-of-order (last accepted {last})")]
    ReplayOrOutOfOrder {
        /// Last accepted sequence value
        last: u128,
    },

    /// Send sequence cannot advance without reusing a nonce
    #[error("nonce space exhausted for this session key")]
    NonceExhausted,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl CryptoError {
    /// True for failures that concern a single envelope and leave the
    /// session's sequence state intact.
    #[must_use]
    pub fn is_packet_local(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::IncompleteFrame { .. }
                | Self::ReplayOrOutOfOrder { .. }
        )
    }
}
