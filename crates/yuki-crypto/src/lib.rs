//! # Yuki Crypto
//!
//! Cryptographic layer for the Yuki tunnel.
//!
//! This crate provides:
//! - `XChaCha20-Poly1305` AEAD with zeroizing session keys
//! - Role-sequenced nonces (initiator even, responder odd) that never collide
//!   under one key
//! - A bounded forward replay window on the receiving side
//! - Length-prefixed transport envelopes produced by [`Sealer`] and consumed
//!   by [`Opener`]
//! - Secure random number generation
//!
//! ## Envelope Layout
//!
//! | Field | Size | Notes |
//! |-------|------|-------|
//! | LEN | 4 (big-endian) | Covers nonce + ciphertext + tag, never encrypted |
//! | Nonce | 24 | Big-endian sequence value |
//! | Ciphertext | variable | Same length as plaintext |
//! | Tag | 16 | Poly1305 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod cipher;
pub mod constant_time;
pub mod error;
pub mod random;
pub mod sequence;

pub use aead::{AeadKey, Nonce, Tag};
pub use cipher::{Opener, Sealer, SessionCipher};
pub use error::CryptoError;
pub use sequence::{ReplayWindow, Role, SendSequence};

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Size of the plaintext length prefix carried by every envelope
pub const LEN_PREFIX_SIZE: usize = 4;

/// Bytes added to a plaintext when it is sealed into an envelope
pub const ENVELOPE_OVERHEAD: usize = LEN_PREFIX_SIZE + XCHACHA_NONCE_SIZE + TAG_SIZE;

/// Maximum forward gap, in steps of the peer's sequence, accepted by the
/// receive window
pub const REPLAY_WINDOW: u128 = 10;
