//! Error types for the Yuki tunnel engine.

use crate::session::SessionState;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Tunnel engine errors
///
/// Errors fall in two classes. Per-packet failures (see
/// [`TunnelError::is_packet_local`]) are logged and the packet dropped; every
/// other error ends the session.
#[derive(Debug, Error)]
pub enum TunnelError {
    // === Handshake ===
    /// Peer credentials were rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Handshake record was malformed or arrived out of order
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // === Per-packet ===
    /// Envelope could not be opened or sealed
    #[error("crypto error: {0}")]
    Crypto(#[from] yuki_crypto::CryptoError),

    /// Plaintext frame was malformed
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    // === I/O ===
    /// Virtual interface failure
    #[error("interface error: {0}")]
    Interface(#[from] yuki_tun::TunError),

    /// Outer channel failure
    #[error("channel error: {0}")]
    Channel(#[from] io::Error),

    /// Peer closed the outer channel
    #[error("peer closed the connection")]
    PeerClosed,

    // === Policy ===
    /// Nothing received from the peer within the idle deadline
    #[error("keepalive timeout: no activity for {0:?}")]
    KeepaliveTimeout(Duration),

    /// Forwarding the packet would exceed the client's bandwidth allowance
    #[error("bandwidth exceeded: {used} + {packet} bytes over limit of {limit}")]
    BandwidthExceeded {
        /// Configured limit in bytes
        limit: u64,
        /// Bytes already sent
        used: u64,
        /// Size of the rejected packet
        packet: u64,
    },

    // === Engine ===
    /// No session with that id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Illegal session state transition
    #[error("invalid session state transition: {from:?} -> {to:?}")]
    InvalidState {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Session task panicked or was aborted
    #[error("session task failed: {0}")]
    TaskFailed(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Client registry failure
    #[error("identity store error: {0}")]
    Identity(#[from] IdentityError),
}

impl TunnelError {
    /// True for errors that concern one packet and leave the session usable.
    #[must_use]
    pub fn is_packet_local(&self) -> bool {
        match self {
            Self::Crypto(e) => e.is_packet_local(),
            Self::Frame(_) => true,
            _ => false,
        }
    }
}

/// Plaintext frame errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the frame header
    #[error("frame too short: expected at least {expected}, got {actual}")]
    FrameTooShort {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Type byte is not Data, Ping or Pong
    #[error("unknown frame type: 0x{0:02X}")]
    UnknownFrameType(u8),

    /// Declared length disagrees with the bytes present
    #[error("frame length mismatch: header says {declared}, payload has {actual}")]
    FrameLengthMismatch {
        /// Length field value
        declared: usize,
        /// Bytes after the header
        actual: usize,
    },
}

/// Client registry errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No client with that id
    #[error("client not found: {0}")]
    NotFound(String),

    /// A client with that id already exists
    #[error("client already exists: {0}")]
    Duplicate(String),

    /// Registry file could not be read or written
    #[error("registry I/O error: {0}")]
    Io(#[from] io::Error),

    /// Registry file is not valid JSON
    #[error("registry format error: {0}")]
    Format(#[from] serde_json::Error),

    /// Random id or secret generation failed
    #[error("credential generation failed: {0}")]
    Random(#[from] yuki_crypto::CryptoError),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use yuki_crypto::CryptoError;

    #[test]
    fn test_packet_local_classification() {
        assert!(TunnelError::Crypto(CryptoError::AuthenticationFailed).is_packet_local());
        assert!(TunnelError::Crypto(CryptoError::ReplayOrOutOfOrder { last: 4 }).is_packet_local());
        assert!(TunnelError::Frame(FrameError::UnknownFrameType(9)).is_packet_local());

        assert!(!TunnelError::Crypto(CryptoError::NonceExhausted).is_packet_local());
        assert!(!TunnelError::PeerClosed.is_packet_local());
        assert!(!TunnelError::KeepaliveTimeout(Duration::from_secs(30)).is_packet_local());
        assert!(
            !TunnelError::BandwidthExceeded {
                limit: 1000,
                used: 999,
                packet: 10
            }
            .is_packet_local()
        );
        let broken = TunnelError::Channel(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!broken.is_packet_local());
    }

    #[test]
    fn test_display() {
        let err = TunnelError::BandwidthExceeded {
            limit: 1000,
            used: 999,
            packet: 10,
        };
        assert_eq!(
            err.to_string(),
            "bandwidth exceeded: 999 + 10 bytes over limit of 1000"
        );
        assert_eq!(
            FrameError::UnknownFrameType(0x7F).to_string(),
            "unknown frame type: 0x7F"
        );
    }
}
