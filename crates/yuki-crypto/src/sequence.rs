//! Role-sequenced nonces and the receive window.
//!
//! Both directions of a session share one key, so the two senders must never
//! produce the same nonce. Each role owns one parity class and steps by two:
//!
//! | Role | Start | Sealed values |
//! |------|-------|---------------|
//! | Initiator | 0 | 2, 4, 6, ... |
//! | Responder | 1 | 3, 5, 7, ... |
//!
//! A receiver tracks the last value it accepted from the peer, starting from
//! the peer's start value, and admits a nonce only if it has the peer's parity,
//! lies strictly ahead, and is at most [`REPLAY_WINDOW`] steps ahead.

use crate::{CryptoError, REPLAY_WINDOW};

/// Distance between consecutive nonces of one sender.
pub const SEQUENCE_STEP: u128 = 2;

/// Which end of the tunnel a cipher belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The side that dialed the connection (client)
    Initiator,
    /// The side that accepted the connection (server)
    Responder,
}

impl Role {
    /// Starting counter value for this role's send sequence.
    #[must_use]
    pub const fn start(self) -> u128 {
        match self {
            Self::Initiator => 0,
            Self::Responder => 1,
        }
    }

    /// The opposite role.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Strictly increasing send counter for one role.
#[derive(Debug, Clone)]
pub struct SendSequence {
    current: u128,
}

impl SendSequence {
    /// Create a sequence positioned at the role's start value.
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            current: role.start(),
        }
    }

    /// Advance by one step and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] instead of wrapping.
    pub fn advance(&mut self) -> Result<u128, CryptoError> {
        let next = self
            .current
            .checked_add(SEQUENCE_STEP)
            .ok_or(CryptoError::NonceExhausted)?;
        self.current = next;
        Ok(next)
    }

    /// Last value handed out (the start value before the first advance).
    #[must_use]
    pub const fn current(&self) -> u128 {
        self.current
    }
}

/// Receive-side acceptance window for the peer's sequence.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    last: u128,
}

impl ReplayWindow {
    /// Create a window expecting the sequence sealed by `peer`.
    #[must_use]
    pub const fn for_peer(peer: Role) -> Self {
        Self { last: peer.start() }
    }

    /// Validate a candidate without changing state.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ReplayOrOutOfOrder`] when the value has the wrong
    /// parity, is at or behind the last accepted value, or is too far ahead.
    pub fn check(&self, value: u128) -> Result<(), CryptoError> {
        let rejected = CryptoError::ReplayOrOutOfOrder { last: self.last };

        if value % SEQUENCE_STEP != self.last % SEQUENCE_STEP || value <= self.last {
            return Err(rejected);
        }
        if (value - self.last) / SEQUENCE_STEP > REPLAY_WINDOW {
            return Err(rejected);
        }
        Ok(())
    }

    /// Record a value as accepted. Call only after the envelope authenticated.
    pub fn commit(&mut self, value: u128) {
        debug_assert!(value > self.last);
        self.last = value;
    }

    /// Last accepted value (the peer's start value before any envelope).
    #[must_use]
    pub const fn last_accepted(&self) -> u128 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_sequences_disjoint() {
        let mut initiator = SendSequence::new(Role::Initiator);
        let mut responder = SendSequence::new(Role::Responder);

        let a: Vec<u128> = (0..5).map(|_| initiator.advance().unwrap()).collect();
        let b: Vec<u128> = (0..5).map(|_| responder.advance().unwrap()).collect();

        assert_eq!(a, vec![2, 4, 6, 8, 10]);
        assert_eq!(b, vec![3, 5, 7, 9, 11]);
    }

    #[test]
    fn test_sequence_exhaustion_is_error() {
        let mut seq = SendSequence {
            current: u128::MAX - 1,
        };
        assert_eq!(seq.advance(), Err(CryptoError::NonceExhausted));
        assert_eq!(seq.current(), u128::MAX - 1);
    }

    #[test]
    fn test_window_accepts_next() {
        let window = ReplayWindow::for_peer(Role::Initiator);
        assert!(window.check(2).is_ok());
    }

    #[test]
    fn test_window_rejects_start_value() {
        let window = ReplayWindow::for_peer(Role::Responder);
        assert!(window.check(1).is_err());
        assert!(window.check(3).is_ok());
    }

    #[test]
    fn test_window_rejects_wrong_parity() {
        let window = ReplayWindow::for_peer(Role::Initiator);
        assert!(window.check(3).is_err());
    }

    #[test]
    fn test_window_bounds() {
        let mut window = ReplayWindow::for_peer(Role::Initiator);
        window.commit(20);

        assert!(window.check(20 + 2 * REPLAY_WINDOW).is_ok());
        assert!(window.check(22 + 2 * REPLAY_WINDOW).is_err());
        assert!(window.check(20).is_err());
        assert!(window.check(18).is_err());
    }

    #[test]
    fn test_window_allows_gaps() {
        let mut window = ReplayWindow::for_peer(Role::Responder);
        window.check(7).unwrap();
        window.commit(7);
        assert_eq!(window.last_accepted(), 7);
        assert!(window.check(5).is_err());
        assert!(window.check(9).is_ok());
    }

    #[test]
    fn test_rejection_reports_last() {
        let window = ReplayWindow::for_peer(Role::Initiator);
        assert_eq!(
            window.check(0),
            Err(CryptoError::ReplayOrOutOfOrder { last: 0 })
        );
    }
}
