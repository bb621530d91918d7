//! Session state machine and traffic accounting.
//!
//! A [`Session`] is shared between the engine's session table and the two
//! relay loops. Counters are atomics with a single writer each (the outbound
//! loop owns the `up` counters, the inbound loop the `down` counters), the
//! lifecycle state sits behind a short-lived lock, and a `watch` channel
//! carries the shutdown request to the relay task.

use crate::error::{Result, TunnelError};
use crate::identity::unix_time;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use yuki_crypto::Role;

/// Session lifecycle
///
/// ```text
/// Authenticating -> Handshaking -> Relaying -> Closing -> Closed
///        \______________\______________/
///                failure: -> Closing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the client hello
    Authenticating,
    /// Credentials accepted, key being delivered
    Handshaking,
    /// Relay loops running
    Relaying,
    /// Tearing down
    Closing,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Authenticating, Self::Handshaking)
                | (Self::Handshaking, Self::Relaying)
                | (
                    Self::Authenticating | Self::Handshaking | Self::Relaying,
                    Self::Closing
                )
                | (Self::Closing, Self::Closed)
        )
    }

    /// Closing or closed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Base session id for a client authenticated at `unix_secs`.
#[must_use]
pub fn session_id_base(client_id: &str, unix_secs: u64) -> String {
    format!("{client_id}-{unix_secs}")
}

/// One authenticated peer's tunnel session.
#[derive(Debug)]
pub struct Session {
    id: String,
    client_id: String,
    role: Role,
    max_bandwidth: u64,
    established_at: u64,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    packets_up: AtomicU64,
    packets_down: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// New session in [`SessionState::Authenticating`].
    ///
    /// `max_bandwidth` bounds the bytes this side may send (0 = unlimited).
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        role: Role,
        max_bandwidth: u64,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            role,
            max_bandwidth,
            established_at: unix_time(),
            state: Mutex::new(SessionState::Authenticating),
            last_activity: Mutex::new(Instant::now()),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            packets_up: AtomicU64::new(0),
            packets_down: AtomicU64::new(0),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authenticated client id
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Role of this side
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Bandwidth allowance in bytes (0 = unlimited)
    #[must_use]
    pub fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth
    }

    /// Unix time the session was created
    #[must_use]
    pub fn established_at(&self) -> u64 {
        self.established_at
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidState`] for an illegal transition.
    pub fn transition_to(&self, to: SessionState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition(to) {
            return Err(TunnelError::InvalidState { from, to });
        }
        *state = to;
        drop(state);

        tracing::debug!(session = %self.id, "state transition: {:?} -> {:?}", from, to);
        Ok(())
    }

    /// Enter [`SessionState::Closing`] unless already closing or closed.
    ///
    /// Returns `true` for the call that started the teardown.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        let from = *state;
        *state = SessionState::Closing;
        drop(state);

        tracing::debug!(session = %self.id, "state transition: {:?} -> Closing", from);
        true
    }

    /// Record keepalive activity from the peer.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last keepalive activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Check that sending `packet_len` more bytes stays within the allowance.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::BandwidthExceeded`]; nothing is counted.
    pub fn check_bandwidth(&self, packet_len: usize) -> Result<()> {
        if self.max_bandwidth == 0 {
            return Ok(());
        }
        let used = self.bytes_up();
        let packet = packet_len as u64;
        if used.saturating_add(packet) > self.max_bandwidth {
            return Err(TunnelError::BandwidthExceeded {
                limit: self.max_bandwidth,
                used,
                packet,
            });
        }
        Ok(())
    }

    /// Count one packet sent to the peer.
    pub fn record_up(&self, bytes: usize) {
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_up.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet received from the peer.
    pub fn record_down(&self, bytes: usize) {
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_down.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes sent to the peer
    #[must_use]
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes received from the peer
    #[must_use]
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Packets sent to the peer
    #[must_use]
    pub fn packets_up(&self) -> u64 {
        self.packets_up.load(Ordering::Relaxed)
    }

    /// Packets received from the peer
    #[must_use]
    pub fn packets_down(&self) -> u64 {
        self.packets_down.load(Ordering::Relaxed)
    }

    /// Ask the relay task to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that observes [`Session::request_shutdown`].
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Point-in-time copy of the session's observable state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            state: self.state(),
            established_at: self.established_at,
            idle_secs: self.idle_for().as_secs(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            packets_up: self.packets_up(),
            packets_down: self.packets_down(),
        }
    }
}

/// Serializable view of a session for an admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: String,
    /// Client id
    pub client_id: String,
    /// Lifecycle state
    pub state: SessionState,
    /// Unix time the session was created
    pub established_at: u64,
    /// Seconds since the last keepalive activity
    pub idle_secs: u64,
    /// Bytes sent to the peer
    pub bytes_up: u64,
    /// Bytes received from the peer
    pub bytes_down: u64,
    /// Packets sent to the peer
    pub packets_up: u64,
    /// Packets received from the peer
    pub packets_down: u64,
}

/// Wait until `rx` observes a shutdown request or its sender is dropped.
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await.map(|_| ());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_bandwidth: u64) -> Session {
        Session::new("alice-1700000000", "alice", Role::Responder, max_bandwidth)
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Authenticating.can_transition(Handshaking));
        assert!(Handshaking.can_transition(Relaying));
        assert!(Relaying.can_transition(Closing));
        assert!(Authenticating.can_transition(Closing));
        assert!(Closing.can_transition(Closed));

        assert!(!Authenticating.can_transition(Relaying));
        assert!(!Relaying.can_transition(Handshaking));
        assert!(!Closed.can_transition(Closing));
        assert!(!Closing.can_transition(Closing));
        assert!(!Closed.can_transition(Relaying));
    }

    #[test]
    fn test_transition_to() {
        let s = session(0);
        assert_eq!(s.state(), SessionState::Authenticating);
        s.transition_to(SessionState::Handshaking).unwrap();
        s.transition_to(SessionState::Relaying).unwrap();

        let err = s.transition_to(SessionState::Handshaking).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::InvalidState {
                from: SessionState::Relaying,
                to: SessionState::Handshaking
            }
        ));
        assert_eq!(s.state(), SessionState::Relaying);
    }

    #[test]
    fn test_begin_close_once() {
        let s = session(0);
        s.transition_to(SessionState::Handshaking).unwrap();
        assert!(s.begin_close());
        assert!(!s.begin_close());
        s.transition_to(SessionState::Closed).unwrap();
        assert!(!s.begin_close());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_bandwidth_limit() {
        let s = session(1000);
        s.record_up(999);
        let err = s.check_bandwidth(10).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::BandwidthExceeded {
                limit: 1000,
                used: 999,
                packet: 10
            }
        ));
        assert_eq!(s.bytes_up(), 999);
        assert_eq!(s.packets_up(), 1);

        s.check_bandwidth(1).unwrap();
    }

    #[test]
    fn test_unlimited_bandwidth() {
        let s = session(0);
        s.record_up(usize::MAX / 2);
        s.check_bandwidth(usize::MAX / 2).unwrap();
    }

    #[test]
    fn test_counters_and_snapshot() {
        let s = session(0);
        s.record_up(60);
        s.record_down(40);
        s.record_down(2);

        let snap = s.snapshot();
        assert_eq!(snap.id, "alice-1700000000");
        assert_eq!(snap.client_id, "alice");
        assert_eq!(snap.bytes_up, 60);
        assert_eq!(snap.bytes_down, 42);
        assert_eq!(snap.packets_up, 1);
        assert_eq!(snap.packets_down, 2);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "authenticating");
    }

    #[test]
    fn test_session_id_base() {
        assert_eq!(session_id_base("alice", 1_700_000_000), "alice-1700000000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock() {
        let s = session(0);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(s.idle_for() >= Duration::from_secs(20));
        s.touch();
        assert!(s.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let s = session(0);
        let mut rx = s.subscribe_shutdown();
        assert!(!s.shutdown_requested());
        s.request_shutdown();
        wait_shutdown(&mut rx).await;
        assert!(s.shutdown_requested());
    }
}
