//! Responder-side tunnel engine.
//!
//! [`TunnelEngine::start_session`] authenticates a peer on a fresh record
//! channel, delivers a session key, registers the session and spawns its
//! relay task. The task tears the session down whichever way it ends.

use crate::channel::{Channel, RecordSource};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::handshake::{ClientHello, PROTOCOL_VERSION, ServerReply};
use crate::identity::{IdentityStore, unix_time};
use crate::relay::{RelayContext, RelayTiming, SealedSender, run_relay};
use crate::session::{Session, SessionSnapshot, SessionState, session_id_base};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use yuki_crypto::random::generate_session_key;
use yuki_crypto::{Opener, Role, SessionCipher};
use yuki_tun::{InterfaceProvider, VirtualInterface};

/// Reason sent to a client whose credentials are refused.
pub const REJECT_UNAUTHORIZED: &str = "unauthorized";

/// Reason sent to a client speaking another protocol version.
pub const REJECT_VERSION: &str = "unsupported protocol version";

/// The server side of the tunnel.
///
/// Cheap to clone; clones share the session table.
#[derive(Clone)]
pub struct TunnelEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: TunnelConfig,
    identity: Arc<dyn IdentityStore>,
    interfaces: Arc<dyn InterfaceProvider>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    id_suffix: AtomicU64,
}

/// A running session.
pub struct SessionHandle {
    session: Arc<Session>,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    /// Session id
    #[must_use]
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// The session's shared state.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Wait for the relay task to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. `Ok(())` means the session
    /// was closed with [`TunnelEngine::close_session`].
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?
    }
}

impl TunnelEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if `config` is invalid.
    pub fn new(
        config: TunnelConfig,
        identity: Arc<dyn IdentityStore>,
        interfaces: Arc<dyn InterfaceProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                identity,
                interfaces,
                sessions: RwLock::new(HashMap::new()),
                id_suffix: AtomicU64::new(0),
            }),
        })
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Authenticate the peer on `channel` and start relaying.
    ///
    /// On success the session is in the table and its relay task is running.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::AuthenticationFailed`] for refused credentials; a
    ///   reject record has been sent and no session exists
    /// - [`TunnelError::HandshakeFailed`] for a malformed or late hello
    /// - [`TunnelError::PeerClosed`] if the peer left before saying hello
    /// - channel, interface or key generation failures
    pub async fn start_session(&self, channel: Channel) -> Result<SessionHandle> {
        let Channel { mut source, mut sink } = channel;
        let inner = &self.inner;

        let hello = read_hello(source.as_mut(), inner.config.handshake_timeout).await?;
        if hello.version != PROTOCOL_VERSION {
            tracing::warn!(
                client_id = %hello.client_id,
                version = hello.version,
                "rejecting client"
            );
            let reject = ServerReply::Reject {
                reason: REJECT_VERSION.into(),
            };
            sink.send(reject.encode()?).await?;
            return Err(TunnelError::HandshakeFailed(format!(
                "client speaks version {}, expected {PROTOCOL_VERSION}",
                hello.version
            )));
        }
        if !inner
            .identity
            .is_authorized(&hello.client_id, &hello.client_secret)
        {
            tracing::warn!(client_id = %hello.client_id, "authentication failed");
            let reject = ServerReply::Reject {
                reason: REJECT_UNAUTHORIZED.into(),
            };
            sink.send(reject.encode()?).await?;
            return Err(TunnelError::AuthenticationFailed(hello.client_id));
        }

        let record_limit = inner
            .identity
            .get_client(&hello.client_id)
            .map_or(0, |record| record.max_bandwidth);
        let key = generate_session_key()?;
        let session = self
            .register(&hello.client_id, inner.config.effective_bandwidth(record_limit))
            .await;
        session.transition_to(SessionState::Handshaking)?;

        let accept = ServerReply::Accept {
            session_id: session.id().to_string(),
            key: key.clone(),
        };
        let sent = match accept.encode() {
            Ok(record) => sink.send(record).await.map_err(TunnelError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.unregister(&session).await;
            return Err(e);
        }
        inner.identity.set_active(session.client_id(), true);

        let iface = match inner.interfaces.acquire(session.id()).await {
            Ok(iface) => iface,
            Err(e) => {
                self.unregister(&session).await;
                return Err(e.into());
            }
        };
        session.transition_to(SessionState::Relaying)?;

        let (sealer, opener) = SessionCipher::new(key, Role::Responder).into_halves();
        let ctx = RelayContext {
            session: Arc::clone(&session),
            iface,
            identity: Some(Arc::clone(&inner.identity)),
            sender: Arc::new(SealedSender::new(sealer, sink)),
            timing: RelayTiming {
                poll_interval: inner.config.poll_interval,
                keepalive_timeout: inner.config.keepalive_timeout,
                keepalive_interval: None,
                read_buffer_size: inner.config.read_buffer_size,
            },
        };

        tracing::info!(
            session = %session.id(),
            client_id = %session.client_id(),
            iface = %ctx.iface.name(),
            "session established"
        );

        let engine = self.clone();
        let task = tokio::spawn(async move { engine.relay(ctx, source, opener).await });

        Ok(SessionHandle { session, task })
    }

    /// Start a session and run it to completion.
    ///
    /// # Errors
    ///
    /// As [`TunnelEngine::start_session`], then whatever ended the relay.
    pub async fn accept(&self, channel: Channel) -> Result<()> {
        self.start_session(channel).await?.join().await
    }

    /// Ask a session's relay to stop. Teardown happens on the relay task.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::SessionNotFound`] if no such session is in the
    /// table.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))?;
        session.request_shutdown();
        Ok(())
    }

    /// Ask every session to stop.
    pub async fn close_all(&self) {
        for session in self.inner.sessions.read().await.values() {
            session.request_shutdown();
        }
    }

    /// Ask sessions of clients that are no longer admitted (blocked, expired
    /// or removed) to stop. Returns how many were asked.
    pub async fn close_revoked(&self) -> usize {
        let identity = &self.inner.identity;
        let mut closed = 0;
        for session in self.inner.sessions.read().await.values() {
            if identity.is_revoked(session.client_id()) {
                tracing::info!(
                    session = %session.id(),
                    client_id = %session.client_id(),
                    "closing session of revoked client"
                );
                session.request_shutdown();
                closed += 1;
            }
        }
        closed
    }

    /// Snapshots of all sessions, ordered by id.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Snapshot of one session.
    pub async fn session(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.snapshot())
    }

    /// Number of sessions in the table.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Insert a new session under a unique id.
    async fn register(&self, client_id: &str, max_bandwidth: u64) -> Arc<Session> {
        let base = session_id_base(client_id, unix_time());
        let mut sessions = self.inner.sessions.write().await;

        let mut id = base.clone();
        while sessions.contains_key(&id) {
            let suffix = self.inner.id_suffix.fetch_add(1, Ordering::Relaxed) + 1;
            id = format!("{base}-{suffix}");
        }

        let session = Arc::new(Session::new(id.clone(), client_id, Role::Responder, max_bandwidth));
        sessions.insert(id, Arc::clone(&session));
        session
    }

    /// Remove `session`; its client stops being active with its last session.
    async fn unregister(&self, session: &Session) {
        let mut sessions = self.inner.sessions.write().await;
        sessions.remove(session.id());

        let client_id = session.client_id();
        if !sessions.values().any(|other| other.client_id() == client_id) {
            self.inner.identity.set_active(client_id, false);
        }
    }

    async fn relay(
        &self,
        ctx: RelayContext,
        mut source: Box<dyn RecordSource>,
        mut opener: Opener,
    ) -> Result<()> {
        let result = run_relay(&ctx, source.as_mut(), &mut opener).await;
        drop(opener);
        drop(source);

        match &result {
            Ok(()) => tracing::info!(session = %ctx.session.id(), "session closed"),
            Err(TunnelError::PeerClosed) => {
                tracing::info!(session = %ctx.session.id(), "peer disconnected");
            }
            Err(e) => tracing::warn!(session = %ctx.session.id(), error = %e, "session ended"),
        }

        self.teardown(&ctx.session, Arc::clone(&ctx.iface)).await;
        if let Err(e) = ctx.sender.shutdown().await {
            tracing::debug!(session = %ctx.session.id(), error = %e, "channel shutdown failed");
        }
        result
    }

    async fn teardown(&self, session: &Session, iface: Arc<dyn VirtualInterface>) {
        if !session.begin_close() {
            return;
        }

        self.unregister(session).await;
        if let Err(e) = self.inner.interfaces.release(session.id(), iface).await {
            tracing::warn!(session = %session.id(), error = %e, "failed to release interface");
        }

        if let Err(e) = session.transition_to(SessionState::Closed) {
            tracing::debug!(session = %session.id(), error = %e, "teardown state");
        }
        tracing::debug!(
            session = %session.id(),
            bytes_up = session.bytes_up(),
            bytes_down = session.bytes_down(),
            "session torn down"
        );
    }
}

async fn read_hello(
    source: &mut dyn RecordSource,
    deadline: std::time::Duration,
) -> Result<ClientHello> {
    let record = tokio::time::timeout(deadline, source.recv())
        .await
        .map_err(|_| TunnelError::HandshakeFailed(format!("no hello within {deadline:?}")))??;
    let record = record.ok_or(TunnelError::PeerClosed)?;
    ClientHello::decode(&record)
}
