//! Initiator side of the tunnel.

use crate::channel::{Channel, RecordSource};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::handshake::{ClientHello, ServerReply};
use crate::relay::{RelayContext, RelayTiming, SealedSender, run_relay};
use crate::session::{Session, SessionState};
use std::sync::Arc;
use yuki_crypto::{Opener, Role, SessionCipher};
use yuki_tun::VirtualInterface;

/// Credentials and timers for connecting to a server.
#[derive(Clone)]
pub struct TunnelClient {
    config: TunnelConfig,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("config", &self.config)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if `config` is invalid.
    pub fn new(
        config: TunnelConfig,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Client id presented to the server
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Perform the handshake on `channel`.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::AuthenticationFailed`] with the server's reason if the
    ///   credentials were refused
    /// - [`TunnelError::HandshakeFailed`] for a malformed or late reply
    /// - [`TunnelError::PeerClosed`] if the server hung up
    pub async fn connect(&self, channel: Channel) -> Result<ClientSession> {
        let Channel { mut source, mut sink } = channel;

        sink.send(ClientHello::new(&self.client_id, &self.client_secret).encode()?)
            .await?;

        let deadline = self.config.handshake_timeout;
        let record = tokio::time::timeout(deadline, source.recv())
            .await
            .map_err(|_| TunnelError::HandshakeFailed(format!("no reply within {deadline:?}")))??
            .ok_or(TunnelError::PeerClosed)?;

        let (session_id, key) = match ServerReply::decode(&record)? {
            ServerReply::Accept { session_id, key } => (session_id, key),
            ServerReply::Reject { reason } => {
                tracing::warn!(client_id = %self.client_id, %reason, "server rejected credentials");
                return Err(TunnelError::AuthenticationFailed(reason));
            }
        };

        let session = Arc::new(Session::new(session_id, &self.client_id, Role::Initiator, 0));
        session.transition_to(SessionState::Handshaking)?;
        let (sealer, opener) = SessionCipher::new(key, Role::Initiator).into_halves();

        tracing::info!(session = %session.id(), "connected");

        Ok(ClientSession {
            session,
            timing: RelayTiming {
                poll_interval: self.config.poll_interval,
                keepalive_timeout: self.config.keepalive_timeout,
                keepalive_interval: Some(self.config.keepalive_interval),
                read_buffer_size: self.config.read_buffer_size,
            },
            source,
            opener,
            sender: Arc::new(SealedSender::new(sealer, sink)),
        })
    }
}

/// An authenticated client session, ready to relay.
pub struct ClientSession {
    session: Arc<Session>,
    timing: RelayTiming,
    source: Box<dyn RecordSource>,
    opener: Opener,
    sender: Arc<SealedSender>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.session.id())
            .field("client_id", &self.session.client_id())
            .field("state", &self.session.state())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Session id assigned by the server
    #[must_use]
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// The session's shared state; [`Session::request_shutdown`] stops
    /// [`ClientSession::run`].
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Relay between the server and `iface` until either side stops.
    ///
    /// # Errors
    ///
    /// Returns whatever ended the relay; `Ok(())` only after a requested
    /// shutdown.
    pub async fn run(self, iface: Arc<dyn VirtualInterface>) -> Result<()> {
        let Self {
            session,
            timing,
            mut source,
            mut opener,
            sender,
        } = self;
        session.transition_to(SessionState::Relaying)?;

        let ctx = RelayContext {
            session: Arc::clone(&session),
            iface,
            identity: None,
            sender,
            timing,
        };
        let result = run_relay(&ctx, source.as_mut(), &mut opener).await;
        drop(opener);

        session.begin_close();
        if let Err(e) = ctx.sender.shutdown().await {
            tracing::debug!(session = %session.id(), error = %e, "channel shutdown failed");
        }
        if let Err(e) = session.transition_to(SessionState::Closed) {
            tracing::debug!(session = %session.id(), error = %e, "teardown state");
        }

        match &result {
            Ok(()) => tracing::info!(session = %session.id(), "disconnected"),
            Err(e) => tracing::warn!(session = %session.id(), error = %e, "tunnel ended"),
        }
        result
    }
}
