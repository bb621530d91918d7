//! Duplex relay between an encrypted record channel and a virtual interface.
//!
//! Two loops run per session:
//!
//! - **inbound**: record source -> open -> frame -> interface
//! - **outbound**: interface -> frame -> seal -> record sink
//!
//! [`run_relay`] drives both with the session's shutdown signal under one
//! `select!`; whichever finishes first decides the result and the others are
//! dropped.

use crate::channel::{RecordSink, RecordSource};
use crate::error::{Result, TunnelError};
use crate::frame::{Frame, FrameType, open_frame, seal_frame};
use crate::identity::IdentityStore;
use crate::session::{Session, wait_shutdown};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use yuki_crypto::{Opener, Sealer};
use yuki_tun::VirtualInterface;

/// Sealing half and record sink under one lock, so envelopes leave in nonce
/// order.
pub struct SealedSender {
    inner: Mutex<SealedSink>,
}

struct SealedSink {
    sealer: Sealer,
    sink: Box<dyn RecordSink>,
}

impl SealedSender {
    /// Pair a sealer with the sink its envelopes go to.
    #[must_use]
    pub fn new(sealer: Sealer, sink: Box<dyn RecordSink>) -> Self {
        Self {
            inner: Mutex::new(SealedSink { sealer, sink }),
        }
    }

    /// Seal `frame` and send it.
    ///
    /// # Errors
    ///
    /// Returns the sealer's error or the sink's I/O error.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let envelope = seal_frame(&mut inner.sealer, frame)?;
        inner.sink.send(envelope).await?;
        Ok(())
    }

    /// Shut the sink down.
    ///
    /// # Errors
    ///
    /// Returns the sink's I/O error.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.lock().await.sink.shutdown().await?;
        Ok(())
    }
}

/// Timers governing the relay loops.
#[derive(Debug, Clone, Copy)]
pub struct RelayTiming {
    /// Bound on one interface read
    pub poll_interval: Duration,
    /// Idle deadline
    pub keepalive_timeout: Duration,
    /// Ping period; `None` on the responder
    pub keepalive_interval: Option<Duration>,
    /// Interface read buffer size
    pub read_buffer_size: usize,
}

/// Everything both loops share.
pub struct RelayContext {
    /// Session being relayed
    pub session: Arc<Session>,
    /// Interface packets come from and go to
    pub iface: Arc<dyn VirtualInterface>,
    /// Traffic is reported here when present
    pub identity: Option<Arc<dyn IdentityStore>>,
    /// Sealing half and sink
    pub sender: Arc<SealedSender>,
    /// Timers
    pub timing: RelayTiming,
}

impl RelayContext {
    fn report(&self, bytes_up: u64, bytes_down: u64) {
        if let Some(identity) = &self.identity {
            identity.update_traffic(self.session.client_id(), bytes_up, bytes_down);
        }
    }
}

/// Run both loops until one ends or shutdown is requested.
///
/// Returns `Ok(())` only for a requested shutdown.
///
/// # Errors
///
/// Returns the error that ended the first loop to finish, including
/// [`TunnelError::PeerClosed`] for a clean close by the peer.
pub async fn run_relay(
    ctx: &RelayContext,
    source: &mut dyn RecordSource,
    opener: &mut Opener,
) -> Result<()> {
    let mut shutdown = ctx.session.subscribe_shutdown();

    tokio::select! {
        result = inbound_loop(ctx, source, opener) => result,
        result = outbound_loop(ctx) => result,
        () = wait_shutdown(&mut shutdown) => {
            tracing::debug!(session = %ctx.session.id(), "relay shutdown requested");
            Ok(())
        }
    }
}

/// Records from the peer to the interface.
///
/// # Errors
///
/// Never returns `Ok`; ends with [`TunnelError::PeerClosed`] or the fatal
/// error that stopped it.
pub async fn inbound_loop(
    ctx: &RelayContext,
    source: &mut dyn RecordSource,
    opener: &mut Opener,
) -> Result<()> {
    let session = &ctx.session;

    loop {
        let Some(record) = source.recv().await? else {
            tracing::debug!(session = %session.id(), "peer closed the channel");
            return Err(TunnelError::PeerClosed);
        };

        let frame = match open_frame(opener, &record) {
            Ok(frame) => frame,
            Err(e) if e.is_packet_local() => {
                tracing::warn!(session = %session.id(), error = %e, "dropping inbound record");
                continue;
            }
            Err(e) => return Err(e),
        };

        match frame.frame_type() {
            FrameType::Data => {
                let len = frame.len();
                if len == 0 {
                    tracing::debug!(session = %session.id(), "ignoring empty data frame");
                    continue;
                }
                ctx.iface.write(frame.payload()).await?;
                session.record_down(len);
                ctx.report(0, len as u64);
                tracing::trace!(session = %session.id(), len, "packet to interface");
            }
            FrameType::Ping => {
                session.touch();
                ctx.sender.send_frame(&Frame::pong()).await?;
                tracing::trace!(session = %session.id(), "answered ping");
            }
            FrameType::Pong => {
                session.touch();
                tracing::trace!(session = %session.id(), "pong received");
            }
        }
    }
}

/// Packets from the interface to the peer.
///
/// # Errors
///
/// Never returns `Ok`; ends with the policy violation or I/O error that
/// stopped it.
pub async fn outbound_loop(ctx: &RelayContext) -> Result<()> {
    let session = &ctx.session;
    let timing = ctx.timing;
    let mut buf = vec![0u8; timing.read_buffer_size];
    let mut last_ping = Instant::now();

    loop {
        if let Some(interval) = timing.keepalive_interval {
            if last_ping.elapsed() >= interval {
                ctx.sender.send_frame(&Frame::ping()).await?;
                last_ping = Instant::now();
                tracing::trace!(session = %session.id(), "ping sent");
            }
        }

        let n = match tokio::time::timeout(timing.poll_interval, ctx.iface.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
            Ok(Err(_)) | Err(_) => {
                check_idle(session, timing.keepalive_timeout)?;
                continue;
            }
        };
        // Outbound traffic is not proof the peer is alive.
        check_idle(session, timing.keepalive_timeout)?;
        if n == 0 {
            continue;
        }

        session.check_bandwidth(n)?;
        ctx.sender.send_frame(&Frame::data(&buf[..n])).await?;
        session.record_up(n);
        ctx.report(n as u64, 0);
        tracing::trace!(session = %session.id(), len = n, "packet to peer");
    }
}

fn check_idle(session: &Session, timeout: Duration) -> Result<()> {
    let idle = session.idle_for();
    if idle >= timeout {
        tracing::info!(session = %session.id(), ?idle, "keepalive timeout");
        return Err(TunnelError::KeepaliveTimeout(timeout));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::identity::{ClientRecord, ClientRegistry};
    use yuki_crypto::{AeadKey, CryptoError, Role, SessionCipher};
    use yuki_tun::{MemoryHandle, MemoryInterface};

    struct Harness {
        ctx: RelayContext,
        opener: Opener,
        source: Box<dyn RecordSource>,
        peer: Channel,
        peer_sealer: Sealer,
        peer_opener: Opener,
        handle: MemoryHandle,
        registry: Arc<ClientRegistry>,
    }

    fn harness(max_bandwidth: u64) -> Harness {
        let key = AeadKey::new([9; 32]);
        let (sealer, opener) = SessionCipher::new(key.clone(), Role::Responder).into_halves();
        let (peer_sealer, peer_opener) = SessionCipher::new(key, Role::Initiator).into_halves();
        let (local, peer) = Channel::memory_pair(16);
        let (source, sink) = local.into_parts();

        let (iface, handle) = MemoryInterface::new("tun-test", 1500);
        let registry = Arc::new(ClientRegistry::new());
        registry
            .insert(ClientRecord::new("alice", "pw", "Alice"))
            .unwrap();

        let session = Arc::new(Session::new(
            "alice-1",
            "alice",
            Role::Responder,
            max_bandwidth,
        ));
        let ctx = RelayContext {
            session,
            iface: Arc::new(iface),
            identity: Some(Arc::clone(&registry) as Arc<dyn IdentityStore>),
            sender: Arc::new(SealedSender::new(sealer, sink)),
            timing: RelayTiming {
                poll_interval: Duration::from_secs(1),
                keepalive_timeout: Duration::from_secs(30),
                keepalive_interval: None,
                read_buffer_size: 2048,
            },
        };

        Harness {
            ctx,
            opener,
            source,
            peer,
            peer_sealer,
            peer_opener,
            handle,
            registry,
        }
    }

    #[tokio::test]
    async fn test_inbound_data_reaches_interface() {
        let mut h = harness(0);
        let env = seal_frame(&mut h.peer_sealer, &Frame::data(vec![0x45; 60])).unwrap();
        h.peer.sink.send(env).await.unwrap();
        h.peer.sink.shutdown().await.unwrap();

        let err = inbound_loop(&h.ctx, h.source.as_mut(), &mut h.opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::PeerClosed));

        assert_eq!(h.handle.recv_written().await.unwrap(), vec![0x45; 60]);
        assert_eq!(h.ctx.session.bytes_down(), 60);
        assert_eq!(h.registry.get_client("alice").unwrap().bytes_down, 60);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let mut h = harness(0);
        let env = seal_frame(&mut h.peer_sealer, &Frame::ping()).unwrap();
        h.peer.sink.send(env).await.unwrap();
        h.peer.sink.shutdown().await.unwrap();

        let _ = inbound_loop(&h.ctx, h.source.as_mut(), &mut h.opener).await;

        let reply = h.peer.source.recv().await.unwrap().unwrap();
        let frame = open_frame(&mut h.peer_opener, &reply).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Pong);
    }

    #[tokio::test]
    async fn test_bad_records_are_dropped() {
        let mut h = harness(0);
        let first = seal_frame(&mut h.peer_sealer, &Frame::data(vec![1; 20])).unwrap();
        let mut tampered = seal_frame(&mut h.peer_sealer, &Frame::data(vec![2; 20])).unwrap();
        tampered[40] ^= 0x80;
        let third = seal_frame(&mut h.peer_sealer, &Frame::data(vec![3; 20])).unwrap();

        h.peer.sink.send(first.clone()).await.unwrap();
        h.peer.sink.send(tampered).await.unwrap();
        h.peer.sink.send(first).await.unwrap();
        h.peer.sink.send(third).await.unwrap();
        h.peer.sink.shutdown().await.unwrap();

        let err = inbound_loop(&h.ctx, h.source.as_mut(), &mut h.opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::PeerClosed));

        assert_eq!(h.handle.recv_written().await.unwrap(), vec![1; 20]);
        assert_eq!(h.handle.recv_written().await.unwrap(), vec![3; 20]);
        assert!(h.handle.try_recv_written().is_none());
        assert_eq!(h.ctx.session.packets_down(), 2);
    }

    #[tokio::test]
    async fn test_outbound_seals_interface_packets() {
        let Harness {
            ctx,
            mut peer,
            mut peer_opener,
            handle,
            registry,
            ..
        } = harness(0);
        handle.inject(vec![0x45; 60]).unwrap();

        let received = async {
            let record = peer.source.recv().await.unwrap().unwrap();
            open_frame(&mut peer_opener, &record).unwrap()
        };
        let frame = tokio::select! {
            result = outbound_loop(&ctx) => panic!("outbound ended: {result:?}"),
            frame = received => frame,
        };

        assert_eq!(frame, Frame::data(vec![0x45; 60]));
        assert_eq!(ctx.session.bytes_up(), 60);
        assert_eq!(registry.get_client("alice").unwrap().bytes_up, 60);
    }

    #[tokio::test]
    async fn test_outbound_bandwidth_exceeded() {
        let h = harness(1000);
        h.ctx.session.record_up(999);
        h.handle.inject(vec![0u8; 10]).unwrap();

        let err = outbound_loop(&h.ctx).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::BandwidthExceeded {
                limit: 1000,
                used: 999,
                packet: 10
            }
        ));
        assert_eq!(h.ctx.session.bytes_up(), 999);
        assert_eq!(h.registry.get_client("alice").unwrap().bytes_up, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_keepalive_timeout() {
        let h = harness(0);
        let started = Instant::now();

        let err = outbound_loop(&h.ctx).await.unwrap_err();
        assert!(matches!(err, TunnelError::KeepaliveTimeout(_)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed <= Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_interface_still_times_out() {
        let Harness {
            ctx,
            mut peer,
            handle,
            ..
        } = harness(0);

        let feeder = tokio::spawn(async move {
            while handle.inject(vec![0x45; 40]).is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        let drain = tokio::spawn(async move {
            while let Ok(Some(_)) = peer.source.recv().await {}
        });

        let started = Instant::now();
        let err = outbound_loop(&ctx).await.unwrap_err();
        feeder.abort();
        drain.abort();

        assert!(matches!(err, TunnelError::KeepaliveTimeout(_)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed <= Duration::from_secs(32));
        assert!(ctx.session.packets_up() >= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_pings() {
        let Harness {
            mut ctx,
            mut peer,
            mut peer_opener,
            handle: _handle,
            ..
        } = harness(0);
        ctx.timing.keepalive_interval = Some(Duration::from_secs(15));

        let received = async {
            let record = peer.source.recv().await.unwrap().unwrap();
            open_frame(&mut peer_opener, &record).unwrap()
        };
        let started = Instant::now();
        let frame = tokio::select! {
            result = outbound_loop(&ctx) => panic!("outbound ended: {result:?}"),
            frame = received => frame,
        };
        assert_eq!(frame.frame_type(), FrameType::Ping);
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_interface_closed_is_fatal() {
        let h = harness(0);
        h.ctx.iface.close().await.unwrap();
        let err = outbound_loop(&h.ctx).await.unwrap_err();
        assert!(matches!(err, TunnelError::Interface(_)));
    }

    #[tokio::test]
    async fn test_run_relay_shutdown() {
        let mut h = harness(0);
        h.ctx.session.request_shutdown();
        run_relay(&h.ctx, h.source.as_mut(), &mut h.opener)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replayed_envelope_dropped() {
        let mut h = harness(0);
        let env = seal_frame(&mut h.peer_sealer, &Frame::data(vec![7; 8])).unwrap();
        h.peer.sink.send(env.clone()).await.unwrap();
        h.peer.sink.send(env.clone()).await.unwrap();
        h.peer.sink.shutdown().await.unwrap();

        let _ = inbound_loop(&h.ctx, h.source.as_mut(), &mut h.opener).await;
        assert_eq!(h.ctx.session.packets_down(), 1);

        let mut opener = h.opener;
        assert!(matches!(
            opener.open(&env),
            Err(CryptoError::ReplayOrOutOfOrder { .. })
        ));
    }
}
