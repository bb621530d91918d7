//! In-memory virtual interface.
//!
//! A [`MemoryInterface`] behaves like a TUN device whose "kernel side" is a
//! [`MemoryHandle`]: packets injected through the handle become readable from
//! the interface, and packets written to the interface are received by the
//! handle. Used by tests and by anything that wants to drive the engine
//! without a real device.

use crate::{TunError, TunResult, VirtualInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

/// Address assigned through [`VirtualInterface::configure_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedAddress {
    /// Interface address
    pub address: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Gateway, if one was given
    pub gateway: Option<Ipv4Addr>,
}

struct Shared {
    closed: watch::Sender<bool>,
    assigned: Mutex<Option<AssignedAddress>>,
}

/// Channel-backed virtual interface.
pub struct MemoryInterface {
    name: String,
    mtu: u16,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
}

/// The host side of a [`MemoryInterface`].
pub struct MemoryHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryInterface {
    /// Create an interface and its host-side handle.
    #[must_use]
    pub fn new(name: impl Into<String>, mtu: u16) -> (Self, MemoryHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            closed: watch::Sender::new(false),
            assigned: Mutex::new(None),
        });

        let iface = Self {
            name: name.into(),
            mtu,
            inbound: AsyncMutex::new(inject_rx),
            outbound: written_tx,
            shared: Arc::clone(&shared),
        };
        let handle = MemoryHandle {
            inject: inject_tx,
            written: written_rx,
            shared,
        };
        (iface, handle)
    }

    fn ensure_open(&self) -> TunResult<()> {
        if *self.shared.closed.borrow() {
            return Err(TunError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn read(&self, buf: &mut [u8]) -> TunResult<usize> {
        let mut closed = self.shared.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        let packet = tokio::select! {
            packet = inbound.recv() => packet.ok_or(TunError::Closed)?,
            () = wait_closed(&mut closed) => return Err(TunError::Closed),
        };

        // Oversized packets are truncated, as a short read buffer would on a real device.
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write(&self, packet: &[u8]) -> TunResult<usize> {
        self.ensure_open()?;
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| TunError::Closed)?;
        Ok(packet.len())
    }

    async fn configure_address(
        &self,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> TunResult<()> {
        self.ensure_open()?;
        let mut assigned = self
            .shared
            .assigned
            .lock()
            .map_err(|_| TunError::Configure("address state poisoned".into()))?;
        *assigned = Some(AssignedAddress {
            address,
            netmask,
            gateway,
        });
        Ok(())
    }

    async fn close(&self) -> TunResult<()> {
        if !self.shared.closed.send_replace(true) {
            tracing::debug!(name = %self.name, "memory interface closed");
        }
        Ok(())
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives as long as the interface, so this only returns on close.
    let _ = closed.wait_for(|closed| *closed).await.map(|_| ());
}

impl MemoryHandle {
    /// Make `packet` readable from the interface.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Closed`] once the interface has been dropped.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> TunResult<()> {
        self.inject
            .send(packet.into())
            .map_err(|_| TunError::Closed)
    }

    /// Next packet written to the interface, or `None` once it is dropped.
    pub async fn recv_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Written packet if one is already queued.
    pub fn try_recv_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }

    /// Whether the interface has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Address last assigned to the interface.
    #[must_use]
    pub fn assigned(&self) -> Option<AssignedAddress> {
        self.shared.assigned.lock().ok().and_then(|guard| *guard)
    }
}
