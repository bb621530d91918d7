//! Interface ownership for sessions.
//!
//! A session never opens a device itself. It asks an [`InterfaceProvider`]
//! for one when relaying starts and hands it back at teardown. Two models
//! exist:
//!
//! - [`SharedInterface`]: every session relays through the same device (one
//!   server-side subnet). Writes from concurrent sessions are serialized by an
//!   async mutex; release does not close the device.
//! - [`PerSessionInterface`]: each session gets an exclusive device from a
//!   factory, closed when the session releases it.

use crate::{TunResult, VirtualInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Source of interfaces for sessions.
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    /// Obtain the interface `session_id` will relay through.
    async fn acquire(&self, session_id: &str) -> TunResult<Arc<dyn VirtualInterface>>;

    /// Return an interface obtained from [`InterfaceProvider::acquire`].
    async fn release(&self, session_id: &str, iface: Arc<dyn VirtualInterface>) -> TunResult<()>;
}

/// One device shared by all sessions.
pub struct SharedInterface {
    device: Arc<SerializedWrites>,
}

impl SharedInterface {
    /// Share `inner` between sessions.
    #[must_use]
    pub fn new(inner: Arc<dyn VirtualInterface>) -> Self {
        Self {
            device: Arc::new(SerializedWrites {
                inner,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// The shared device, with writes serialized.
    #[must_use]
    pub fn device(&self) -> Arc<dyn VirtualInterface> {
        Arc::clone(&self.device) as Arc<dyn VirtualInterface>
    }
}

#[async_trait]
impl InterfaceProvider for SharedInterface {
    async fn acquire(&self, session_id: &str) -> TunResult<Arc<dyn VirtualInterface>> {
        tracing::debug!(session = session_id, iface = self.device.name(), "sharing interface");
        Ok(self.device())
    }

    async fn release(&self, _session_id: &str, _iface: Arc<dyn VirtualInterface>) -> TunResult<()> {
        // The device outlives individual sessions.
        Ok(())
    }
}

/// Wrapper that lets one writer at a time through to the device.
struct SerializedWrites {
    inner: Arc<dyn VirtualInterface>,
    write_lock: Mutex<()>,
}

#[async_trait]
impl VirtualInterface for SerializedWrites {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mtu(&self) -> u16 {
        self.inner.mtu()
    }

    async fn read(&self, buf: &mut [u8]) -> TunResult<usize> {
        self.inner.read(buf).await
    }

    async fn write(&self, packet: &[u8]) -> TunResult<usize> {
        let _guard = self.write_lock.lock().await;
        self.inner.write(packet).await
    }

    async fn configure_address(
        &self,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> TunResult<()> {
        self.inner.configure_address(address, netmask, gateway).await
    }

    async fn close(&self) -> TunResult<()> {
        self.inner.close().await
    }
}

type Factory = dyn Fn(&str) -> TunResult<Arc<dyn VirtualInterface>> + Send + Sync;

/// A fresh device per session.
pub struct PerSessionInterface {
    factory: Box<Factory>,
}

impl PerSessionInterface {
    /// Create devices with `factory`, which receives the session id.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> TunResult<Arc<dyn VirtualInterface>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

#[async_trait]
impl InterfaceProvider for PerSessionInterface {
    async fn acquire(&self, session_id: &str) -> TunResult<Arc<dyn VirtualInterface>> {
        let iface = (self.factory)(session_id)?;
        tracing::debug!(session = session_id, iface = iface.name(), "created session interface");
        Ok(iface)
    }

    async fn release(&self, session_id: &str, iface: Arc<dyn VirtualInterface>) -> TunResult<()> {
        tracing::debug!(session = session_id, iface = iface.name(), "closing session interface");
        iface.close().await
    }
}
