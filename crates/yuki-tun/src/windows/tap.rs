//! TAP-Windows fallback interface.
//!
//! Opens the driver's character device `\\.\Global\<name>.tap`. Reads run
//! on one [`PacketPump`] thread per adapter; writes go through tokio's
//! blocking pool. Closing cancels the pending read so the thread can exit.

use super::netsh;
use crate::pump::PacketPump;
use crate::routes::RouteSet;
use crate::{MAX_PACKET_SIZE, TunError, TunResult, VirtualInterface};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Device path of the TAP adapter `name`.
#[must_use]
pub fn device_path(name: &str) -> String {
    format!(r"\\.\Global\{name}.tap")
}

/// A TAP-Windows adapter opened as a file.
pub struct TapInterface {
    file: Arc<File>,
    reader: PacketPump,
    name: String,
    mtu: u16,
    closed: AtomicBool,
    routes: Mutex<RouteSet>,
}

impl TapInterface {
    /// Open the TAP adapter `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Create`] if the device cannot be opened.
    pub fn open(name: &str, mtu: u16) -> TunResult<Self> {
        let path = device_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TunError::Create(format!("failed to open {path}: {e}")))?;
        let file = Arc::new(file);

        let device = Arc::clone(&file);
        let reader = PacketPump::spawn(name, MAX_PACKET_SIZE, move |buf| {
            (&*device).read(buf).map(Some)
        })?;

        tracing::info!(name, mtu, "opened TAP adapter");

        Ok(Self {
            file,
            reader,
            name: name.to_string(),
            mtu,
            closed: AtomicBool::new(false),
            routes: Mutex::new(RouteSet::new(name)),
        })
    }

    fn ensure_open(&self) -> TunResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunError::Closed);
        }
        Ok(())
    }

    /// Stop the reader thread without waiting for it; if a read slips past
    /// the cancellation it ends with the next packet or when the handle closes.
    fn shutdown(&self) {
        if self.reader.is_shut_down() {
            return;
        }
        self.reader.shutdown();
        self.reader.interrupt();
    }
}

#[async_trait]
impl VirtualInterface for TapInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn read(&self, buf: &mut [u8]) -> TunResult<usize> {
        self.ensure_open()?;
        self.reader.recv(buf).await
    }

    async fn write(&self, packet: &[u8]) -> TunResult<usize> {
        self.ensure_open()?;
        let file = Arc::clone(&self.file);
        let packet = packet.to_vec();

        let n = tokio::task::spawn_blocking(move || (&*file).write(&packet))
            .await
            .map_err(|e| TunError::Io(io::Error::other(e)))??;
        Ok(n)
    }

    async fn configure_address(
        &self,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> TunResult<()> {
        self.ensure_open()?;
        let mut routes = self.routes.lock().await;
        netsh::configure(&self.name, &mut routes, address, netmask, gateway).await
    }

    async fn close(&self) -> TunResult<()> {
        self.routes.lock().await.remove().await;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown();
            tracing::info!(name = %self.name, "TAP adapter closed");
        }
        Ok(())
    }
}

impl Drop for TapInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("Yuki Tunnel"), r"\\.\Global\Yuki Tunnel.tap");
    }
}
