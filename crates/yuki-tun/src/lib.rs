//! # Yuki TUN
//!
//! Virtual network interfaces that move raw Layer-3 packets between the
//! operating system and the tunnel engine.
//!
//! ## Backends
//!
//! | Backend | Platform | Device |
//! |---------|----------|--------|
//! | [`linux::LinuxTun`] | Linux | `/dev/net/tun` with `IFF_TUN \| IFF_NO_PI` |
//! | `windows::WintunInterface` | Windows | `wintun.dll` ring buffers |
//! | `windows::TapInterface` | Windows | `\\.\Global\<name>.tap` fallback |
//! | [`memory::MemoryInterface`] | any | in-process channels |
//!
//! Drivers that only read synchronously (TAP, Wintun) are read on a
//! dedicated thread through a [`pump::PacketPump`].
//!
//! All backends implement [`VirtualInterface`]. The engine never downcasts;
//! it obtains interfaces through an [`provider::InterfaceProvider`] that
//! decides whether sessions share one device or get their own.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod error;
pub mod memory;
pub mod provider;
pub mod pump;
pub mod routes;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(windows)]
pub mod windows;

pub use error::{TunError, TunResult};
pub use memory::{MemoryHandle, MemoryInterface};
pub use provider::{InterfaceProvider, PerSessionInterface, SharedInterface};

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Largest IPv4 packet a device can hand us
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

/// Uniform contract over raw IP-packet devices.
///
/// Methods take `&self` so one direction can read while the other writes.
/// `read` may fail with a transient error (see [`TunError::is_transient`])
/// when the backend's own wait period elapses.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Interface name as known to the operating system.
    fn name(&self) -> &str;

    /// Configured MTU.
    fn mtu(&self) -> u16;

    /// Read one packet into `buf`, returning its length.
    async fn read(&self, buf: &mut [u8]) -> TunResult<usize>;

    /// Write one packet, returning the number of bytes accepted.
    async fn write(&self, packet: &[u8]) -> TunResult<usize>;

    /// Assign an address and bring the interface up.
    async fn configure_address(
        &self,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> TunResult<()>;

    /// Release the device. Later reads and writes fail with [`TunError::Closed`].
    async fn close(&self) -> TunResult<()>;
}

/// Parameters for creating and addressing an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Requested device name (the kernel may assign another)
    pub name: String,
    /// Local tunnel address
    pub address: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Gateway for default routes (client side only)
    pub gateway: Option<Ipv4Addr>,
    /// Device MTU
    pub mtu: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Create and address the native interface for the current platform.
///
/// On Windows, Wintun is tried first and the TAP driver is used if
/// `wintun.dll` cannot be loaded or the adapter cannot be created.
///
/// # Errors
///
/// Returns [`TunError::Unsupported`] on platforms without a backend, or the
/// backend's creation/configuration error.
pub async fn create_platform_interface(
    config: &InterfaceConfig,
) -> TunResult<Arc<dyn VirtualInterface>> {
    #[cfg(target_os = "linux")]
    {
        let tun = linux::LinuxTun::create(&config.name, config.mtu)?;
        tun.configure_address(config.address, config.netmask, config.gateway)
            .await?;
        Ok(Arc::new(tun))
    }

    #[cfg(windows)]
    {
        let iface = windows::create_interface(config)?;
        iface
            .configure_address(config.address, config.netmask, config.gateway)
            .await?;
        Ok(iface)
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = config;
        Err(TunError::Unsupported(
            "no virtual interface backend for this platform",
        ))
    }
}
