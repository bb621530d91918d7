//! Linux TUN device via `/dev/net/tun`.
//!
//! The device is opened, bound to an interface with `ioctl(TUNSETIFF)` using
//! `IFF_TUN | IFF_NO_PI` (raw IP packets, no packet-information header),
//! switched to non-blocking mode and registered with the tokio reactor through
//! [`AsyncFd`]. Address and MTU are applied with iproute2.

use crate::command::NetCommand;
use crate::{TunError, TunResult, VirtualInterface};
use async_trait::async_trait;
use ipnet::ipv4_mask_to_prefix;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::unix::AsyncFd;

const TUN_PATH: &str = "/dev/net/tun";

/// Raw IP packets without the packet-information header.
const TUN_FLAGS: libc::c_short = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

/// Kernel interface names are at most 15 bytes plus NUL.
const IFNAMSIZ: usize = 16;

/// `struct ifreq` as used by `TUNSETIFF`: name, flags, and the remainder of
/// the kernel's union so the full structure size is passed.
#[repr(C)]
struct TunRequest {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunRequest {
    /// Request for interface `name`, which must be shorter than `IFNAMSIZ`.
    fn new(name: &str) -> Self {
        let mut request = Self {
            name: [0; IFNAMSIZ],
            flags: TUN_FLAGS,
            _pad: [0; 22],
        };
        request.name[..name.len()].copy_from_slice(name.as_bytes());
        request
    }
}

/// A Linux TUN interface.
pub struct LinuxTun {
    fd: AsyncFd<File>,
    name: String,
    mtu: u16,
    closed: AtomicBool,
}

impl LinuxTun {
    /// Open `/dev/net/tun` and attach it to interface `name`.
    ///
    /// An empty name lets the kernel pick one (`tunN`); the resolved name is
    /// available from [`VirtualInterface::name`].
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Create`] if the device cannot be opened, the name
    /// is too long, or the ioctl fails.
    pub fn create(name: &str, mtu: u16) -> TunResult<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(TunError::Create(format!(
                "interface name `{name}` exceeds {} bytes",
                IFNAMSIZ - 1
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_PATH)
            .map_err(|e| TunError::Create(format!("failed to open {TUN_PATH}: {e}")))?;

        let mut request = TunRequest::new(name);

        // SAFETY: `file` is an open descriptor and `request` is a properly
        // sized, initialised ifreq that outlives the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &mut request) };
        if rc < 0 {
            return Err(TunError::Create(format!(
                "ioctl(TUNSETIFF) failed: {}",
                io::Error::last_os_error()
            )));
        }

        set_nonblocking(&file)?;
        let resolved = resolve_name(&request.name);
        // SAFETY: `file` is owned by the AsyncFd from here on, so its
        // descriptor stays open and unchanged until the AsyncFd drops.
        let fd = unsafe { AsyncFd::register(file) }.map_err(io::Error::from)?;

        tracing::info!(name = %resolved, mtu, "created TUN interface");

        Ok(Self {
            fd,
            name: resolved,
            mtu,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> TunResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunError::Closed);
        }
        Ok(())
    }
}

fn set_nonblocking(file: &File) -> TunResult<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own; flags are preserved.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn resolve_name(raw: &[u8; IFNAMSIZ]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// iproute2 invocations that address the interface and bring it up.
pub fn address_commands(
    name: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    mtu: u16,
) -> TunResult<Vec<NetCommand>> {
    let prefix = ipv4_mask_to_prefix(netmask)
        .map_err(|_| TunError::Configure(format!("invalid netmask {netmask}")))?;
    let cidr = format!("{address}/{prefix}");
    let mtu = mtu.to_string();

    Ok(vec![
        NetCommand::new("ip", ["addr", "add", cidr.as_str(), "dev", name]),
        NetCommand::new("ip", ["link", "set", "dev", name, "mtu", mtu.as_str()]),
        NetCommand::new("ip", ["link", "set", "dev", name, "up"]),
    ])
}

#[async_trait]
impl VirtualInterface for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn read(&self, buf: &mut [u8]) -> TunResult<usize> {
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                Ok(result) => return result.map_err(TunError::from),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, packet: &[u8]) -> TunResult<usize> {
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(packet)) {
                Ok(result) => return result.map_err(TunError::from),
                Err(_would_block) => continue,
            }
        }
    }

    async fn configure_address(
        &self,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> TunResult<()> {
        for cmd in address_commands(&self.name, address, netmask, self.mtu)? {
            cmd.run().await?;
        }
        if let Some(gateway) = gateway {
            tracing::debug!(%gateway, "gateway is implied by the point-to-point link");
        }
        tracing::info!(name = %self.name, %address, %netmask, "TUN interface configured");
        Ok(())
    }

    async fn close(&self) -> TunResult<()> {
        // The descriptor is released when the last handle drops.
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(name = %self.name, "TUN interface closed");
        }
        Ok(())
    }
}
