//! Wintun ring-buffer interface.
//!
//! [`WintunLibrary`] loads `wintun.dll` once and resolves every entry point up
//! front; a missing symbol is a load error rather than a failure on first use.
//! [`WintunInterface`] creates an adapter and starts a session with an 8 MiB
//! ring. A [`PacketPump`] thread drains the ring, waiting on the session's
//! read event together with a private shutdown event; writes commit a ring
//! slot directly.
//!
//! Closing signals the shutdown event and joins the reader thread before
//! `WintunEndSession` frees the session and its read event, so no wait or
//! receive can touch a freed handle.

use super::netsh;
use crate::pump::PacketPump;
use crate::routes::RouteSet;
use crate::{MAX_PACKET_SIZE, TunError, TunResult, VirtualInterface};
use async_trait::async_trait;
use libloading::Library;
use std::ffi::{OsStr, c_void};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_NO_MORE_ITEMS, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};
use windows_sys::core::GUID;

/// Session ring capacity (8 MiB).
pub const RING_CAPACITY: u32 = 0x80_0000;

/// Tunnel type shown for adapters created by Yuki.
pub const TUNNEL_TYPE: &str = "Yuki";

/// Fixed adapter GUID so that restarts reuse the same adapter identity.
pub const ADAPTER_GUID: GUID = GUID::from_u128(0xdeadbabe_cafe_beef_0123_456789abcdef);

/// Upper bound on one wait for the read or shutdown event.
const READ_WAIT_MS: u32 = 1000;

type CreateAdapterFn =
    unsafe extern "system" fn(*const u16, *const u16, *const GUID) -> *mut c_void;
type OpenAdapterFn = unsafe extern "system" fn(*const u16) -> *mut c_void;
type CloseAdapterFn = unsafe extern "system" fn(*mut c_void);
type StartSessionFn = unsafe extern "system" fn(*mut c_void, u32) -> *mut c_void;
type EndSessionFn = unsafe extern "system" fn(*mut c_void);
type GetReadWaitEventFn = unsafe extern "system" fn(*mut c_void) -> *mut c_void;
type ReceivePacketFn = unsafe extern "system" fn(*mut c_void, *mut u32) -> *mut u8;
type ReleaseReceivePacketFn = unsafe extern "system" fn(*mut c_void, *const u8);
type AllocateSendPacketFn = unsafe extern "system" fn(*mut c_void, u32) -> *mut u8;
type SendPacketFn = unsafe extern "system" fn(*mut c_void, *const u8);

/// Loaded `wintun.dll` with all entry points resolved.
pub struct WintunLibrary {
    create_adapter: CreateAdapterFn,
    open_adapter: OpenAdapterFn,
    close_adapter: CloseAdapterFn,
    start_session: StartSessionFn,
    end_session: EndSessionFn,
    get_read_wait_event: GetReadWaitEventFn,
    receive_packet: ReceivePacketFn,
    release_receive_packet: ReleaseReceivePacketFn,
    allocate_send_packet: AllocateSendPacketFn,
    send_packet: SendPacketFn,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl WintunLibrary {
    /// Load `wintun.dll` from the standard DLL search path.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::LibraryLoad`] if the DLL or a symbol is missing.
    pub fn load_default() -> TunResult<Self> {
        Self::load("wintun.dll")
    }

    /// Load the driver library from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::LibraryLoad`] if the DLL or a symbol is missing.
    pub fn load(path: impl AsRef<OsStr>) -> TunResult<Self> {
        // SAFETY: wintun.dll has no initialisation routines with preconditions.
        let library = unsafe { Library::new(path.as_ref()) }
            .map_err(|e| TunError::LibraryLoad(e.to_string()))?;

        // SAFETY: each symbol is looked up with the signature documented in wintun.h.
        unsafe {
            Ok(Self {
                create_adapter: symbol(&library, b"WintunCreateAdapter\0")?,
                open_adapter: symbol(&library, b"WintunOpenAdapter\0")?,
                close_adapter: symbol(&library, b"WintunCloseAdapter\0")?,
                start_session: symbol(&library, b"WintunStartSession\0")?,
                end_session: symbol(&library, b"WintunEndSession\0")?,
                get_read_wait_event: symbol(&library, b"WintunGetReadWaitEvent\0")?,
                receive_packet: symbol(&library, b"WintunReceivePacket\0")?,
                release_receive_packet: symbol(&library, b"WintunReleaseReceivePacket\0")?,
                allocate_send_packet: symbol(&library, b"WintunAllocateSendPacket\0")?,
                send_packet: symbol(&library, b"WintunSendPacket\0")?,
                _library: library,
            })
        }
    }
}

/// # Safety
///
/// `T` must be the function pointer type matching the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> TunResult<T> {
    // SAFETY: forwarded to the caller.
    let sym = unsafe { library.get::<T>(name) }.map_err(|e| {
        TunError::LibraryLoad(format!(
            "{}: {e}",
            String::from_utf8_lossy(&name[..name.len().saturating_sub(1)])
        ))
    })?;
    Ok(*sym)
}

/// Driver or event handle. Wintun handles may be used from any thread.
#[derive(Clone, Copy)]
struct RawHandle(*mut c_void);

// SAFETY: Wintun adapter, session and event handles are thread-safe.
unsafe impl Send for RawHandle {}
// SAFETY: see above.
unsafe impl Sync for RawHandle {}

impl RawHandle {
    fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// What woke a reader waiting on the read and shutdown events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Readable,
    Shutdown,
    Elapsed,
}

/// Classify a `WaitForMultipleObjects` result over `[read, shutdown]`.
fn classify_wait(outcome: u32) -> io::Result<Wake> {
    match outcome {
        WAIT_OBJECT_0 => Ok(Wake::Readable),
        o if o == WAIT_OBJECT_0 + 1 => Ok(Wake::Shutdown),
        WAIT_TIMEOUT => Ok(Wake::Elapsed),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Manual-reset event, initially unsignalled, closed on drop.
struct ShutdownEvent(RawHandle);

impl ShutdownEvent {
    fn new() -> io::Result<Self> {
        // SAFETY: null attributes and name create an anonymous event.
        let handle = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(RawHandle(handle)))
    }

    fn signal(&self) {
        // SAFETY: the event is open until drop.
        if unsafe { SetEvent(self.0.0) } == 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "SetEvent failed");
        }
    }
}

impl Drop for ShutdownEvent {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreateEventW and is closed once.
        unsafe { CloseHandle(self.0.0) };
    }
}

/// Session handles used by the reader thread.
struct Ring {
    library: Arc<WintunLibrary>,
    session: RawHandle,
    read_event: RawHandle,
    shutdown_event: RawHandle,
}

impl Ring {
    /// One packet from the ring, waiting up to [`READ_WAIT_MS`] if it is empty.
    fn read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if let Some(n) = self.try_receive(buf)? {
            return Ok(Some(n));
        }
        let events = [self.read_event.0, self.shutdown_event.0];
        // SAFETY: both events stay open until the reader thread is joined.
        let outcome = unsafe { WaitForMultipleObjects(2, events.as_ptr(), 0, READ_WAIT_MS) };
        match classify_wait(outcome)? {
            Wake::Readable => self.try_receive(buf),
            Wake::Shutdown | Wake::Elapsed => Ok(None),
        }
    }

    fn try_receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut size = 0u32;
        // SAFETY: the session is ended only after the reader thread is joined.
        let packet = unsafe { (self.library.receive_packet)(self.session.0, &mut size) };
        if packet.is_null() {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_NO_MORE_ITEMS as i32) {
                return Ok(None);
            }
            return Err(err);
        }

        let n = (size as usize).min(buf.len());
        // SAFETY: Wintun guarantees `size` readable bytes at `packet` until released.
        unsafe {
            std::ptr::copy_nonoverlapping(packet, buf.as_mut_ptr(), n);
            (self.library.release_receive_packet)(self.session.0, packet);
        }
        Ok(Some(n))
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A Wintun adapter with a running session.
pub struct WintunInterface {
    library: Arc<WintunLibrary>,
    adapter: RawHandle,
    session: RawHandle,
    /// `true` while the session may be used; writers hold a read guard.
    live: RwLock<bool>,
    reader: PacketPump,
    shutdown_event: ShutdownEvent,
    name: String,
    mtu: u16,
    closed: AtomicBool,
    routes: Mutex<RouteSet>,
}

impl WintunInterface {
    /// Create (or reopen) adapter `name` and start a session on it.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Create`] if the adapter or session cannot be started.
    pub fn create(library: Arc<WintunLibrary>, name: &str, mtu: u16) -> TunResult<Self> {
        let wide_name = wide(name);
        let tunnel_type = wide(TUNNEL_TYPE);

        // SAFETY: pointers are NUL-terminated UTF-16 buffers alive for the call.
        let mut adapter = RawHandle(unsafe {
            (library.create_adapter)(wide_name.as_ptr(), tunnel_type.as_ptr(), &ADAPTER_GUID)
        });
        if adapter.is_null() {
            // SAFETY: as above.
            adapter = RawHandle(unsafe { (library.open_adapter)(wide_name.as_ptr()) });
        }
        if adapter.is_null() {
            return Err(TunError::Create(format!(
                "WintunCreateAdapter failed: {}",
                io::Error::last_os_error()
            )));
        }

        // SAFETY: adapter is a live handle.
        let session = RawHandle(unsafe { (library.start_session)(adapter.0, RING_CAPACITY) });
        if session.is_null() {
            let err = io::Error::last_os_error();
            // SAFETY: adapter is live and not used afterwards.
            unsafe { (library.close_adapter)(adapter.0) };
            return Err(TunError::Create(format!("WintunStartSession failed: {err}")));
        }

        let end = |err: io::Error| {
            // SAFETY: handles are live and not used afterwards.
            unsafe {
                (library.end_session)(session.0);
                (library.close_adapter)(adapter.0);
            }
            TunError::Create(err.to_string())
        };

        // SAFETY: session is a live handle.
        let read_event = RawHandle(unsafe { (library.get_read_wait_event)(session.0) });
        let shutdown_event = ShutdownEvent::new().map_err(end)?;
        let ring = Ring {
            library: Arc::clone(&library),
            session,
            read_event,
            shutdown_event: shutdown_event.0,
        };
        let reader = match PacketPump::spawn(name, MAX_PACKET_SIZE, move |buf| ring.read(buf)) {
            Ok(reader) => reader,
            Err(e) => {
                drop(shutdown_event);
                return Err(end(io::Error::other(e)));
            }
        };

        tracing::info!(name, mtu, "created Wintun adapter");

        Ok(Self {
            library,
            adapter,
            session,
            live: RwLock::new(true),
            reader,
            shutdown_event,
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

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader.shutdown();
        self.shutdown_event.signal();
        self.reader.join();

        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        *live = false;
        // SAFETY: the reader thread has exited and no write holds the guard,
        // so nothing else uses the session or adapter.
        unsafe {
            (self.library.end_session)(self.session.0);
            (self.library.close_adapter)(self.adapter.0);
        }
        tracing::info!(name = %self.name, "Wintun adapter closed");
    }
}

#[async_trait]
impl VirtualInterface for WintunInterface {
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
        if packet.is_empty() {
            return Ok(0);
        }
        let len = u32::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large"))?;

        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return Err(TunError::Closed);
        }
        // SAFETY: the session is not ended while `live` is held.
        let slot = unsafe { (self.library.allocate_send_packet)(self.session.0, len) };
        if slot.is_null() {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: the slot holds `len` writable bytes until it is sent.
        unsafe {
            std::ptr::copy_nonoverlapping(packet.as_ptr(), slot, packet.len());
            (self.library.send_packet)(self.session.0, slot);
        }
        Ok(packet.len())
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
        self.shutdown();
        Ok(())
    }
}

impl Drop for WintunInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_wait() {
        assert_eq!(classify_wait(WAIT_OBJECT_0).unwrap(), Wake::Readable);
        assert_eq!(classify_wait(WAIT_OBJECT_0 + 1).unwrap(), Wake::Shutdown);
        assert_eq!(classify_wait(WAIT_TIMEOUT).unwrap(), Wake::Elapsed);
        assert!(classify_wait(0xFFFF_FFFF).is_err());
    }

    #[test]
    fn test_shutdown_event_wakes_waiter() {
        let event = ShutdownEvent::new().unwrap();
        let handles = [event.0.0];
        // SAFETY: the event is open for the duration of both waits.
        let before = unsafe { WaitForMultipleObjects(1, handles.as_ptr(), 0, 0) };
        assert_eq!(before, WAIT_TIMEOUT);

        event.signal();
        // SAFETY: as above.
        let after = unsafe { WaitForMultipleObjects(1, handles.as_ptr(), 0, 0) };
        assert_eq!(after, WAIT_OBJECT_0);
    }
}
