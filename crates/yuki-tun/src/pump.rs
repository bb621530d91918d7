//! Blocking device reads moved onto a dedicated thread.
//!
//! Some drivers only offer blocking reads. A [`PacketPump`] owns one named
//! reader thread per device. The thread pushes each packet into a bounded
//! queue and [`PacketPump::recv`] awaits that queue, so a caller that gives
//! up on a `recv` (a poll timeout, a `select!` losing branch) strands neither
//! a read nor a packet: the next `recv` picks up where it left off.
//!
//! The reader closure returns `Ok(Some(n))` for a packet of `n` bytes in the
//! buffer, `Ok(None)` when its own wait elapsed with nothing to report, and an
//! error to end the thread. Shutdown is cooperative: [`PacketPump::shutdown`]
//! raises a flag the thread checks between reads, and the backend must make
//! a blocked read return (signal an event, cancel the I/O).
//! [`PacketPump::join`] then waits until no read can be in flight.

use crate::{TunError, TunResult};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Packets buffered between the reader thread and the consumer.
pub const PUMP_QUEUE: usize = 256;

/// Pause before retrying a full queue.
const QUEUE_BACKOFF: Duration = Duration::from_millis(1);

type Item = io::Result<Vec<u8>>;

/// A reader thread feeding an async packet queue.
pub struct PacketPump {
    rx: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PacketPump {
    /// Start a thread named `<name>-reader` that calls `read` with a buffer of
    /// `buffer_size` bytes until shutdown or a read error.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Io`] if the thread cannot be spawned.
    pub fn spawn<R>(name: &str, buffer_size: usize, mut read: R) -> TunResult<Self>
    where
        R: FnMut(&mut [u8]) -> io::Result<Option<usize>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PUMP_QUEUE);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let label = name.to_string();

        let thread = thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || {
                let mut buf = vec![0u8; buffer_size];
                while !flag.load(Ordering::Acquire) {
                    match read(&mut buf) {
                        Ok(Some(n)) => {
                            if !forward(&tx, &flag, Ok(buf[..n].to_vec())) {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if !flag.load(Ordering::Acquire) {
                                tracing::warn!(iface = %label, error = %e, "device read failed");
                                forward(&tx, &flag, Err(e));
                            }
                            break;
                        }
                    }
                }
                tracing::debug!(iface = %label, "reader thread stopped");
            })?;

        Ok(Self {
            rx: tokio::sync::Mutex::new(rx),
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Next packet, copied into `buf` and truncated to its length.
    ///
    /// Cancel-safe: dropping the future before it completes loses nothing.
    ///
    /// # Errors
    ///
    /// Returns the read error that stopped the thread, then
    /// [`TunError::Closed`] once the thread has exited and the queue is empty.
    pub async fn recv(&self, buf: &mut [u8]) -> TunResult<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Ok(packet)) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(TunError::Closed),
        }
    }

    /// Ask the thread to stop after its current read.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether [`PacketPump::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Cancel the synchronous read the thread is blocked in, if any, so it
    /// can observe shutdown. A read started after this call is not affected.
    #[cfg(windows)]
    pub fn interrupt(&self) {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::System::IO::CancelSynchronousIo;

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = thread.as_ref() {
            // SAFETY: the thread handle stays open while its JoinHandle is held.
            if unsafe { CancelSynchronousIo(handle.as_raw_handle()) } == 0 {
                tracing::debug!(
                    error = %io::Error::last_os_error(),
                    "no blocked read to cancel"
                );
            }
        }
    }

    /// Wait for the thread to exit. Returns at once if it was already joined.
    ///
    /// Call [`PacketPump::shutdown`] and unblock the device read first.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("reader thread panicked");
            }
        }
    }
}

/// Queue `item`, backing off while the queue is full. Returns `false` if the
/// consumer is gone or shutdown was requested.
fn forward(tx: &mpsc::Sender<Item>, shutdown: &AtomicBool, mut item: Item) -> bool {
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(back)) => {
                if shutdown.load(Ordering::Acquire) {
                    return false;
                }
                item = back;
                thread::sleep(QUEUE_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    /// A device whose blocking read waits up to 5 ms for the next packet.
    fn device() -> (
        std_mpsc::Sender<Vec<u8>>,
        impl FnMut(&mut [u8]) -> io::Result<Option<usize>> + Send + 'static,
    ) {
        let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
        let read = move |buf: &mut [u8]| match rx.recv_timeout(Duration::from_millis(5)) {
            Ok(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(Some(packet.len()))
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        };
        (tx, read)
    }

    #[tokio::test]
    async fn test_abandoned_reads_lose_no_packets() {
        let (device, read) = device();
        let pump = PacketPump::spawn("tap-test", 2048, read).unwrap();
        let mut buf = [0u8; 2048];

        // Idle polling the way the relay does it
        for _ in 0..5 {
            let attempt = tokio::time::timeout(Duration::from_millis(10), pump.recv(&mut buf));
            assert!(attempt.await.is_err());
        }

        for i in 0..20u8 {
            device.send(vec![i; 40 + usize::from(i)]).unwrap();
        }
        for i in 0..20u8 {
            let n = pump.recv(&mut buf).await.unwrap();
            assert_eq!(n, 40 + usize::from(i));
            assert!(buf[..n].iter().all(|&b| b == i));
        }

        pump.shutdown();
        pump.join();
    }

    #[tokio::test]
    async fn test_backlog_beyond_queue_is_delivered_in_order() {
        let (device, read) = device();
        let pump = PacketPump::spawn("tap-test", 64, read).unwrap();
        let total = PUMP_QUEUE * 2;
        for i in 0..total {
            device.send((i as u32).to_be_bytes().to_vec()).unwrap();
        }

        let mut buf = [0u8; 64];
        for i in 0..total {
            let n = pump.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &(i as u32).to_be_bytes());
        }

        pump.shutdown();
        pump.join();
    }

    #[tokio::test]
    async fn test_read_error_then_closed() {
        let (device, read) = device();
        let pump = PacketPump::spawn("tap-test", 64, read).unwrap();
        device.send(vec![1, 2, 3]).unwrap();
        drop(device);

        let mut buf = [0u8; 64];
        assert_eq!(pump.recv(&mut buf).await.unwrap(), 3);
        assert!(matches!(pump.recv(&mut buf).await, Err(TunError::Io(_))));
        assert!(matches!(pump.recv(&mut buf).await, Err(TunError::Closed)));
        pump.join();
    }

    #[test]
    fn test_join_waits_for_read_in_flight() {
        let in_read = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicUsize::new(0));
        let (gauge, count) = (Arc::clone(&in_read), Arc::clone(&reads));

        let pump = PacketPump::spawn("wintun-test", 64, move |_buf| {
            gauge.fetch_add(1, Ordering::SeqCst);
            count.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            gauge.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

        while reads.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        pump.shutdown();
        assert!(pump.is_shut_down());
        pump.join();

        // Nothing is reading and nothing starts once join has returned
        assert_eq!(in_read.load(Ordering::SeqCst), 0);
        let settled = reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(reads.load(Ordering::SeqCst), settled);

        pump.join();
    }

    #[tokio::test]
    async fn test_shutdown_with_full_queue() {
        let pump = PacketPump::spawn("tap-test", 16, |buf: &mut [u8]| {
            buf[0] = 0x45;
            Ok(Some(1))
        })
        .unwrap();

        // Let the queue fill with nobody receiving
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.shutdown();
        pump.join();

        let mut buf = [0u8; 16];
        assert_eq!(pump.recv(&mut buf).await.unwrap(), 1);
    }
}
