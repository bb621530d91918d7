//! Outer record channel.
//!
//! The engine does not care what carries its records, only that delivery is
//! reliable and ordered. A record is one complete length-prefixed message,
//! `LEN(4, big-endian) || body`, exactly as produced by the sealer or the
//! handshake encoder.
//!
//! Two carriers are provided: [`Channel::from_stream`] over any
//! `AsyncRead + AsyncWrite` (TLS, TCP, an in-process duplex pipe) and
//! [`Channel::memory_pair`] over tokio mpsc queues.

use crate::frame::FRAME_HEADER_SIZE;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use yuki_crypto::LEN_PREFIX_SIZE;
use yuki_crypto::cipher::MIN_ENVELOPE_BODY;
use yuki_tun::MAX_PACKET_SIZE;

/// Largest record body accepted from a stream: one sealed maximum-size frame.
pub const MAX_RECORD_BODY: usize = MIN_ENVELOPE_BODY + FRAME_HEADER_SIZE + MAX_PACKET_SIZE;

/// Receiving side of a record channel.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, or `None` when the peer closed cleanly.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Sending side of a record channel.
#[async_trait]
pub trait RecordSink: Send {
    /// Send one complete record.
    async fn send(&mut self, record: Vec<u8>) -> io::Result<()>;

    /// Signal that no more records will be sent.
    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Prefix `body` with its big-endian length.
///
/// # Errors
///
/// Returns `InvalidInput` if the body does not fit the length field.
pub fn encode_record(body: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
    let mut record = Vec::with_capacity(LEN_PREFIX_SIZE + body.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(body);
    Ok(record)
}

/// Body of a record produced by [`encode_record`].
///
/// # Errors
///
/// Returns `InvalidData` if the prefix is missing or disagrees with the body.
pub fn record_body(record: &[u8]) -> io::Result<&[u8]> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "malformed record");
    let prefix = record.get(..LEN_PREFIX_SIZE).ok_or_else(invalid)?;
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    record
        .get(LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len)
        .ok_or_else(invalid)
}

/// A bidirectional record channel.
pub struct Channel {
    /// Inbound records
    pub source: Box<dyn RecordSource>,
    /// Outbound records
    pub sink: Box<dyn RecordSink>,
}

impl Channel {
    /// Bundle a source and a sink.
    pub fn new(source: impl RecordSource + 'static, sink: impl RecordSink + 'static) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
        }
    }

    /// Length-delimited records over a byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with_limit(stream, MAX_RECORD_BODY)
    }

    /// Like [`Channel::from_stream`] with an explicit maximum body size.
    pub fn from_stream_with_limit<S>(stream: S, max_body: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            StreamSource {
                reader,
                max_body,
            },
            StreamSink { writer },
        )
    }

    /// Two connected in-memory channels.
    #[must_use]
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self::new(MemorySource { rx: b_rx }, MemorySink { tx: Some(a_tx) }),
            Self::new(MemorySource { rx: a_rx }, MemorySink { tx: Some(b_tx) }),
        )
    }

    /// Split into source and sink.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn RecordSource>, Box<dyn RecordSink>) {
        (self.source, self.sink)
    }
}

/// Record source over the read half of a stream.
pub struct StreamSource<S> {
    reader: ReadHalf<S>,
    max_body: usize,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> RecordSource for StreamSource<S> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LEN_PREFIX_SIZE {
            match self.reader.read(&mut prefix[filled..]).await? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream closed after {filled} bytes of a record prefix"),
                    ));
                }
                n => filled += n,
            }
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_body {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record of {len} bytes exceeds limit of {}", self.max_body),
            ));
        }

        let mut record = vec![0u8; LEN_PREFIX_SIZE + len];
        record[..LEN_PREFIX_SIZE].copy_from_slice(&prefix);
        self.reader.read_exact(&mut record[LEN_PREFIX_SIZE..]).await?;
        Ok(Some(record))
    }
}

/// Record sink over the write half of a stream.
pub struct StreamSink<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> RecordSink for StreamSink<S> {
    async fn send(&mut self, record: Vec<u8>) -> io::Result<()> {
        self.writer.write_all(&record).await?;
        self.writer.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct MemorySource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&mut self, record: Vec<u8>) -> io::Result<()> {
        let tx = self.tx.as_ref().ok_or(io::ErrorKind::BrokenPipe)?;
        tx.send(record)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}
