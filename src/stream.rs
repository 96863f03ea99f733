//! Adapters between message-oriented stream endpoints and byte I/O.
//!
//! A call's network endpoint moves whole messages ([`FrameSink`] /
//! [`FrameSource`]). The streaming loops want plain byte semantics
//! ([`ByteSink`] / [`ByteSource`]). [`StreamWriter`] and [`StreamReader`]
//! bridge the two. Message boundaries and caller read sizes are independent:
//! the reader keeps whatever part of a message the caller has not consumed
//! yet and serves it before touching the endpoint again.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::io;

/// Outbound half of a stream endpoint. Each call transmits one message.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends `frame` as a single message, returning once the transport has
    /// accepted it.
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Inbound half of a stream endpoint.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next message. `Ok(None)` marks a clean end of stream.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Destination of download chunks.
#[async_trait]
pub trait ByteSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// Origin of upload bytes.
#[async_trait]
pub trait ByteSource: Send {
    /// Copies up to `buf.len()` bytes into `buf`. `Ok(0)` with a non-empty
    /// `buf` means the stream has ended.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).send(frame).await
    }
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        (**self).recv().await
    }
}

/// Byte sink writing every chunk as one message on an endpoint.
pub struct StreamWriter<E> {
    endpoint: E,
}

impl<E: FrameSink> StreamWriter<E> {
    pub fn new(endpoint: E) -> Self {
        Self { endpoint }
    }

    pub fn into_inner(self) -> E {
        self.endpoint
    }
}

#[async_trait]
impl<E: FrameSink> ByteSink for StreamWriter<E> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.endpoint.send(chunk).await
    }
}

/// Bytes received from the endpoint but not yet handed to the caller.
#[derive(Debug, Default)]
enum Leftover {
    #[default]
    Empty,
    Holding(Bytes),
}

/// Byte source reading messages from an endpoint.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use rspeed::stream::{memory, ByteSource, StreamReader};
///
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// let (mut tx, rx) = memory::channel(4);
/// tx.push(Bytes::from_static(b"ab")).await?;
/// tx.push(Bytes::from_static(b"cde")).await?;
/// drop(tx);
///
/// let mut reader = StreamReader::new(rx);
/// let mut out = Vec::new();
/// let mut buf = [0u8; 1];
/// while reader.read(&mut buf).await? > 0 {
///     out.push(buf[0]);
/// }
/// assert_eq!(out, b"abcde");
/// # Ok(())
/// # }
/// ```
pub struct StreamReader<E> {
    endpoint: E,
    leftover: Leftover,
}

impl<E: FrameSource> StreamReader<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            leftover: Leftover::Empty,
        }
    }

    /// Number of received bytes still waiting to be read.
    pub fn buffered(&self) -> usize {
        match &self.leftover {
            Leftover::Empty => 0,
            Leftover::Holding(rest) => rest.len(),
        }
    }

    pub fn into_inner(self) -> E {
        self.endpoint
    }
}

/// Copies the front of `data` into `buf`, returning the count and whatever
/// did not fit.
fn split_into(buf: &mut [u8], mut data: Bytes) -> (usize, Leftover) {
    let n = buf.len().min(data.len());
    buf[..n].copy_from_slice(&data[..n]);
    data.advance(n);
    let rest = if data.is_empty() {
        Leftover::Empty
    } else {
        Leftover::Holding(data)
    };
    (n, rest)
}

#[async_trait]
impl<E: FrameSource> ByteSource for StreamReader<E> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Leftover::Holding(rest) = std::mem::take(&mut self.leftover) {
            let (n, rest) = split_into(buf, rest);
            self.leftover = rest;
            return Ok(n);
        }

        loop {
            match self.endpoint.recv().await? {
                // Empty messages carry nothing; Ok(0) is reserved for end of stream.
                Some(data) if data.is_empty() => continue,
                Some(data) => {
                    let (n, rest) = split_into(buf, data);
                    self.leftover = rest;
                    return Ok(n);
                }
                None => return Ok(0),
            }
        }
    }
}

/// In-memory stream endpoints backed by a bounded channel.
///
/// The bounded capacity gives the same back-pressure a transport would:
/// sends wait while the channel is full.
pub mod memory {
    use super::{FrameSink, FrameSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use tokio::sync::mpsc;

    /// Creates a connected sender/receiver pair holding up to `capacity`
    /// undelivered messages.
    pub fn channel(capacity: usize) -> (MemorySink, MemorySource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (MemorySink { tx }, MemorySource { rx })
    }

    /// Sending side. Dropping every sender ends the stream cleanly.
    #[derive(Clone)]
    pub struct MemorySink {
        tx: mpsc::Sender<io::Result<Bytes>>,
    }

    impl MemorySink {
        /// Sends an owned message without copying it.
        pub async fn push(&mut self, frame: Bytes) -> io::Result<()> {
            self.tx.send(Ok(frame)).await.map_err(|_| closed())
        }

        /// Delivers a transport error to the receiver in place of a message.
        pub async fn fail(&mut self, err: io::Error) -> io::Result<()> {
            self.tx.send(Err(err)).await.map_err(|_| closed())
        }
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "stream already closed")
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.push(Bytes::copy_from_slice(frame)).await
        }
    }

    /// Receiving side. Dropping it makes further sends fail with `BrokenPipe`.
    pub struct MemorySource {
        rx: mpsc::Receiver<io::Result<Bytes>>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> io::Result<Option<Bytes>> {
            self.rx.recv().await.transpose()
        }
    }
}
