use crate::discovery::ServerInfo;
use crate::error::{Code, Status};
use crate::stream::{FrameSink, FrameSource};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Current protocol version, reported by `Pong`.
///
/// If the wire format changes in a breaking way, this version should be
/// incremented.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame kind carrying a JSON-encoded [`Message`].
pub const FRAME_MESSAGE: u8 = 0x01;

/// Frame kind carrying raw payload bytes.
pub const FRAME_DATA: u8 = 0x02;

/// Size of the fixed frame header: kind (1) + payload length (4).
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload a peer may announce. Larger frames are rejected before
/// anything is allocated for them.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Control messages exchanged between client and server.
///
/// Each connection carries exactly one call. The client opens it with a
/// request message; the server answers according to the call type.
///
/// # Call Flow
///
/// - `Ping` → `Pong`
/// - `GetServers` → `Servers`
/// - `GetClientIp` → `ClientIp`
/// - `Download` → data frames until the client disconnects or the call is
///   cancelled, optionally followed by `Status`
/// - `Upload` → the client sends data frames and half-closes; the server
///   replies `UploadResult`, followed by `Status` if the upload failed
///
/// # Examples
///
/// ```
/// use rspeed::protocol::{serialize_message, Message};
///
/// let msg = Message::download(Some(32 * 1024), None);
/// let bytes = serialize_message(&msg).unwrap();
/// assert_eq!(bytes[0], rspeed::protocol::FRAME_MESSAGE);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Latency probe carrying the client's clock
    Ping { client_timestamp_unix_nano: i64 },

    /// Reply to `Ping`
    Pong {
        client_timestamp_unix_nano: i64,
        server_timestamp_unix_nano: i64,
        version: u32,
    },

    /// Asks for up to `limit` test servers (`limit <= 0` means no limit)
    GetServers { limit: i32 },

    /// Reply to `GetServers`
    Servers { servers: Vec<ServerInfo> },

    /// Asks for the address the server sees for this client
    GetClientIp {
        #[serde(default)]
        metadata: HashMap<String, String>,
    },

    /// Reply to `GetClientIp`
    ClientIp {
        client_ip: String,
        city: String,
        country: String,
    },

    /// Starts a download stream
    Download {
        chunk_size_hint_bytes: Option<i64>,
        timeout_ms: Option<u64>,
    },

    /// Starts an upload stream
    Upload { timeout_ms: Option<u64> },

    /// Bytes the server received during an upload
    UploadResult { bytes_received: u64 },

    /// Terminal status of a failed call
    Status { code: Code, message: String },
}

impl Message {
    pub fn ping(client_timestamp_unix_nano: i64) -> Self {
        Message::Ping {
            client_timestamp_unix_nano,
        }
    }

    pub fn get_servers(limit: i32) -> Self {
        Message::GetServers { limit }
    }

    pub fn get_client_ip() -> Self {
        Message::GetClientIp {
            metadata: HashMap::new(),
        }
    }

    pub fn download(chunk_size_hint_bytes: Option<i64>, timeout_ms: Option<u64>) -> Self {
        Message::Download {
            chunk_size_hint_bytes,
            timeout_ms,
        }
    }

    pub fn upload(timeout_ms: Option<u64>) -> Self {
        Message::Upload { timeout_ms }
    }

    pub fn upload_result(bytes_received: u64) -> Self {
        Message::UploadResult { bytes_received }
    }

    pub fn status(status: &Status) -> Self {
        Message::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }

    /// Human readable call name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
            Message::GetServers { .. } => "GetServers",
            Message::Servers { .. } => "Servers",
            Message::GetClientIp { .. } => "GetClientIp",
            Message::ClientIp { .. } => "ClientIp",
            Message::Download { .. } => "Download",
            Message::Upload { .. } => "Upload",
            Message::UploadResult { .. } => "UploadResult",
            Message::Status { .. } => "Status",
        }
    }
}

/// Current wall-clock time in Unix nanoseconds, as carried by `Ping`/`Pong`.
pub fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Data(Bytes),
}

fn frame_header(kind: u8, len: usize) -> io::Result<[u8; FRAME_HEADER_LEN]> {
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = kind;
    header[1..].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(header)
}

/// Serializes a control message into a complete frame.
///
/// The frame layout is:
/// - 1 byte: frame kind ([`FRAME_MESSAGE`])
/// - 4 bytes: payload length as big-endian u32
/// - payload: UTF-8 encoded JSON
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let header = frame_header(FRAME_MESSAGE, json.len())?;
    let mut result = Vec::with_capacity(FRAME_HEADER_LEN + json.len());
    result.extend_from_slice(&header);
    result.extend_from_slice(&json);
    Ok(result)
}

/// Writes frames to an async writer.
pub struct FrameWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes one control message and flushes it.
    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let frame = serialize_message(msg)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes one data frame and flushes it, so the call only returns once
    /// the transport has taken the bytes.
    pub async fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        let header = frame_header(FRAME_DATA, data.len())?;
        self.writer.write_all(&header).await?;
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Flushes and closes the write direction, signalling end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FrameWriter<W> {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_data(frame).await
    }
}

/// Reads frames from an async reader.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next raw frame. `Ok(None)` means the peer closed the
    /// stream on a frame boundary; EOF anywhere else is `UnexpectedEof`.
    async fn read_raw(&mut self) -> io::Result<Option<(u8, Bytes)>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }

        let kind = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
            ));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some((kind, Bytes::from(payload))))
    }

    /// Reads and decodes the next frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.read_raw().await? {
            None => Ok(None),
            Some((FRAME_MESSAGE, payload)) => Ok(Some(Frame::Message(serde_json::from_slice(
                &payload,
            )?))),
            Some((FRAME_DATA, payload)) => Ok(Some(Frame::Data(payload))),
            Some((kind, _)) => Err(Error::Protocol(format!("unknown frame kind 0x{:02x}", kind))),
        }
    }

    /// Reads the next frame, which must be a control message.
    pub async fn read_message(&mut self) -> Result<Message> {
        match self.read_frame().await? {
            Some(Frame::Message(msg)) => Ok(msg),
            Some(Frame::Data(_)) => Err(Error::Protocol(
                "expected a control message, got a data frame".to_string(),
            )),
            None => Err(Error::Protocol(
                "connection closed before a control message arrived".to_string(),
            )),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FrameReader<R> {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self.read_raw().await? {
            None => Ok(None),
            Some((FRAME_DATA, payload)) => Ok(Some(payload)),
            Some((kind, _)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected frame kind 0x{:02x} in data stream", kind),
            )),
        }
    }
}
