use crate::discovery::{ClientLocation, ServerInfo};
use crate::error::{Code, Status};
use crate::pattern::PatternBuffer;
use crate::protocol::{unix_nanos_now, Frame, FrameReader, FrameWriter, Message};
use crate::{Error, Result};
use log::{debug, info};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra time a download waits for the server to close the stream after
/// the requested duration.
const DOWNLOAD_SLACK: Duration = Duration::from_secs(5);

/// Outcome of a download or upload measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    /// Payload bytes transferred. For uploads this is the count the server
    /// acknowledged.
    pub bytes: u64,
    pub duration: Duration,
}

impl TransferReport {
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 * 8.0) / secs
        } else {
            0.0
        }
    }

    pub fn megabits_per_second(&self) -> f64 {
        self.bits_per_second() / 1_000_000.0
    }
}

/// Speed-test client.
///
/// Each call opens its own connection to the server, mirroring the
/// one-call-per-connection protocol.
///
/// # Examples
///
/// ```no_run
/// use rspeed::Client;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new("127.0.0.1:8080");
///
/// let rtt = client.ping().await?;
/// println!("RTT: {:?}", rtt);
///
/// let report = client.download(None, Duration::from_secs(10)).await?;
/// println!("Download: {:.2} Mbps", report.megabits_per_second());
/// # Ok(())
/// # }
/// ```
pub struct Client {
    addr: String,
    cancellation_token: CancellationToken,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it stops a running download or upload early; the report
    /// then covers the data moved so far.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    async fn connect(&self) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok((FrameReader::new(read_half), FrameWriter::new(write_half)))
    }

    /// Sends one request and reads one reply.
    async fn call(&self, request: &Message) -> Result<Message> {
        let (mut reader, mut writer) = self.connect().await?;
        writer.write_message(request).await?;
        match reader.read_message().await? {
            Message::Status { code, message } => Err(Status::new(code, message).into()),
            reply => Ok(reply),
        }
    }

    /// Measures the round-trip time of a `Ping`.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let sent_ts = unix_nanos_now();
        match self.call(&Message::ping(sent_ts)).await? {
            Message::Pong {
                client_timestamp_unix_nano,
                ..
            } if client_timestamp_unix_nano == sent_ts => Ok(started.elapsed()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_servers(&self, limit: i32) -> Result<Vec<ServerInfo>> {
        match self.call(&Message::get_servers(limit)).await? {
            Message::Servers { servers } => Ok(servers),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_client_ip(&self) -> Result<ClientLocation> {
        match self.call(&Message::get_client_ip()).await? {
            Message::ClientIp {
                client_ip,
                city,
                country,
            } => Ok(ClientLocation {
                ip: client_ip,
                city,
                country,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Downloads for `duration`.
    ///
    /// The duration is sent as the call's deadline, so the server ends the
    /// stream itself; a `DeadlineExceeded` status is the normal finish.
    pub async fn download(
        &self,
        chunk_size_hint: Option<i64>,
        duration: Duration,
    ) -> Result<TransferReport> {
        let (mut reader, mut writer) = self.connect().await?;
        writer
            .write_message(&Message::download(
                chunk_size_hint,
                Some(duration.as_millis() as u64),
            ))
            .await?;

        let start = Instant::now();
        let give_up = start + duration + DOWNLOAD_SLACK;
        let mut bytes = 0u64;

        loop {
            let frame = tokio::select! {
                frame = reader.read_frame() => frame?,
                _ = tokio::time::sleep_until(give_up) => break,
                _ = self.cancellation_token.cancelled() => {
                    info!("Download cancelled by user");
                    break;
                }
            };

            match frame {
                Some(Frame::Data(data)) => bytes += data.len() as u64,
                Some(Frame::Message(Message::Status { code, message })) => {
                    if code == Code::DeadlineExceeded {
                        break;
                    }
                    return Err(Status::new(code, message).into());
                }
                Some(Frame::Message(other)) => return Err(unexpected(&other)),
                None => break,
            }
        }

        let report = TransferReport {
            bytes,
            duration: start.elapsed(),
        };
        debug!("Download finished: {:?}", report);
        Ok(report)
    }

    /// Uploads chunks of `chunk_size` bytes for `duration`, then reports
    /// how many bytes the server received.
    pub async fn upload(&self, chunk_size: usize, duration: Duration) -> Result<TransferReport> {
        let payload = PatternBuffer::generate(chunk_size)?;
        let (mut reader, mut writer) = self.connect().await?;
        writer.write_message(&Message::upload(None)).await?;

        let start = Instant::now();
        let mut bytes_sent = 0u64;
        while start.elapsed() < duration {
            if self.cancellation_token.is_cancelled() {
                info!("Upload cancelled by user");
                break;
            }
            // The server may end the call early; its reply is still readable.
            if let Err(e) = writer.write_data(payload.as_bytes()).await {
                debug!("Server stopped accepting upload data: {}", e);
                break;
            }
            bytes_sent += chunk_size as u64;
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Error closing upload stream: {}", e);
        }
        let elapsed = start.elapsed();

        let bytes_received = match reader.read_message().await? {
            Message::UploadResult { bytes_received } => bytes_received,
            Message::Status { code, message } => return Err(Status::new(code, message).into()),
            other => return Err(unexpected(&other)),
        };

        // A failed upload is followed by its status. A cancelled call still
        // measured something, so only real failures are errors.
        if let Ok(Some(Frame::Message(Message::Status { code, message }))) =
            reader.read_frame().await
        {
            let status = Status::new(code, message);
            if !status.is_cancellation() {
                return Err(status.into());
            }
            info!("Upload ended by server: {}", status);
        }

        debug!(
            "Upload finished: sent {} bytes, server received {}",
            bytes_sent, bytes_received
        );
        Ok(TransferReport {
            bytes: bytes_received,
            duration: elapsed,
        })
    }
}

fn unexpected(msg: &Message) -> Error {
    Error::Protocol(format!("unexpected {} reply", msg.name()))
}
