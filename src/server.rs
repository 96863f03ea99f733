use crate::config::Config;
use crate::context::Context;
use crate::error::Status;
use crate::protocol::{FrameReader, FrameWriter, Message};
use crate::service::SpeedTestService;
use crate::stream::{StreamReader, StreamWriter};
use crate::Result;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Speed-test server.
///
/// The `Server` accepts TCP connections and serves one call per connection:
/// ping, server discovery, client IP detection, download or upload. Every
/// connection runs on its own task with a context derived from the
/// shutdown token, so cancelling that token winds all calls down.
///
/// # Examples
///
/// ```no_run
/// use rspeed::{Config, Server};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default().with_listen_addr("0.0.0.0:8080");
/// let server = Server::new(config)?;
///
/// let shutdown = CancellationToken::new();
/// server.run(shutdown).await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    service: SpeedTestService,
}

impl Server {
    /// Creates a server with the default capabilities for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_service(SpeedTestService::from_config(config)?))
    }

    /// Creates a server around an already wired service.
    pub fn with_service(service: SpeedTestService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &SpeedTestService {
        &self.service
    }

    /// Binds the configured listen address and serves until `shutdown` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listen_addr = &self.service.config().listen_addr;
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serves connections from `listener` until `shutdown` is cancelled,
    /// then waits up to the configured grace period for in-flight calls.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let root = Context::from_token(shutdown.clone());
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        let service = self.service.clone();
                        let ctx = root.child();

                        tracker.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, service, ctx).await {
                                error!("Error handling client {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        info!("Shutting down, {} call(s) in flight", tracker.len());

        let grace = self.service.config().shutdown_grace;
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                "{} call(s) still running after {:?} grace period",
                tracker.len(),
                grace
            );
        }
        info!("Server stopped");
        Ok(())
    }
}

fn call_context(ctx: Context, timeout_ms: Option<u64>) -> Context {
    match timeout_ms {
        Some(ms) => ctx.with_timeout(Duration::from_millis(ms)),
        None => ctx,
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: SpeedTestService,
    ctx: Context,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let request = tokio::select! {
        request = reader.read_message() => request?,
        _ = ctx.done() => return Ok(()),
    };
    debug!("{} request from {}", request.name(), addr);

    match request {
        Message::Ping {
            client_timestamp_unix_nano,
        } => {
            let (client_ts, server_ts) = service.ping(client_timestamp_unix_nano);
            writer
                .write_message(&Message::Pong {
                    client_timestamp_unix_nano: client_ts,
                    server_timestamp_unix_nano: server_ts,
                    version: crate::protocol::PROTOCOL_VERSION,
                })
                .await?;
        }

        Message::GetServers { limit } => {
            let reply = match service.get_servers(limit).await {
                Ok(servers) => Message::Servers { servers },
                Err(status) => Message::status(&status),
            };
            writer.write_message(&reply).await?;
        }

        Message::GetClientIp { metadata } => {
            let reply = match service.get_client_ip(Some(addr), &metadata).await {
                Ok(location) => Message::ClientIp {
                    client_ip: location.ip,
                    city: location.city,
                    country: location.country,
                },
                Err(status) => Message::status(&status),
            };
            writer.write_message(&reply).await?;
        }

        Message::Download {
            chunk_size_hint_bytes,
            timeout_ms,
        } => {
            let ctx = call_context(ctx, timeout_ms);
            serve_download(&service, &ctx, addr, chunk_size_hint_bytes, &mut writer).await;
        }

        Message::Upload { timeout_ms } => {
            let ctx = call_context(ctx, timeout_ms);
            serve_upload(&service, &ctx, addr, &mut reader, &mut writer).await?;
        }

        other => {
            let status = Status::invalid_argument(format!("{} is not a request", other.name()));
            writer.write_message(&Message::status(&status)).await?;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Error closing connection to {}: {}", addr, e);
    }
    Ok(())
}

async fn serve_download(
    service: &SpeedTestService,
    ctx: &Context,
    addr: SocketAddr,
    chunk_size_hint: Option<i64>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) {
    let result = {
        let mut sink = StreamWriter::new(&mut *writer);
        service.download(ctx, chunk_size_hint, &mut sink).await
    };

    // A download only ever ends with a status.
    if let Err(status) = result {
        if status.is_cancellation() {
            info!("Download for {} ended: {}", addr, status);
        } else {
            error!("Download for {} failed: {}", addr, status);
        }
        // The client may already be gone.
        if let Err(e) = writer.write_message(&Message::status(&status)).await {
            debug!("Could not report download status to {}: {}", addr, e);
        }
    }
}

async fn serve_upload(
    service: &SpeedTestService,
    ctx: &Context,
    addr: SocketAddr,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<()> {
    let result = {
        let mut source = StreamReader::new(&mut *reader);
        service.upload(ctx, &mut source).await
    };

    match result {
        Ok(bytes_received) => {
            writer
                .write_message(&Message::upload_result(bytes_received))
                .await?;
        }
        Err(failure) => {
            // Report progress first, best effort.
            if let Err(e) = writer
                .write_message(&Message::upload_result(failure.bytes_received))
                .await
            {
                debug!("Could not report upload result to {}: {}", addr, e);
                return Ok(());
            }
            if let Err(e) = writer.write_message(&Message::status(&failure.status)).await {
                debug!("Could not report upload status to {}: {}", addr, e);
            }
        }
    }
    Ok(())
}
