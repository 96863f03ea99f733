//! Call dispatch: binds the configuration to the injected capabilities.

use crate::config::Config;
use crate::context::Context;
use crate::discovery::{
    ClientLocation, DefaultIpDetector, IpDetector, ServerInfo, ServerProvider,
    SimpleServerProvider,
};
use crate::download::{effective_chunk_size, DefaultDownloadStreamer, DownloadStreamer};
use crate::error::{Code, Status};
use crate::pattern::PatternBuffer;
use crate::protocol::unix_nanos_now;
use crate::stream::{ByteSink, ByteSource};
use crate::upload::{DefaultUploadHandler, UploadFailure, UploadHandler};
use crate::Result;
use log::{error, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// The speed-test service, independent of any transport.
///
/// # Examples
///
/// ```
/// use rspeed::{Config, SpeedTestService};
///
/// let service = SpeedTestService::from_config(Config::default()).unwrap();
/// assert_eq!(service.config().chunk_size, 65536);
/// ```
#[derive(Clone)]
pub struct SpeedTestService {
    config: Arc<Config>,
    server_provider: Arc<dyn ServerProvider>,
    downloader: Arc<dyn DownloadStreamer>,
    uploader: Arc<dyn UploadHandler>,
    ip_detector: Arc<dyn IpDetector>,
}

impl SpeedTestService {
    pub fn new(
        config: Config,
        server_provider: Arc<dyn ServerProvider>,
        downloader: Arc<dyn DownloadStreamer>,
        uploader: Arc<dyn UploadHandler>,
        ip_detector: Arc<dyn IpDetector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            server_provider,
            downloader,
            uploader,
            ip_detector,
        }
    }

    /// Wires the default capabilities. The download pattern is generated
    /// here, once, with the configured chunk size as its length.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let pattern = PatternBuffer::generate(config.chunk_size)?;
        let server_provider = Arc::new(SimpleServerProvider::new(&config));
        let downloader = Arc::new(DefaultDownloadStreamer::new(pattern, config.chunk_size));
        Ok(Self::new(
            config,
            server_provider,
            downloader,
            Arc::new(DefaultUploadHandler::new()),
            Arc::new(DefaultIpDetector::new()),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn get_servers(&self, limit: i32) -> std::result::Result<Vec<ServerInfo>, Status> {
        info!("Received GetServers request. Limit: {}", limit);
        self.server_provider.get_servers(limit).await.map_err(|e| {
            error!("Error from server provider: {}", e);
            Status::new(Code::Internal, format!("failed to get servers: {}", e))
        })
    }

    /// Echoes the client timestamp with the server's clock, both in Unix
    /// nanoseconds.
    pub fn ping(&self, client_timestamp_unix_nano: i64) -> (i64, i64) {
        info!(
            "Received Ping request from client timestamp: {}",
            client_timestamp_unix_nano
        );
        (client_timestamp_unix_nano, unix_nanos_now())
    }

    pub async fn get_client_ip(
        &self,
        peer: Option<SocketAddr>,
        metadata: &HashMap<String, String>,
    ) -> std::result::Result<ClientLocation, Status> {
        info!("Received GetClientIp request");
        self.ip_detector
            .detect_client_ip(peer, metadata)
            .await
            .map_err(|e| {
                error!("Error from IP detector: {}", e);
                Status::new(Code::Internal, format!("failed to detect client IP: {}", e))
            })
    }

    /// Runs a download into `sink`. The chunk size hint is honoured only
    /// when `0 < hint < 1 MiB`.
    pub async fn download(
        &self,
        ctx: &Context,
        chunk_size_hint: Option<i64>,
        sink: &mut dyn ByteSink,
    ) -> std::result::Result<(), Status> {
        info!("Received Download request. Chunk size hint: {:?}", chunk_size_hint);
        let chunk_size = effective_chunk_size(chunk_size_hint, self.config.chunk_size);
        self.downloader.stream_download(ctx, sink, chunk_size).await
    }

    /// Runs an upload from `source`, returning the byte count either way.
    pub async fn upload(
        &self,
        ctx: &Context,
        source: &mut dyn ByteSource,
    ) -> std::result::Result<u64, UploadFailure> {
        info!("Received Upload stream request");
        let result = self.uploader.handle_upload(ctx, source).await;
        match &result {
            Ok(bytes) => info!("Upload stream finished. Total bytes received: {}", bytes),
            Err(failure) => error!("Error from upload handler: {}", failure),
        }
        result
    }
}
