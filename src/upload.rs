//! Upload handling: read everything the client sends and throw it away,
//! counting the bytes.

use crate::context::Context;
use crate::error::Status;
use crate::stream::ByteSource;
use async_trait::async_trait;
use log::{error, info};
use thiserror::Error;

/// Size of the scratch buffer uploads are drained through.
pub const DISCARD_BUFFER_SIZE: usize = 32 * 1024;

/// A failed upload, with the bytes received before the failure.
#[derive(Error, Debug)]
#[error("upload failed after {bytes_received} bytes: {status}")]
pub struct UploadFailure {
    pub bytes_received: u64,
    #[source]
    pub status: Status,
}

/// Consumes the data of one upload call.
#[async_trait]
pub trait UploadHandler: Send + Sync {
    /// Drains `source` until end of stream and returns the byte count.
    async fn handle_upload(
        &self,
        ctx: &Context,
        source: &mut dyn ByteSource,
    ) -> Result<u64, UploadFailure>;
}

/// Handler that discards the payload.
#[derive(Debug, Clone)]
pub struct DefaultUploadHandler {
    buffer_size: usize,
}

impl Default for DefaultUploadHandler {
    fn default() -> Self {
        Self {
            buffer_size: DISCARD_BUFFER_SIZE,
        }
    }
}

impl DefaultUploadHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

#[async_trait]
impl UploadHandler for DefaultUploadHandler {
    async fn handle_upload(
        &self,
        ctx: &Context,
        source: &mut dyn ByteSource,
    ) -> Result<u64, UploadFailure> {
        info!("Handling upload stream");
        let mut buf = vec![0u8; self.buffer_size];
        let mut bytes_received = 0u64;

        loop {
            // A pending read returns as soon as the call is cancelled.
            let read = tokio::select! {
                biased;
                read = source.read(&mut buf) => read,
                reason = ctx.done() => {
                    info!("Upload context done ({:?}) after {} bytes", reason, bytes_received);
                    return Err(UploadFailure {
                        bytes_received,
                        status: reason.into(),
                    });
                }
            };

            match read {
                Ok(0) => {
                    info!("Upload finished, {} bytes received", bytes_received);
                    return Ok(bytes_received);
                }
                Ok(n) => {
                    bytes_received += n as u64;
                    if let Some(reason) = ctx.cancel_reason() {
                        info!("Upload context done ({:?}) after {} bytes", reason, bytes_received);
                        return Err(UploadFailure {
                            bytes_received,
                            status: reason.into(),
                        });
                    }
                }
                Err(e) => {
                    // A concurrent cancellation explains the failure better than the transport error.
                    let status = match ctx.cancel_reason() {
                        Some(reason) => reason.into(),
                        None => {
                            error!("Error reading upload stream: {}", e);
                            Status::internal("error processing upload stream", e)
                        }
                    };
                    return Err(UploadFailure {
                        bytes_received,
                        status,
                    });
                }
            }
        }
    }
}
