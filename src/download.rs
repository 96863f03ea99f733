//! Download streaming.
//!
//! The server pushes pattern data at the client as fast as the transport
//! accepts it. There is no end-of-data: a download ends when its context is
//! cancelled or the client goes away.

use crate::config::MAX_CHUNK_SIZE_HINT;
use crate::context::Context;
use crate::error::{is_peer_disconnect, Status};
use crate::pattern::PatternBuffer;
use crate::stream::ByteSink;
use async_trait::async_trait;
use log::{debug, info};

/// Produces download data for one call.
#[async_trait]
pub trait DownloadStreamer: Send + Sync {
    /// Streams chunks of `chunk_size` bytes into `sink` until `ctx` is done
    /// or the sink fails. Always ends with an error status; a peer
    /// disconnect is reported as `Cancelled`.
    async fn stream_download(
        &self,
        ctx: &Context,
        sink: &mut dyn ByteSink,
        chunk_size: usize,
    ) -> Result<(), Status>;
}

/// Picks the chunk size for a download request.
///
/// The client's hint is honoured only when `0 < hint < 1 MiB`; otherwise
/// the configured default applies.
pub fn effective_chunk_size(hint: Option<i64>, default: usize) -> usize {
    match hint {
        Some(hint) if hint > 0 && hint < MAX_CHUNK_SIZE_HINT => hint as usize,
        _ => default,
    }
}

/// Streamer replaying a shared [`PatternBuffer`].
pub struct DefaultDownloadStreamer {
    pattern: PatternBuffer,
    default_chunk_size: usize,
}

impl DefaultDownloadStreamer {
    pub fn new(pattern: PatternBuffer, default_chunk_size: usize) -> Self {
        Self {
            pattern,
            default_chunk_size,
        }
    }

    pub fn pattern(&self) -> &PatternBuffer {
        &self.pattern
    }
}

#[async_trait]
impl DownloadStreamer for DefaultDownloadStreamer {
    async fn stream_download(
        &self,
        ctx: &Context,
        sink: &mut dyn ByteSink,
        chunk_size: usize,
    ) -> Result<(), Status> {
        // Sizes that do not even fit an i64 are out of range like any other.
        let chunk_size =
            effective_chunk_size(i64::try_from(chunk_size).ok(), self.default_chunk_size);
        info!("Streaming download data with chunk size {}", chunk_size);

        // Each call owns its cursor; the pattern itself is shared.
        let mut source = self.pattern.source();
        let mut chunk = vec![0u8; chunk_size];
        let mut sent = 0u64;

        loop {
            // Cancellation is only observed here, never in the middle of a write.
            if let Some(reason) = ctx.cancel_reason() {
                info!("Download context done ({:?}) after {} bytes", reason, sent);
                return Err(reason.into());
            }

            source.fill(&mut chunk);

            if let Err(e) = sink.write_chunk(&chunk).await {
                if is_peer_disconnect(&e) {
                    debug!("Client disconnected after {} bytes: {}", sent, e);
                    return Err(Status::cancelled("client disconnected during download"));
                }
                return Err(Status::internal("failed to write download data", e));
            }
            sent += chunk_size as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::stream::{memory, StreamWriter};
    use std::io;
    use std::time::Duration;

    /// Sink recording chunks, cancelling a context or failing after a
    /// fixed number of writes.
    struct ScriptedSink {
        chunks: Vec<Vec<u8>>,
        limit: usize,
        on_limit: OnLimit,
    }

    enum OnLimit {
        Cancel(Context),
        Fail(io::ErrorKind),
    }

    impl ScriptedSink {
        fn new(limit: usize, on_limit: OnLimit) -> Self {
            Self {
                chunks: Vec::new(),
                limit,
                on_limit,
            }
        }
    }

    #[async_trait]
    impl ByteSink for ScriptedSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
            if self.chunks.len() == self.limit {
                if let OnLimit::Fail(kind) = &self.on_limit {
                    return Err(io::Error::new(*kind, "scripted failure"));
                }
            }
            self.chunks.push(chunk.to_vec());
            if self.chunks.len() == self.limit {
                if let OnLimit::Cancel(ctx) = &self.on_limit {
                    ctx.cancel();
                }
            }
            Ok(())
        }
    }

    fn streamer(pattern: &[u8]) -> DefaultDownloadStreamer {
        let pattern = PatternBuffer::from_vec(pattern.to_vec()).unwrap();
        DefaultDownloadStreamer::new(pattern, 8)
    }

    #[test]
    fn test_effective_chunk_size() {
        assert_eq!(effective_chunk_size(None, 65536), 65536);
        assert_eq!(effective_chunk_size(Some(0), 65536), 65536);
        assert_eq!(effective_chunk_size(Some(-1), 65536), 65536);
        assert_eq!(effective_chunk_size(Some(1), 65536), 1);
        assert_eq!(effective_chunk_size(Some(4096), 65536), 4096);
        assert_eq!(effective_chunk_size(Some(1024 * 1024 - 1), 65536), 1024 * 1024 - 1);
        assert_eq!(effective_chunk_size(Some(1024 * 1024), 65536), 65536);
        assert_eq!(effective_chunk_size(Some(i64::MAX), 65536), 65536);
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let ctx = Context::new();
        ctx.cancel();
        let mut sink = ScriptedSink::new(usize::MAX, OnLimit::Fail(io::ErrorKind::Other));

        let status = streamer(&[1, 2, 3])
            .stream_download(&ctx, &mut sink, 4)
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Cancelled);
        assert!(sink.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_stops_within_one_iteration_of_cancel() {
        let ctx = Context::new();
        let mut sink = ScriptedSink::new(3, OnLimit::Cancel(ctx.clone()));

        let status = streamer(&[1, 2, 3])
            .stream_download(&ctx, &mut sink, 4)
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(
            sink.chunks,
            vec![vec![1, 2, 3, 1], vec![2, 3, 1, 2], vec![3, 1, 2, 3]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_deadline_exceeded() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;
        let mut sink = ScriptedSink::new(usize::MAX, OnLimit::Fail(io::ErrorKind::Other));

        let status = streamer(&[9])
            .stream_download(&ctx, &mut sink, 4)
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_cancelled() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
        ] {
            let mut sink = ScriptedSink::new(2, OnLimit::Fail(kind));
            let status = streamer(&[1])
                .stream_download(&Context::new(), &mut sink, 4)
                .await
                .unwrap_err();

            assert_eq!(status.code(), Code::Cancelled, "{:?}", kind);
            assert_eq!(sink.chunks.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_other_write_failure_is_internal() {
        let mut sink = ScriptedSink::new(1, OnLimit::Fail(io::ErrorKind::InvalidData));
        let status = streamer(&[1])
            .stream_download(&Context::new(), &mut sink, 4)
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_zero_chunk_size_uses_default() {
        let ctx = Context::new();
        let mut sink = ScriptedSink::new(1, OnLimit::Cancel(ctx.clone()));

        let _ = streamer(&[1, 2]).stream_download(&ctx, &mut sink, 0).await;
        assert_eq!(sink.chunks[0].len(), 8);
    }

    #[tokio::test]
    async fn test_oversized_chunk_size_uses_default() {
        for size in [1024 * 1024, i64::MAX as usize, usize::MAX] {
            let ctx = Context::new();
            let mut sink = ScriptedSink::new(1, OnLimit::Cancel(ctx.clone()));

            let status = streamer(&[1, 2])
                .stream_download(&ctx, &mut sink, size)
                .await
                .unwrap_err();
            assert_eq!(status.code(), Code::Cancelled);
            assert_eq!(sink.chunks[0].len(), 8);
        }
    }

    #[tokio::test]
    async fn test_closed_memory_endpoint_ends_download() {
        let (tx, mut rx) = memory::channel(2);
        let mut writer = StreamWriter::new(tx);
        let streamer = streamer(&[7, 8, 9]);
        let ctx = Context::new();

        let reader = tokio::spawn(async move {
            use crate::stream::FrameSource;
            let mut received = Vec::new();
            for _ in 0..3 {
                received.extend_from_slice(&rx.recv().await.unwrap().unwrap());
            }
            received
        });

        let status = streamer
            .stream_download(&ctx, &mut writer, 2)
            .await
            .unwrap_err();
        let received = reader.await.unwrap();

        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(received, vec![7, 8, 9, 7, 8, 9]);
    }
}
