use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use indicatif::ProgressBar;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::coordinator::UploadCoordinator;
use super::error::{Result, UploadError};
use super::stream::StreamHandle;
use super::types::ShardRange;

/// Uploads one byte range of a local file through its own stream
///
/// The task owns its [`StreamHandle`]. Dropping a task that has not finished
/// uploading fails the whole upload with `Cancelled` and still resolves the
/// part, so the coordinator never waits for it.
pub struct ShardUploadTask {
    coordinator: Arc<UploadCoordinator>,
    path: PathBuf,
    offset: u64,
    remaining: u64,
    buffer_size: usize,
    stream: StreamHandle,
    progress: Option<ProgressBar>,
}

impl ShardUploadTask {
    pub fn new(
        coordinator: Arc<UploadCoordinator>,
        path: impl Into<PathBuf>,
        range: ShardRange,
        buffer_size: usize,
        stream: StreamHandle,
    ) -> Self {
        Self {
            coordinator,
            path: path.into(),
            offset: range.offset,
            remaining: range.length,
            buffer_size: buffer_size.max(1),
            stream,
            progress: None,
        }
    }

    /// Advance `pb` by every byte this shard uploads
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    pub fn index(&self) -> usize {
        self.stream.index()
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Stream the byte range into the part and close it
    pub async fn upload(mut self) -> Result<()> {
        debug!(
            "Uploading shard {} of {} ({} bytes at offset {})",
            self.index(),
            self.path.display(),
            self.remaining,
            self.offset
        );

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                let reason = format!("cannot open upload file source: {}", e);
                return Err(self.fail(UploadError::NotFound(self.describe(&reason))).await);
            }
        };

        let file_size = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                let reason = format!("cannot stat upload file source: {}", e);
                return Err(self.fail(UploadError::Internal(self.describe(&reason))).await);
            }
        };
        if file_size < self.offset || file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            let err = UploadError::Internal(self.describe("file changed size during upload"));
            return Err(self.fail(err).await);
        }

        while self.remaining > 0 {
            let to_copy = self.remaining.min(self.buffer_size as u64) as usize;
            let mut chunk = vec![0u8; to_copy];
            if let Err(e) = file.read_exact(&mut chunk).await {
                let reason = match e.kind() {
                    ErrorKind::UnexpectedEof => "file changed size during upload".to_string(),
                    _ => format!("cannot read from file source: {}", e),
                };
                let err = UploadError::Internal(self.describe(&reason));
                return Err(self.fail(err).await);
            }

            if self.stream.write(Bytes::from(chunk)).await.is_err() {
                // the transport error reaches the coordinator through close first
                let _ = self.stream.close().await;
                let err = UploadError::Internal(self.describe(
                    "writing to output stream failed, look into the whole parallel upload \
                     status for more information",
                ));
                self.coordinator.fail(err.clone());
                return Err(err);
            }

            self.remaining -= to_copy as u64;
            if let Some(pb) = &self.progress {
                pb.inc(to_copy as u64);
            }
        }

        self.stream.close().await.map(|metadata| {
            debug!("Shard {} stored as {}", self.index(), metadata.name);
        })
    }

    /// Record `error` for the whole upload and resolve this part
    async fn fail(&mut self, error: UploadError) -> UploadError {
        self.coordinator.fail(error.clone());
        let _ = self.stream.close_with_error(error.clone()).await;
        error
    }

    fn describe(&self, reason: &str) -> String {
        format!("shard {} of {}: {}", self.index(), self.path.display(), reason)
    }
}

impl Drop for ShardUploadTask {
    fn drop(&mut self) {
        if self.remaining == 0 || self.stream.is_closed() {
            return;
        }

        warn!(
            "Shard {} of {} dropped with {} bytes left to upload",
            self.index(),
            self.path.display(),
            self.remaining
        );
        self.coordinator.fail(UploadError::Cancelled(
            self.describe("shard destroyed before its upload finished"),
        ));
        // `stream` is dropped right after this and reports the part itself
    }
}
