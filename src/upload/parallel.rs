use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use indicatif::ProgressBar;
use tracing::{debug, error, info, warn};

use super::backend::ObjectBackend;
use super::coordinator::UploadCoordinator;
use super::error::{Result, UploadError};
use super::plan::{plan_shards, required_streams, shard_object_name, upload_tag};
use super::shard::ShardUploadTask;
use super::types::{ObjectMetadata, UploadRequest};

// Files smaller than this go up as a single shard
pub const DEFAULT_MIN_STREAM_SIZE: u64 = 64 * 1024 * 1024;

pub const DEFAULT_MAX_STREAMS: usize = 8;

// Size of each read from the source file (8MB)
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

// Largest object a server-side copy accepts as a source (5GB)
pub const DEFAULT_MAX_STREAM_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Tuning knobs of a parallel upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// Upper bound on the number of shards
    pub max_streams: usize,
    /// Lower bound on the size of every shard but the last
    pub min_stream_size: u64,
    /// Upper bound on the size of every shard, wins over `min_stream_size`
    pub max_stream_size: u64,
    pub buffer_size: usize,
    /// Report success even if temporary shard objects could not be deleted
    pub ignore_cleanup_failures: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            min_stream_size: DEFAULT_MIN_STREAM_SIZE,
            max_stream_size: DEFAULT_MAX_STREAM_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ignore_cleanup_failures: false,
        }
    }
}

/// Uploads a local file as parallel shards composed into one object
pub struct ParallelUploader {
    backend: Arc<dyn ObjectBackend>,
    options: UploadOptions,
    progress: Option<ProgressBar>,
}

impl ParallelUploader {
    pub fn new(backend: Arc<dyn ObjectBackend>, options: UploadOptions) -> Self {
        Self {
            backend,
            options,
            progress: None,
        }
    }

    /// Track uploaded bytes on `pb`; its length is set to the file size
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    /// Upload `path` to `request`
    ///
    /// Shards are written to temporary objects next to the destination,
    /// composed once all of them succeed, and deleted afterwards whatever the
    /// outcome.
    pub async fn upload_file(&self, path: &Path, request: &UploadRequest) -> Result<ObjectMetadata> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::from_io_error(&e, &path.display().to_string()))?
            .len();

        // fail before any shard is uploaded rather than at compose time
        let needed = required_streams(file_size, self.options.max_stream_size);
        if needed > self.options.max_streams as u64 {
            return Err(UploadError::FailedPrecondition(format!(
                "{} needs at least {} streams of at most {} bytes, but max streams is {}",
                path.display(),
                needed,
                self.options.max_stream_size,
                self.options.max_streams
            )));
        }

        let shards = plan_shards(
            file_size,
            self.options.max_streams,
            self.options.min_stream_size,
            self.options.max_stream_size,
        );
        let tag = upload_tag(path, &request.object, file_size);

        info!(
            "Starting parallel upload for {} ({} bytes, {} shards) -> {}/{}",
            path.display(),
            file_size,
            shards.len(),
            request.bucket,
            request.object
        );

        if let Some(pb) = &self.progress {
            pb.set_length(file_size);
            pb.set_position(0);
        }

        let coordinator =
            UploadCoordinator::new(self.backend.composer(request), self.backend.deleter());

        // Every stream is opened before any shard starts, so shard indexes are
        // final by the time parts begin reporting.
        let mut tasks = Vec::with_capacity(shards.len());
        for shard in &shards {
            let part = request.for_object(shard_object_name(&request.object, &tag, shard.index));
            // on error the tasks built so far are dropped and cancel their parts
            let stream = coordinator.create_stream(self.backend.as_ref(), &part).await?;

            let mut task = ShardUploadTask::new(
                Arc::clone(&coordinator),
                path,
                *shard,
                self.options.buffer_size,
                stream,
            );
            if let Some(pb) = &self.progress {
                task = task.with_progress(pb.clone());
            }
            tasks.push(task);
        }

        let workers: Vec<_> = tasks
            .into_iter()
            .map(|task| tokio::spawn(task.upload()))
            .collect();
        for (index, joined) in join_all(workers).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Shard {} failed: {}", index, e),
                Err(e) => error!("Shard {} worker panic: {}", index, e),
            }
        }

        let result = coordinator.wait_for_completion().await;
        let cleanup = coordinator.eager_cleanup().await;

        match (result, cleanup) {
            (Ok(metadata), Ok(())) => {
                info!(
                    "Successfully completed parallel upload: {} -> {}/{}",
                    path.display(),
                    metadata.bucket,
                    metadata.name
                );
                Ok(metadata)
            }
            (Ok(metadata), Err(e)) if self.options.ignore_cleanup_failures => {
                warn!("Ignoring failure to delete temporary shards: {}", e);
                Ok(metadata)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(
                        "Temporary shards of the failed upload may be left behind: {}",
                        cleanup_err
                    );
                }
                Err(e)
            }
        }
    }
}
