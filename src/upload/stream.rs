use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::backend::UploadSession;
use super::coordinator::UploadCoordinator;
use super::error::{Result, UploadError};
use super::types::ObjectMetadata;

/// Write side of one part of a parallel upload
///
/// Forwards bytes to the underlying session. Closing the handle finalizes
/// the session and reports the part's outcome to the coordinator, exactly
/// once. A handle dropped without being closed reports itself as cancelled.
pub struct StreamHandle {
    /// Released once the part has been reported
    coordinator: Option<Arc<UploadCoordinator>>,
    session: Option<Box<dyn UploadSession>>,
    index: usize,
    write_error: Option<UploadError>,
    bytes_written: u64,
}

impl StreamHandle {
    pub(crate) fn new(
        coordinator: Arc<UploadCoordinator>,
        index: usize,
        session: Box<dyn UploadSession>,
    ) -> Self {
        Self {
            coordinator: Some(coordinator),
            session: Some(session),
            index,
            write_error: None,
            bytes_written: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether the part's outcome has been reported
    pub fn is_closed(&self) -> bool {
        self.coordinator.is_none()
    }

    /// Write a chunk to the session
    ///
    /// Transport failures are returned here and not reported to the
    /// coordinator; they surface as the part result on `close`.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if let Some(e) = &self.write_error {
            return Err(e.clone());
        }
        let Some(session) = self.session.as_mut() else {
            return Err(UploadError::FailedPrecondition(format!(
                "write to stream {} after close",
                self.index
            )));
        };

        let len = data.len() as u64;
        match session.write(data).await {
            Ok(()) => {
                self.bytes_written += len;
                Ok(())
            }
            Err(e) => {
                debug!("Write to stream {} failed: {}", self.index, e);
                self.write_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Discard the session and report `error` as this part's outcome
    ///
    /// An earlier write failure takes precedence over `error`.
    pub async fn close_with_error(&mut self, error: UploadError) -> Result<ObjectMetadata> {
        if self.write_error.is_none() {
            self.write_error = Some(error);
        }
        self.close().await
    }

    /// Finish the part and report it to the coordinator
    pub async fn close(&mut self) -> Result<ObjectMetadata> {
        let Some(session) = self.session.take() else {
            return Err(UploadError::FailedPrecondition(format!(
                "stream {} already closed",
                self.index
            )));
        };

        let result = match self.write_error.take() {
            Some(e) => {
                if let Err(abort) = session.abort().await {
                    warn!("Failed to abort session of stream {}: {}", self.index, abort);
                }
                Err(e)
            }
            None => session.close().await,
        };

        if let Some(coordinator) = self.coordinator.take() {
            coordinator.report_part_result(self.index, &result).await;
        }
        result
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("index", &self.index)
            .field("bytes_written", &self.bytes_written)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };

        warn!("Stream {} dropped before close, cancelling its part", self.index);
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let index = self.index;
                    runtime.spawn(async move {
                        if let Err(e) = session.abort().await {
                            warn!("Failed to abort session of stream {}: {}", index, e);
                        }
                    });
                }
                Err(_) => warn!(
                    "No runtime to abort the session of stream {}, its remote upload is left incomplete",
                    self.index
                ),
            }
        }
        coordinator.abandon_part(
            self.index,
            UploadError::Cancelled(format!("stream {} dropped before close", self.index)),
        );
    }
}
