use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::Result;
use super::types::{ComposeSource, ObjectMetadata, UploadRequest};

/// Opens one remote write session per shard object
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(&self, request: &UploadRequest) -> Result<Box<dyn UploadSession>>;
}

/// A single remote write session
///
/// The object only becomes visible in the store once `close` succeeds.
#[async_trait]
pub trait UploadSession: Send {
    async fn write(&mut self, data: Bytes) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<ObjectMetadata>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Merges finished shard objects, in order, into the destination object
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, sources: Vec<ComposeSource>) -> Result<ObjectMetadata>;
}

/// Removes a batch of objects
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, objects: &[ObjectMetadata]) -> Result<()>;
}

/// A remote store able to host a parallel upload
pub trait ObjectBackend: SessionOpener {
    /// Composer that writes into `destination`
    fn composer(&self, destination: &UploadRequest) -> Box<dyn Composer>;

    fn deleter(&self) -> Arc<dyn Deleter>;
}
