//! Parallel upload coordination.
//!
//! A file is split into byte-range shards, each shard is written to its own
//! temporary object through a [`StreamHandle`], and the [`UploadCoordinator`]
//! composes the temporary objects into the destination once every shard has
//! reported in. Temporary objects are tracked in a [`CleanupRegistry`] and
//! removed with a single batched delete.

mod backend;
mod cleanup;
mod coordinator;
mod error;
mod parallel;
mod plan;
mod shard;
mod stream;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Composer, Deleter, ObjectBackend, SessionOpener, UploadSession};
pub use cleanup::CleanupRegistry;
pub use coordinator::{Completion, UploadCoordinator};
pub use error::{ErrorCode, Result, UploadError};
pub use parallel::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_STREAM_SIZE, DEFAULT_MAX_STREAMS, DEFAULT_MIN_STREAM_SIZE,
    ParallelUploader, UploadOptions,
};
pub use plan::{plan_shards, required_streams, shard_object_name, upload_tag};
pub use shard::ShardUploadTask;
pub use stream::StreamHandle;
pub use types::{ComposeSource, ObjectMetadata, ShardRange, UploadRequest};
