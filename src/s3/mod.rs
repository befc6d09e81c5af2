//! Amazon S3 implementation of the upload backend.
//!
//! Shard sessions are multipart uploads of temporary objects, composition is
//! a multipart upload of the destination built from `UploadPartCopy` calls,
//! and cleanup is a batched `DeleteObjects`.

mod cleanup;
mod client;
mod compose;
mod session;

pub use cleanup::S3Deleter;
pub use client::S3Client;
pub use compose::S3Composer;
pub use session::S3Session;

use aws_sdk_s3::error::DisplayErrorContext;

use crate::upload::UploadError;

// S3 rejects multipart parts below 5MB, except for the last one
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

// Maximum number of parts of a single multipart upload
pub const MAX_PARTS: usize = 10_000;

// Largest source object UploadPartCopy and CopyObject accept (5GB)
pub const MAX_COPY_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

pub(crate) fn s3_error<E: std::error::Error>(bucket: &str, operation: &str, err: E) -> UploadError {
    UploadError::from_aws_error(bucket, operation, DisplayErrorContext(err))
}
