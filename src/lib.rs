pub mod config;
pub mod s3;
pub mod upload;

pub use config::Config;
pub use upload::{
    ErrorCode, ObjectMetadata, ParallelUploader, UploadCoordinator, UploadError, UploadOptions,
    UploadRequest,
};
