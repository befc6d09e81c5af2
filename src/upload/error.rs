use thiserror::Error;

/// Errors produced by a parallel upload
///
/// Errors are cloned into every waiter of an upload, so they carry rendered
/// messages rather than source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Local source file could not be opened
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local I/O failure, size mismatch or a broken output stream
    #[error("Internal error: {0}")]
    Internal(String),

    /// A shard was abandoned before it finished uploading
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Operation called in the wrong state
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The store rejected our credentials for this bucket
    #[error("Access denied for bucket '{bucket}': {message}")]
    AccessDenied { bucket: String, message: String },

    /// Any other failure reported by the remote store
    #[error("{operation} failed: {message}")]
    Remote { operation: String, message: String },
}

/// Coarse classification of an [`UploadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Internal,
    Cancelled,
    FailedPrecondition,
    PermissionDenied,
    Unavailable,
}

impl UploadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::AccessDenied { .. } => ErrorCode::PermissionDenied,
            Self::Remote { .. } => ErrorCode::Unavailable,
        }
    }

    /// Build an error from a failed call against the remote store
    ///
    /// Access-denied responses are told apart from everything else so the CLI
    /// can print credential hints.
    pub fn from_aws_error<E: std::fmt::Display>(bucket: &str, operation: &str, error: E) -> Self {
        let message = error.to_string();
        let lower = message.to_lowercase();
        if lower.contains("access denied") || lower.contains("forbidden") {
            Self::AccessDenied {
                bucket: bucket.to_string(),
                message,
            }
        } else {
            Self::Remote {
                operation: operation.to_string(),
                message,
            }
        }
    }

    /// Build an error from a local I/O failure on `path`
    pub fn from_io_error(error: &std::io::Error, path: &str) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::NotFound(format!("cannot open upload file source {}: {}", path, error))
            }
            _ => Self::Internal(format!("{}: {}", path, error)),
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(message) => {
                format!(
                    "{}\n\nPossible solutions:\n  \
                     1. Check if the file path is correct\n  \
                     2. Ensure you have read access to the file",
                    message
                )
            }
            Self::AccessDenied { bucket, message } => {
                format!(
                    "Access denied for bucket '{}': {}\n\nPossible solutions:\n  \
                     1. Check your AWS credentials: aws sts get-caller-identity\n  \
                     2. Verify s3:PutObject and s3:DeleteObject permissions on the bucket\n  \
                     3. Check AWS_REGION in .env matches bucket region",
                    bucket, message
                )
            }
            Self::Remote { .. } => {
                format!(
                    "{}\n\nPossible solutions:\n  \
                     1. Check your internet connection\n  \
                     2. Try again with fewer streams: --max-streams 2",
                    self
                )
            }
            Self::Internal(message) if message.contains("changed size") => {
                format!(
                    "{}\n\nThe source file was modified while it was being uploaded. \
                     Make sure nothing writes to it and try again.",
                    self
                )
            }
            Self::FailedPrecondition(message) if message.contains("max streams") => {
                format!(
                    "{}\n\nEach shard must fit in a single S3 copy. \
                     Try again with more streams: --max-streams",
                    self
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for parallel upload operations
pub type Result<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_aws_error_access_denied() {
        let err = UploadError::from_aws_error("bucket", "UploadPart", "AccessDenied: Access Denied");
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let err = UploadError::from_aws_error("bucket", "UploadPart", "connection reset");
        assert_eq!(
            err,
            UploadError::Remote {
                operation: "UploadPart".to_string(),
                message: "connection reset".to_string(),
            }
        );
        assert_eq!(err.to_string(), "UploadPart failed: connection reset");
    }

    #[test]
    fn test_from_io_error() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(
            UploadError::from_io_error(&missing, "a.bin").code(),
            ErrorCode::NotFound
        );

        let broken = std::io::Error::other("disk on fire");
        assert_eq!(
            UploadError::from_io_error(&broken, "a.bin").code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_user_message_hints() {
        let err = UploadError::Internal("file changed size during upload".to_string());
        assert!(err.user_message().contains("modified while it was being uploaded"));

        let err = UploadError::FailedPrecondition(
            "big.bin needs at least 3 streams of at most 100 bytes, but max streams is 2"
                .to_string(),
        );
        assert!(err.user_message().contains("--max-streams"));

        let err = UploadError::Cancelled("shard abandoned".to_string());
        assert_eq!(err.user_message(), "Cancelled: shard abandoned");
    }
}
