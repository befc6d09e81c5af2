use anyhow::{Context, Result};
use std::env;

use crate::s3::{MAX_COPY_PART_SIZE, MAX_PARTS, MIN_PART_SIZE};
use crate::upload::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_STREAMS, DEFAULT_MIN_STREAM_SIZE, UploadOptions,
};

/// Configuration for parallel uploads to S3
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub profile: Option<String>,
    pub bucket: String,
    pub target_path: String,
    pub max_streams: usize,
    pub min_stream_size: u64,
    pub buffer_size: usize,
}

impl Config {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists

        let region = env::var("AWS_REGION")
            .context("AWS_REGION not found in environment. Please set it in .env file")?;
        Self::validate_region(&region)?;

        let profile = env::var("AWS_PROFILE").ok();

        let bucket = env::var("S3_BUCKET")
            .context("S3_BUCKET not found in environment. Please set it in .env file")?;
        Self::validate_bucket_name(&bucket)?;

        let target_path = env::var("S3_TARGET_PATH").unwrap_or_default();
        Self::validate_target_path(&target_path)?;

        let mut config = Self {
            region,
            profile,
            bucket,
            target_path,
            max_streams: DEFAULT_MAX_STREAMS,
            min_stream_size: DEFAULT_MIN_STREAM_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        };

        if let Ok(value) = env::var("PUPLOAD_MAX_STREAMS") {
            config.max_streams = value
                .trim()
                .parse()
                .with_context(|| format!("PUPLOAD_MAX_STREAMS '{}' is not a number", value))?;
        }
        if let Ok(value) = env::var("PUPLOAD_MIN_STREAM_SIZE") {
            config.min_stream_size = parse_size(&value).context("Invalid PUPLOAD_MIN_STREAM_SIZE")?;
        }
        if let Ok(value) = env::var("PUPLOAD_BUFFER_SIZE") {
            config.buffer_size =
                parse_size(&value).context("Invalid PUPLOAD_BUFFER_SIZE")? as usize;
        }
        config.validate_tuning()?;

        Ok(config)
    }

    /// Options for [`crate::ParallelUploader`]
    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            max_streams: self.max_streams,
            min_stream_size: self.min_stream_size,
            max_stream_size: MAX_COPY_PART_SIZE,
            buffer_size: self.buffer_size,
            ignore_cleanup_failures: false,
        }
    }

    /// Check the tuning knobs against S3 multipart limits
    ///
    /// Every shard but the last becomes one `UploadPartCopy` part of the
    /// destination, so shards share the limits of copied multipart parts.
    pub fn validate_tuning(&self) -> Result<()> {
        if self.max_streams == 0 || self.max_streams > MAX_PARTS {
            anyhow::bail!(
                "max streams must be between 1 and {} (got {})",
                MAX_PARTS,
                self.max_streams
            );
        }

        if self.min_stream_size < MIN_PART_SIZE as u64 {
            anyhow::bail!(
                "min stream size must be at least {} bytes, the S3 minimum part size (got {})",
                MIN_PART_SIZE,
                self.min_stream_size
            );
        }

        if self.min_stream_size > MAX_COPY_PART_SIZE {
            anyhow::bail!(
                "min stream size must be at most {} bytes, the S3 copy limit (got {})",
                MAX_COPY_PART_SIZE,
                self.min_stream_size
            );
        }

        if self.buffer_size == 0 {
            anyhow::bail!("buffer size cannot be zero");
        }

        Ok(())
    }

    /// Validate AWS region format
    fn validate_region(region: &str) -> Result<()> {
        if region.is_empty() {
            anyhow::bail!("AWS_REGION cannot be empty");
        }

        if !region.contains('-') {
            anyhow::bail!(
                "AWS_REGION '{}' doesn't look like a valid region (e.g., us-west-2, eu-west-1)",
                region
            );
        }

        Ok(())
    }

    /// Validate S3 bucket name according to AWS rules
    fn validate_bucket_name(bucket: &str) -> Result<()> {
        if bucket.len() < 3 || bucket.len() > 63 {
            anyhow::bail!(
                "S3_BUCKET '{}' must be between 3 and 63 characters (got {})",
                bucket,
                bucket.len()
            );
        }

        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !edge_ok(bucket.chars().next()) || !edge_ok(bucket.chars().last()) {
            anyhow::bail!(
                "S3_BUCKET '{}' must start and end with a lowercase letter or number",
                bucket
            );
        }

        if let Some(c) = bucket
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-' && *c != '.')
        {
            anyhow::bail!(
                "S3_BUCKET '{}' contains invalid character '{}'. Only lowercase letters, numbers, hyphens, and periods are allowed",
                bucket,
                c
            );
        }

        if bucket.contains("..") {
            anyhow::bail!("S3_BUCKET '{}' cannot contain consecutive periods", bucket);
        }

        let parts: Vec<_> = bucket.split('.').collect();
        if parts.len() == 4 && parts.iter().all(|part| part.parse::<u8>().is_ok()) {
            anyhow::bail!("S3_BUCKET '{}' cannot be formatted as an IP address", bucket);
        }

        Ok(())
    }

    /// Validate S3 target path
    fn validate_target_path(path: &str) -> Result<()> {
        if path.contains("//") {
            anyhow::bail!("S3_TARGET_PATH '{}' contains consecutive slashes", path);
        }

        if path.split('/').any(|segment| segment == "..") {
            anyhow::bail!("S3_TARGET_PATH '{}' contains '..'", path);
        }

        if path.starts_with('/') {
            anyhow::bail!(
                "S3_TARGET_PATH '{}' should not start with '/' (use relative path)",
                path
            );
        }

        Ok(())
    }

    /// Object key for `name` under the configured target path
    pub fn build_s3_key(&self, name: &str) -> String {
        let name = name.trim_start_matches("./");
        if self.target_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.target_path.trim_end_matches('/'), name)
        }
    }
}

/// Parse a byte count such as `1048576`, `64M`, `512KiB` or `2G`
///
/// Suffixes are binary multiples and case insensitive.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let number: u64 = digits
        .parse()
        .with_context(|| format!("'{}' is not a valid size", value))?;
    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        other => anyhow::bail!("unknown size suffix '{}' in '{}'", other, value),
    };

    number
        .checked_mul(1u64 << shift)
        .with_context(|| format!("size '{}' is too large", value))
}
