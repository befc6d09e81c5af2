use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;

use super::cleanup::S3Deleter;
use super::compose::S3Composer;
use super::session::{PART_SIZE, S3Session};
use crate::config::Config;
use crate::upload::{
    Composer, Deleter, ObjectBackend, SessionOpener, UploadRequest, UploadSession,
};

/// S3 client bound to the configured bucket
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    pub config: Config,
}

impl S3Client {
    pub async fn new(config: Config) -> Result<Self> {
        let mut aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            aws_config = aws_config.profile_name(profile);
        }

        let sdk_config = aws_config.load().await;
        Ok(Self::from_client(Client::new(&sdk_config), config))
    }

    pub fn from_client(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Request for `key` in the configured bucket
    pub fn request(&self, key: impl Into<String>) -> UploadRequest {
        UploadRequest::new(self.config.bucket.clone(), key)
    }
}

#[async_trait]
impl SessionOpener for S3Client {
    async fn open(&self, request: &UploadRequest) -> crate::upload::Result<Box<dyn UploadSession>> {
        let session = S3Session::create(self.client.clone(), request, PART_SIZE).await?;
        Ok(Box::new(session))
    }
}

impl ObjectBackend for S3Client {
    fn composer(&self, destination: &UploadRequest) -> Box<dyn Composer> {
        Box::new(S3Composer::new(self.client.clone(), destination.clone()))
    }

    fn deleter(&self) -> Arc<dyn Deleter> {
        Arc::new(S3Deleter::new(self.client.clone()))
    }
}
