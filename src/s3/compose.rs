use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
};
use tracing::{debug, info, warn};

use super::{MAX_PARTS, s3_error};
use crate::upload::{ComposeSource, Composer, ObjectMetadata, Result, UploadError, UploadRequest};

/// Builds the destination object from shard objects of the same bucket
///
/// A single source is copied with `CopyObject`. Several sources become the
/// parts of a multipart upload, each one copied server side with
/// `UploadPartCopy`, so no shard data goes through the client again.
pub struct S3Composer {
    client: Client,
    destination: UploadRequest,
}

impl S3Composer {
    pub fn new(client: Client, destination: UploadRequest) -> Self {
        Self {
            client,
            destination,
        }
    }

    async fn copy_single(&self, source: &ComposeSource) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.destination.bucket)
            .key(&self.destination.object)
            .copy_source(copy_source(&self.destination.bucket, source))
            .set_content_type(self.destination.content_type.clone())
            .set_metadata_directive(
                self.destination
                    .content_type
                    .as_ref()
                    .map(|_| MetadataDirective::Replace),
            )
            .send()
            .await
            .map_err(|e| s3_error(&self.destination.bucket, "CopyObject", e))?;
        Ok(())
    }

    async fn copy_parts(&self, upload_id: &str, sources: &[ComposeSource]) -> Result<()> {
        let bucket = &self.destination.bucket;
        let mut parts = Vec::with_capacity(sources.len());

        for (i, source) in sources.iter().enumerate() {
            let part_number = i as i32 + 1;
            debug!("Copying {} as part {} of {}", source.name, part_number, self.destination.object);

            let output = self
                .client
                .upload_part_copy()
                .bucket(bucket)
                .key(&self.destination.object)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(copy_source(bucket, source))
                .send()
                .await
                .map_err(|e| s3_error(bucket, "UploadPartCopy", e))?;

            let e_tag = output
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default();
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(e_tag)
                    .build(),
            );
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(&self.destination.object)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| s3_error(bucket, "CompleteMultipartUpload", e))?;
        Ok(())
    }

    async fn copy_multipart(&self, sources: &[ComposeSource]) -> Result<()> {
        let bucket = &self.destination.bucket;
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(&self.destination.object)
            .set_content_type(self.destination.content_type.clone())
            .send()
            .await
            .map_err(|e| s3_error(bucket, "CreateMultipartUpload", e))?;
        let upload_id = output.upload_id().ok_or_else(|| UploadError::Remote {
            operation: "CreateMultipartUpload".to_string(),
            message: "no upload ID returned from S3".to_string(),
        })?;

        if let Err(e) = self.copy_parts(upload_id, sources).await {
            let abort = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(&self.destination.object)
                .upload_id(upload_id)
                .send()
                .await;
            if let Err(abort_err) = abort {
                warn!(
                    "Failed to abort compose upload {}: {}",
                    upload_id,
                    s3_error(bucket, "AbortMultipartUpload", abort_err)
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn head(&self) -> Result<ObjectMetadata> {
        let bucket = &self.destination.bucket;
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(&self.destination.object)
            .send()
            .await
            .map_err(|e| s3_error(bucket, "HeadObject", e))?;

        Ok(ObjectMetadata {
            bucket: bucket.clone(),
            name: self.destination.object.clone(),
            generation: output.version_id().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            size: output.content_length().unwrap_or_default().max(0) as u64,
        })
    }
}

#[async_trait]
impl Composer for S3Composer {
    async fn compose(&self, sources: Vec<ComposeSource>) -> Result<ObjectMetadata> {
        match sources.as_slice() {
            [] => {
                return Err(UploadError::FailedPrecondition(
                    "compose needs at least one source".to_string(),
                ));
            }
            [single] => self.copy_single(single).await?,
            many if many.len() > MAX_PARTS => {
                return Err(UploadError::FailedPrecondition(format!(
                    "cannot compose {} objects, S3 allows at most {} parts",
                    many.len(),
                    MAX_PARTS
                )));
            }
            many => self.copy_multipart(many).await?,
        }

        let metadata = self.head().await?;
        info!(
            "Composed {} objects into s3://{}/{} ({} bytes)",
            sources.len(),
            metadata.bucket,
            metadata.name,
            metadata.size
        );
        Ok(metadata)
    }
}

/// `CopySource` value of `source`, pinned to its version when known
pub fn copy_source(bucket: &str, source: &ComposeSource) -> String {
    let key = source
        .name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    match &source.generation {
        Some(version) => format!(
            "{}/{}?versionId={}",
            bucket,
            key,
            urlencoding::encode(version)
        ),
        None => format!("{}/{}", bucket, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, generation: Option<&str>) -> ComposeSource {
        ComposeSource {
            name: name.to_string(),
            generation: generation.map(str::to_string),
        }
    }

    #[test]
    fn test_copy_source_plain_key() {
        assert_eq!(
            copy_source("bucket", &source("videos/big.mp4.abc.upload_shard_0", None)),
            "bucket/videos/big.mp4.abc.upload_shard_0"
        );
    }

    #[test]
    fn test_copy_source_encodes_key_and_version() {
        assert_eq!(
            copy_source("bucket", &source("my videos/a+b.mp4", Some("3/L4kqtJl+cT"))),
            "bucket/my%20videos/a%2Bb.mp4?versionId=3%2FL4kqtJl%2BcT"
        );
    }
}
