use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::{MAX_PARTS, MIN_PART_SIZE, s3_error};
use crate::upload::{ObjectMetadata, Result, UploadError, UploadRequest, UploadSession};

// Size of each multipart part (8MB)
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Multipart upload of a single object
///
/// Written bytes are buffered until a full part is available. The object is
/// only created by `close`; `abort` discards every uploaded part.
pub struct S3Session {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_size: usize,
    buffer: BytesMut,
    parts: Vec<CompletedPart>,
    size: u64,
}

impl S3Session {
    /// Initiate a multipart upload for `request`
    pub async fn create(client: Client, request: &UploadRequest, part_size: usize) -> Result<Self> {
        let output = client
            .create_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.object)
            .set_content_type(request.content_type.clone())
            .send()
            .await
            .map_err(|e| s3_error(&request.bucket, "CreateMultipartUpload", e))?;

        let upload_id = output.upload_id().ok_or_else(|| UploadError::Remote {
            operation: "CreateMultipartUpload".to_string(),
            message: "no upload ID returned from S3".to_string(),
        })?;

        debug!(
            "Multipart upload of s3://{}/{} initiated with ID: {}",
            request.bucket, request.object, upload_id
        );

        let part_size = part_size.max(MIN_PART_SIZE);
        Ok(Self {
            upload_id: upload_id.to_string(),
            bucket: request.bucket.clone(),
            key: request.object.clone(),
            client,
            part_size,
            buffer: BytesMut::with_capacity(part_size),
            parts: Vec::new(),
            size: 0,
        })
    }

    async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        if self.parts.len() >= MAX_PARTS {
            return Err(UploadError::Internal(format!(
                "s3://{}/{} needs more than {} parts",
                self.bucket, self.key, MAX_PARTS
            )));
        }

        let part_number = self.parts.len() as i32 + 1;
        let len = body.len();
        debug!("Uploading part {} of {} ({} bytes)", part_number, self.key, len);

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_error(&self.bucket, "UploadPart", e))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(output.e_tag().unwrap_or_default())
                .build(),
        );
        self.size += len as u64;
        Ok(())
    }
}

/// Split a full part off the front of `buffer`
///
/// With `flush`, whatever is left is returned as the final part.
fn next_part(buffer: &mut BytesMut, part_size: usize, flush: bool) -> Option<Bytes> {
    if buffer.len() >= part_size {
        Some(buffer.split_to(part_size).freeze())
    } else if flush && !buffer.is_empty() {
        Some(buffer.split().freeze())
    } else {
        None
    }
}

#[async_trait]
impl UploadSession for S3Session {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&data);
        while let Some(part) = next_part(&mut self.buffer, self.part_size, false) {
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<ObjectMetadata> {
        while let Some(part) = next_part(&mut self.buffer, self.part_size, true) {
            self.upload_part(part).await?;
        }
        // a multipart upload needs at least one part, even for an empty object
        if self.parts.is_empty() {
            self.upload_part(Bytes::new()).await?;
        }

        debug!(
            "All {} parts of {} uploaded, completing multipart upload",
            self.parts.len(),
            self.key
        );

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| s3_error(&self.bucket, "CompleteMultipartUpload", e))?;

        Ok(ObjectMetadata {
            bucket: self.bucket.clone(),
            name: self.key.clone(),
            generation: output.version_id().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            size: self.size,
        })
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| s3_error(&self.bucket, "AbortMultipartUpload", e))?;

        debug!("Aborted multipart upload {}", self.upload_id);
        Ok(())
    }
}
