use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    types::{Delete, ObjectIdentifier},
};
use tracing::{debug, warn};

use super::s3_error;
use crate::upload::{Deleter, ObjectMetadata, Result, UploadError};

// DeleteObjects accepts at most 1000 keys per request
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Deletes objects with `DeleteObjects`, pinned to the versions that were
/// uploaded so that a concurrent writer's data is never removed
pub struct S3Deleter {
    client: Client,
}

impl S3Deleter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn delete_batch(&self, bucket: &str, batch: &[&ObjectMetadata]) -> Result<()> {
        let identifiers = batch
            .iter()
            .map(|object| {
                ObjectIdentifier::builder()
                    .key(&object.name)
                    .set_version_id(object.generation.clone())
                    .build()
                    .map_err(|e| UploadError::Internal(format!("invalid object identifier: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| UploadError::Internal(format!("invalid delete request: {}", e)))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| s3_error(bucket, "DeleteObjects", e))?;

        let errors = output.errors();
        if errors.is_empty() {
            debug!("Deleted {} objects from {}", batch.len(), bucket);
            return Ok(());
        }

        for error in errors {
            warn!(
                "Failed to delete s3://{}/{}: {} {}",
                bucket,
                error.key().unwrap_or_default(),
                error.code().unwrap_or_default(),
                error.message().unwrap_or_default()
            );
        }
        let first = &errors[0];
        Err(UploadError::from_aws_error(
            bucket,
            "DeleteObjects",
            format!(
                "{} of {} objects not deleted, first: {} ({})",
                errors.len(),
                batch.len(),
                first.key().unwrap_or_default(),
                first.message().or(first.code()).unwrap_or("unknown error")
            ),
        ))
    }
}

#[async_trait]
impl Deleter for S3Deleter {
    async fn delete(&self, objects: &[ObjectMetadata]) -> Result<()> {
        let mut first_error = None;
        for (bucket, batch) in batches(objects) {
            if let Err(e) = self.delete_batch(bucket, &batch).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Group `objects` by bucket, in batches `DeleteObjects` accepts
fn batches(objects: &[ObjectMetadata]) -> Vec<(&str, Vec<&ObjectMetadata>)> {
    let mut by_bucket: BTreeMap<&str, Vec<&ObjectMetadata>> = BTreeMap::new();
    for object in objects {
        by_bucket.entry(object.bucket.as_str()).or_default().push(object);
    }

    by_bucket
        .into_iter()
        .flat_map(|(bucket, objects)| {
            objects
                .chunks(DELETE_BATCH_SIZE)
                .map(|chunk| (bucket, chunk.to_vec()))
                .collect::<Vec<_>>()
        })
        .collect()
}
