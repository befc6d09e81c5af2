use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::Deleter;
use super::error::Result;
use super::types::ObjectMetadata;

/// Objects created on behalf of an upload that must not outlive it
#[derive(Clone)]
pub struct CleanupRegistry {
    deleter: Arc<dyn Deleter>,
    objects: Vec<ObjectMetadata>,
}

impl CleanupRegistry {
    pub fn new(deleter: Arc<dyn Deleter>) -> Self {
        Self {
            deleter,
            objects: Vec::new(),
        }
    }

    pub fn add(&mut self, object: ObjectMetadata) {
        debug!("Registered {} for cleanup", object.name);
        self.objects.push(object);
    }

    pub fn objects(&self) -> &[ObjectMetadata] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Delete every registered object in a single batch
    pub async fn execute_delete(self) -> Result<()> {
        if self.objects.is_empty() {
            return Ok(());
        }

        debug!("Deleting {} temporary objects", self.objects.len());
        let res = self.deleter.delete(&self.objects).await;
        if let Err(e) = &res {
            warn!("Failed to delete {} temporary objects: {}", self.objects.len(), e);
        }
        res
    }
}
