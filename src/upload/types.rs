use serde::{Deserialize, Serialize};

/// Where an object should be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket: String,
    pub object: String,
    pub content_type: Option<String>,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Same bucket and content type, different object name
    pub fn for_object(&self, object: impl Into<String>) -> Self {
        Self {
            bucket: self.bucket.clone(),
            object: object.into(),
            content_type: self.content_type.clone(),
        }
    }
}

/// Metadata of an object that exists in the remote store
///
/// Returned both for individual shard objects and for the composed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub name: String,
    /// Object version, when the store tracks one
    pub generation: Option<String>,
    pub etag: Option<String>,
    pub size: u64,
}

impl ObjectMetadata {
    pub fn compose_source(&self) -> ComposeSource {
        ComposeSource {
            name: self.name.clone(),
            generation: self.generation.clone(),
        }
    }
}

/// One input of a compose call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSource {
    pub name: String,
    pub generation: Option<String>,
}

/// A contiguous byte range of the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl ShardRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}
