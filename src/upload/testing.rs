//! In-memory object store with fault injection, for tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::backend::{Composer, Deleter, ObjectBackend, SessionOpener, UploadSession};
use super::error::{Result, UploadError};
use super::types::{ComposeSource, ObjectMetadata, UploadRequest};

pub(crate) const BUCKET: &str = "test-bucket";

pub(crate) fn request(object: &str) -> UploadRequest {
    UploadRequest::new(BUCKET, object)
}

pub(crate) fn destination() -> UploadRequest {
    request("final")
}

pub(crate) fn object(name: &str) -> ObjectMetadata {
    ObjectMetadata {
        bucket: BUCKET.to_string(),
        name: name.to_string(),
        generation: Some("1".to_string()),
        etag: None,
        size: 0,
    }
}

#[derive(Default)]
struct Faults {
    open: HashMap<String, UploadError>,
    write: HashMap<String, UploadError>,
    close: HashMap<String, UploadError>,
    compose: Option<UploadError>,
    delete: Option<UploadError>,
    delete_delay: Option<Duration>,
}

impl Faults {
    /// Faults are keyed by object name suffix
    fn find(map: &HashMap<String, UploadError>, name: &str) -> Option<UploadError> {
        map.iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, e)| e.clone())
    }
}

#[derive(Default)]
struct Inner {
    objects: Mutex<BTreeMap<String, (Vec<u8>, u64)>>,
    generation: AtomicU64,
    faults: Mutex<Faults>,
    compose_calls: Mutex<Vec<Vec<ComposeSource>>>,
    delete_calls: Mutex<Vec<Vec<String>>>,
    aborted: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, data: &[u8]) -> ObjectMetadata {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .objects
            .lock()
            .unwrap()
            .insert(name.to_string(), (data.to_vec(), generation));
        ObjectMetadata {
            bucket: BUCKET.to_string(),
            name: name.to_string(),
            generation: Some(generation.to_string()),
            etag: Some(format!("\"{}\"", blake3::hash(data).to_hex())),
            size: data.len() as u64,
        }
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(name)
            .map(|(data, _)| data.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.objects.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_open(&self, suffix: &str, error: UploadError) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .open
            .insert(suffix.to_string(), error);
    }

    pub fn fail_write(&self, suffix: &str, error: UploadError) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .write
            .insert(suffix.to_string(), error);
    }

    pub fn fail_close(&self, suffix: &str, error: UploadError) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .close
            .insert(suffix.to_string(), error);
    }

    pub fn fail_compose(&self, error: UploadError) {
        self.inner.faults.lock().unwrap().compose = Some(error);
    }

    pub fn fail_delete(&self, error: UploadError) {
        self.inner.faults.lock().unwrap().delete = Some(error);
    }

    /// Make every delete take `delay` before it completes or fails
    pub fn delay_delete(&self, delay: Duration) {
        self.inner.faults.lock().unwrap().delete_delay = Some(delay);
    }

    /// Source names of every compose call, in call order
    pub fn compose_calls(&self) -> Vec<Vec<String>> {
        self.inner
            .compose_calls
            .lock()
            .unwrap()
            .iter()
            .map(|sources| sources.iter().map(|s| s.name.clone()).collect())
            .collect()
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.inner.delete_calls.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.inner.aborted.lock().unwrap().clone()
    }
}

struct MemorySession {
    store: MemoryStore,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl UploadSession for MemorySession {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let fault = Faults::find(&self.store.inner.faults.lock().unwrap().write, &self.name);
        if let Some(e) = fault {
            return Err(e);
        }
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<ObjectMetadata> {
        let fault = Faults::find(&self.store.inner.faults.lock().unwrap().close, &self.name);
        if let Some(e) = fault {
            return Err(e);
        }
        Ok(self.store.put(&self.name, &self.buffer))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.store.inner.aborted.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionOpener for MemoryStore {
    async fn open(&self, request: &UploadRequest) -> Result<Box<dyn UploadSession>> {
        let fault = Faults::find(&self.inner.faults.lock().unwrap().open, &request.object);
        if let Some(e) = fault {
            return Err(e);
        }
        Ok(Box::new(MemorySession {
            store: self.clone(),
            name: request.object.clone(),
            buffer: Vec::new(),
        }))
    }
}

struct MemoryComposer {
    store: MemoryStore,
    destination: String,
}

#[async_trait]
impl Composer for MemoryComposer {
    async fn compose(&self, sources: Vec<ComposeSource>) -> Result<ObjectMetadata> {
        self.store
            .inner
            .compose_calls
            .lock()
            .unwrap()
            .push(sources.clone());
        let fault = self.store.inner.faults.lock().unwrap().compose.clone();
        if let Some(e) = fault {
            return Err(e);
        }

        let mut data = Vec::new();
        for source in &sources {
            let objects = self.store.inner.objects.lock().unwrap();
            let Some((bytes, generation)) = objects.get(&source.name) else {
                return Err(UploadError::NotFound(source.name.clone()));
            };
            if source.generation != Some(generation.to_string()) {
                return Err(UploadError::FailedPrecondition(format!(
                    "generation mismatch for {}",
                    source.name
                )));
            }
            data.extend_from_slice(bytes);
        }
        Ok(self.store.put(&self.destination, &data))
    }
}

#[async_trait]
impl Deleter for MemoryStore {
    async fn delete(&self, objects: &[ObjectMetadata]) -> Result<()> {
        self.inner
            .delete_calls
            .lock()
            .unwrap()
            .push(objects.iter().map(|o| o.name.clone()).collect());
        let delay = self.inner.faults.lock().unwrap().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self.inner.faults.lock().unwrap().delete.clone();
        if let Some(e) = fault {
            return Err(e);
        }

        let mut stored = self.inner.objects.lock().unwrap();
        for object in objects {
            stored.remove(&object.name);
        }
        Ok(())
    }
}

impl ObjectBackend for MemoryStore {
    fn composer(&self, destination: &UploadRequest) -> Box<dyn Composer> {
        Box::new(MemoryComposer {
            store: self.clone(),
            destination: destination.object.clone(),
        })
    }

    fn deleter(&self) -> Arc<dyn Deleter> {
        Arc::new(self.clone())
    }
}
