use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{OnceCell, oneshot};
use tracing::{debug, info, warn};

use super::backend::{Composer, Deleter, SessionOpener};
use super::cleanup::CleanupRegistry;
use super::error::{Result, UploadError};
use super::stream::StreamHandle;
use super::types::{ComposeSource, ObjectMetadata, UploadRequest};

type Waiter = oneshot::Sender<Result<ObjectMetadata>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Streams may be created and parts are reporting in
    Uploading,
    /// Every part reported; compose is running outside the lock
    Composing,
    Finished,
}

struct State {
    phase: Phase,
    outstanding: usize,
    next_index: usize,
    /// First error wins; a compose result only lands here if it is still empty
    result: Option<Result<ObjectMetadata>>,
    sources: Vec<Option<ComposeSource>>,
    waiters: Vec<Waiter>,
    /// Cleared once a cleanup run deleted everything
    cleanup: Option<CleanupRegistry>,
}

impl State {
    fn record_error(&mut self, error: UploadError) {
        if self.result.is_none() {
            self.result = Some(Err(error));
        } else {
            debug!("Discarding error after the first failure: {}", error);
        }
    }

    fn has_error(&self) -> bool {
        matches!(self.result, Some(Err(_)))
    }

    fn finish(&mut self) -> (Vec<Waiter>, Result<ObjectMetadata>) {
        self.phase = Phase::Finished;
        let result = self
            .result
            .get_or_insert_with(|| {
                Err(UploadError::Internal(
                    "parallel upload finished without a result".to_string(),
                ))
            })
            .clone();
        (std::mem::take(&mut self.waiters), result)
    }
}

/// Shared state of one parallel upload
///
/// Every [`StreamHandle`] holds a reference to the coordinator and reports
/// its outcome when closed. The last report finalizes the upload: compose
/// runs if no part failed, and the single final result is handed to every
/// waiter registered through [`wait_for_completion`](Self::wait_for_completion).
pub struct UploadCoordinator {
    state: Mutex<State>,
    composer: Box<dyn Composer>,
    cleanup_status: OnceCell<Result<()>>,
}

impl UploadCoordinator {
    pub fn new(composer: Box<dyn Composer>, deleter: Arc<dyn Deleter>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                phase: Phase::Uploading,
                outstanding: 0,
                next_index: 0,
                result: None,
                sources: Vec::new(),
                waiters: Vec::new(),
                cleanup: Some(CleanupRegistry::new(deleter)),
            }),
            composer,
            cleanup_status: OnceCell::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new part and bind it to the next shard index
    ///
    /// A failure to open the session is recorded as the upload's error and
    /// does not count as a part.
    pub async fn create_stream<O>(
        self: &Arc<Self>,
        opener: &O,
        request: &UploadRequest,
    ) -> Result<StreamHandle>
    where
        O: SessionOpener + ?Sized,
    {
        let session = match opener.open(request).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to open upload session for {}: {}", request.object, e);
                self.fail(e.clone());
                return Err(e);
            }
        };

        let index = {
            let mut state = self.state();
            if state.phase == Phase::Uploading {
                let index = state.next_index;
                state.next_index += 1;
                state.outstanding += 1;
                Some(index)
            } else {
                None
            }
        };

        match index {
            Some(index) => {
                debug!("Opened stream {} for {}", index, request.object);
                Ok(StreamHandle::new(Arc::clone(self), index, session))
            }
            None => {
                if let Err(e) = session.abort().await {
                    warn!("Failed to abort session for {}: {}", request.object, e);
                }
                Err(UploadError::FailedPrecondition(
                    "parallel upload already finished, cannot add more streams".to_string(),
                ))
            }
        }
    }

    /// Record a failure for the whole upload; only the first one is kept
    pub fn fail(&self, error: UploadError) {
        self.state().record_error(error);
    }

    /// Resolves with the final result once every part has reported
    pub fn wait_for_completion(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        let cached = match state.phase {
            Phase::Finished => state.result.clone(),
            _ => None,
        };
        match cached {
            Some(result) => {
                let _ = tx.send(result);
            }
            None => state.waiters.push(tx),
        }
        Completion { rx }
    }

    /// Delete every temporary object the upload created
    ///
    /// Only allowed once the upload has finished. The delete runs once; every
    /// call returns its status.
    pub async fn eager_cleanup(&self) -> Result<()> {
        if !self.is_finished() {
            return Err(UploadError::FailedPrecondition(
                "attempted to clean up parallel upload state while it is still in progress"
                    .to_string(),
            ));
        }

        self.cleanup_status
            .get_or_init(|| async {
                // the registry stays in place until the delete returns, so a
                // cancelled call leaves it for the next one
                let registry = self.state().cleanup.clone();
                let Some(registry) = registry else {
                    return Ok(());
                };
                let res = registry.execute_delete().await;
                if res.is_ok() {
                    self.state().cleanup = None;
                }
                res
            })
            .await
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state().phase == Phase::Finished
    }

    pub fn outstanding_parts(&self) -> usize {
        self.state().outstanding
    }

    /// Objects currently waiting for cleanup
    pub fn pending_cleanup(&self) -> Vec<ObjectMetadata> {
        self.state()
            .cleanup
            .as_ref()
            .map(|registry| registry.objects().to_vec())
            .unwrap_or_default()
    }

    pub(crate) async fn report_part_result(&self, index: usize, result: &Result<ObjectMetadata>) {
        let Some(sources) = self.settle_part(index, result) else {
            return;
        };

        info!("All {} parts uploaded, composing", sources.len());
        let mut guard = ComposeGuard {
            coordinator: self,
            armed: true,
        };
        let composed = self.composer.compose(sources).await;
        guard.armed = false;

        let (waiters, result) = {
            let mut state = self.state();
            match composed {
                Ok(metadata) if state.result.is_none() => state.result = Some(Ok(metadata)),
                Ok(metadata) => {
                    warn!(
                        "Upload failed while composing, scheduling {} for cleanup",
                        metadata.name
                    );
                    if let Some(registry) = state.cleanup.as_mut() {
                        registry.add(metadata);
                    }
                }
                Err(e) => state.record_error(e),
            }
            state.finish()
        };
        publish(waiters, result);
    }

    /// Resolve a part that can no longer report through `close`
    pub(crate) fn abandon_part(&self, index: usize, error: UploadError) {
        // The error is recorded before the count is checked, so this never composes.
        let _ = self.settle_part(index, &Err(error));
    }

    /// Book-keep one finished part
    ///
    /// Returns the compose sources when this was the last part and nothing
    /// failed; the caller then owns the compose step. On the failure path the
    /// result is published here.
    fn settle_part(
        &self,
        index: usize,
        result: &Result<ObjectMetadata>,
    ) -> Option<Vec<ComposeSource>> {
        let (waiters, result) = {
            let mut state = self.state();
            state.outstanding = state.outstanding.saturating_sub(1);
            match result {
                Ok(metadata) => {
                    debug!("Part {} finished as {}", index, metadata.name);
                    if state.sources.len() <= index {
                        state.sources.resize(index + 1, None);
                    }
                    state.sources[index] = Some(metadata.compose_source());
                    if let Some(registry) = state.cleanup.as_mut() {
                        registry.add(metadata.clone());
                    }
                }
                Err(e) => {
                    debug!("Part {} failed: {}", index, e);
                    state.record_error(e.clone());
                }
            }

            if state.outstanding > 0 || state.phase != Phase::Uploading {
                return None;
            }
            if !state.has_error() {
                state.phase = Phase::Composing;
                return Some(state.sources.iter().flatten().cloned().collect());
            }
            state.finish()
        };

        publish(waiters, result);
        None
    }
}

impl Drop for UploadCoordinator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.phase == Phase::Finished {
            return;
        }

        warn!(
            "Parallel upload dropped with {} of {} parts unfinished",
            state.outstanding, state.next_index
        );
        state.record_error(UploadError::Cancelled(
            "parallel upload abandoned before every part reported".to_string(),
        ));
        let (waiters, result) = state.finish();
        publish(waiters, result);
    }
}

/// Publishes a cancellation if the compose future is dropped mid-flight
struct ComposeGuard<'a> {
    coordinator: &'a UploadCoordinator,
    armed: bool,
}

impl Drop for ComposeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (waiters, result) = {
            let mut state = self.coordinator.state();
            state.record_error(UploadError::Cancelled(
                "compose interrupted before it completed".to_string(),
            ));
            state.finish()
        };
        publish(waiters, result);
    }
}

fn publish(waiters: Vec<Waiter>, result: Result<ObjectMetadata>) {
    match &result {
        Ok(metadata) => info!("Parallel upload finished: {}", metadata.name),
        Err(e) => warn!("Parallel upload failed: {}", e),
    }
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

/// Final result of a parallel upload
///
/// Returned by [`UploadCoordinator::wait_for_completion`]; each waiter gets
/// its own `Completion` and all of them resolve to the same value.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<ObjectMetadata>>,
}

impl Future for Completion {
    type Output = Result<ObjectMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(UploadError::Cancelled(
                    "parallel upload dropped before completion".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::ObjectBackend;
    use crate::upload::testing::{MemoryStore, destination, request};
    use bytes::Bytes;
    use std::time::Duration;

    fn coordinator(store: &MemoryStore) -> Arc<UploadCoordinator> {
        UploadCoordinator::new(store.composer(&destination()), store.deleter())
    }

    async fn open_parts(
        coordinator: &Arc<UploadCoordinator>,
        store: &MemoryStore,
        count: usize,
    ) -> Vec<StreamHandle> {
        let mut handles = Vec::new();
        for i in 0..count {
            let handle = coordinator
                .create_stream(store, &request(&format!("part-{}", i)))
                .await
                .unwrap();
            handles.push(handle);
        }
        handles
    }

    #[tokio::test]
    async fn test_all_parts_succeed_composes_in_shard_order() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 3).await;
        assert_eq!(coordinator.outstanding_parts(), 3);

        for (i, handle) in handles.iter_mut().enumerate() {
            handle.write(Bytes::from(format!("{}", i))).await.unwrap();
        }
        // finish out of order
        for i in [2, 0, 1] {
            handles[i].close().await.unwrap();
        }

        let metadata = coordinator.wait_for_completion().await.unwrap();
        assert_eq!(metadata.name, "final");
        assert_eq!(store.get("final").unwrap(), b"012");
        assert_eq!(
            store.compose_calls(),
            vec![vec!["part-0", "part-1", "part-2"]]
        );
        assert!(coordinator.is_finished());
        assert_eq!(coordinator.outstanding_parts(), 0);
    }

    #[tokio::test]
    async fn test_failed_part_skips_compose_and_keeps_error() {
        let store = MemoryStore::new();
        let read_error = UploadError::Internal("cannot read from file source".to_string());
        store.fail_close("part-1", read_error.clone());

        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 3).await;
        for handle in handles.iter_mut() {
            let _ = handle.close().await;
        }

        assert_eq!(coordinator.wait_for_completion().await, Err(read_error));
        assert!(store.compose_calls().is_empty());

        let pending: Vec<_> = coordinator
            .pending_cleanup()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(pending, vec!["part-0", "part-2"]);

        coordinator.eager_cleanup().await.unwrap();
        assert_eq!(store.delete_calls(), vec![vec!["part-0", "part-2"]]);
        assert!(!store.contains("part-0"));
        assert!(!store.contains("part-2"));
    }

    #[tokio::test]
    async fn test_first_failure_by_completion_order_wins() {
        let store = MemoryStore::new();
        let first = UploadError::Internal("part 2 broke".to_string());
        store.fail_close("part-0", UploadError::Internal("part 0 broke".to_string()));
        store.fail_close("part-2", first.clone());

        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 3).await;
        for i in [2, 0, 1] {
            let _ = handles[i].close().await;
        }

        assert_eq!(coordinator.wait_for_completion().await, Err(first));
        assert!(store.compose_calls().is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_is_recorded_without_counting_a_part() {
        let store = MemoryStore::new();
        let denied = UploadError::AccessDenied {
            bucket: "test-bucket".to_string(),
            message: "Access Denied".to_string(),
        };
        store.fail_open("part-0", denied.clone());

        let coordinator = coordinator(&store);
        let err = coordinator
            .create_stream(&store, &request("part-0"))
            .await
            .unwrap_err();
        assert_eq!(err, denied);
        assert_eq!(coordinator.outstanding_parts(), 0);
        assert!(!coordinator.is_finished());

        let mut first = coordinator
            .create_stream(&store, &request("part-1"))
            .await
            .unwrap();
        let mut second = coordinator
            .create_stream(&store, &request("part-2"))
            .await
            .unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(coordinator.outstanding_parts(), 2);

        first.close().await.unwrap();
        second.close().await.unwrap();

        assert_eq!(coordinator.wait_for_completion().await, Err(denied));
        assert!(store.compose_calls().is_empty());
        coordinator.eager_cleanup().await.unwrap();
        assert_eq!(store.delete_calls(), vec![vec!["part-1", "part-2"]]);
    }

    #[tokio::test]
    async fn test_fail_keeps_only_the_first_error() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;

        let first = UploadError::Cancelled("first".to_string());
        coordinator.fail(first.clone());
        coordinator.fail(UploadError::Internal("second".to_string()));
        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }

        assert_eq!(coordinator.wait_for_completion().await, Err(first));
        assert!(store.compose_calls().is_empty());
    }

    #[tokio::test]
    async fn test_compose_failure_becomes_final_result() {
        let store = MemoryStore::new();
        let compose_error = UploadError::Remote {
            operation: "Compose".to_string(),
            message: "service unavailable".to_string(),
        };
        store.fail_compose(compose_error.clone());

        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;
        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }

        assert_eq!(coordinator.wait_for_completion().await, Err(compose_error));
        assert_eq!(store.compose_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_waiters_before_and_after_finalize_agree() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;

        let early = coordinator.wait_for_completion();
        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }
        let late = coordinator.wait_for_completion();

        let early = early.await;
        assert!(early.is_ok());
        assert_eq!(early, late.await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_waiters_across_threads() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let handles = open_parts(&coordinator, &store, 8).await;

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.wait_for_completion().await })
            })
            .collect();

        let workers: Vec<_> = handles
            .into_iter()
            .map(|mut handle| {
                tokio::spawn(async move {
                    handle.write(Bytes::from_static(b"x")).await?;
                    handle.close().await
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }

        let expected = coordinator.wait_for_completion().await.unwrap();
        assert_eq!(expected.size, 8);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(expected.clone()));
        }
        assert_eq!(store.compose_calls().len(), 1);
        assert_eq!(store.compose_calls()[0].len(), 8);
    }

    #[tokio::test]
    async fn test_eager_cleanup_requires_finish_and_runs_once() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;

        let err = coordinator.eager_cleanup().await.unwrap_err();
        assert!(matches!(err, UploadError::FailedPrecondition(_)));

        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }
        coordinator.wait_for_completion().await.unwrap();

        assert_eq!(coordinator.eager_cleanup().await, Ok(()));
        assert_eq!(coordinator.eager_cleanup().await, Ok(()));
        assert_eq!(store.delete_calls(), vec![vec!["part-0", "part-1"]]);
        assert!(store.contains("final"));
    }

    #[tokio::test]
    async fn test_eager_cleanup_caches_failure() {
        let store = MemoryStore::new();
        let delete_error = UploadError::Remote {
            operation: "DeleteObjects".to_string(),
            message: "throttled".to_string(),
        };
        store.fail_delete(delete_error.clone());

        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 1).await;
        handles[0].close().await.unwrap();

        assert_eq!(coordinator.eager_cleanup().await, Err(delete_error.clone()));
        assert_eq!(coordinator.eager_cleanup().await, Err(delete_error));
        assert_eq!(store.delete_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_eager_cleanup_runs_again() {
        let store = MemoryStore::new();
        let delete_error = UploadError::Remote {
            operation: "DeleteObjects".to_string(),
            message: "throttled".to_string(),
        };
        store.delay_delete(Duration::from_millis(200));
        store.fail_delete(delete_error.clone());

        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;
        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }
        coordinator.wait_for_completion().await.unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), coordinator.eager_cleanup()).await;
        assert!(cancelled.is_err());
        assert_eq!(coordinator.pending_cleanup().len(), 2);

        assert_eq!(coordinator.eager_cleanup().await, Err(delete_error.clone()));
        assert_eq!(coordinator.eager_cleanup().await, Err(delete_error));
        assert_eq!(store.delete_calls().len(), 2);
        // nothing was deleted, so the objects are still owed
        assert_eq!(coordinator.pending_cleanup().len(), 2);
    }

    #[tokio::test]
    async fn test_successful_cleanup_clears_pending_objects() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;
        for handle in handles.iter_mut() {
            handle.close().await.unwrap();
        }

        assert_eq!(coordinator.pending_cleanup().len(), 2);
        coordinator.eager_cleanup().await.unwrap();
        assert!(coordinator.pending_cleanup().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_handle_resolves_the_part() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 2).await;

        handles[0].close().await.unwrap();
        drop(handles);

        let res = coordinator.wait_for_completion().await;
        assert!(matches!(res, Err(UploadError::Cancelled(_))));
        assert_eq!(coordinator.outstanding_parts(), 0);
        assert!(store.compose_calls().is_empty());
    }

    #[tokio::test]
    async fn test_stream_rejected_after_finish() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let mut handles = open_parts(&coordinator, &store, 1).await;
        handles[0].close().await.unwrap();

        let err = coordinator
            .create_stream(&store, &request("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::FailedPrecondition(_)));
        assert_eq!(store.aborted(), vec!["late"]);
        assert!(coordinator.wait_for_completion().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_coordinator_releases_waiters() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        let completion = coordinator.wait_for_completion();

        drop(coordinator);
        assert!(matches!(completion.await, Err(UploadError::Cancelled(_))));
    }
}
