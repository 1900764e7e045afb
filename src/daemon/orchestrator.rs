use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::daemon::executor::{Executor, FetchHandle};
use crate::daemon::store::JobRecordStore;
use crate::errors::DownloaderError;
use crate::models::job::validate_new_job;
use crate::models::{DaemonConfig, Job, JobId, NewJob};

/// Hands out job ids. Seeded once from recovery, never rewound.
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(first: JobId) -> Self {
        Self {
            next: AtomicU64::new(first.0),
        }
    }

    pub fn allocate(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next `allocate` call will return.
    pub fn peek(&self) -> JobId {
        JobId(self.next.load(Ordering::SeqCst))
    }
}

/// Entry point for job operations: create, read, list, delete and resume.
pub struct Orchestrator {
    store: JobRecordStore,
    executor: Executor,
    allocator: IdAllocator,
    active: Mutex<HashMap<JobId, FetchHandle>>,
    config: Arc<DaemonConfig>,
}

impl Orchestrator {
    pub fn new(
        store: JobRecordStore,
        executor: Executor,
        next_id: JobId,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            allocator: IdAllocator::new(next_id),
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Validate and record a new job, then launch its fetch.
    ///
    /// Returns once the pending record is durable; the fetch runs on.
    pub async fn create(&self, new: NewJob) -> Result<Job, DownloaderError> {
        let resource_name = validate_new_job(&new)?;
        let id = self.allocator.allocate();
        let job = Job::new_pending(
            id,
            new.source_url.trim().to_string(),
            resource_name,
            Utc::now(),
        );

        self.store.create(job.clone()).await?;
        tracing::info!("Job {} created for {}", id, job.source_url);

        self.launch(job.clone()).await;
        Ok(job)
    }

    /// Relaunch a job found incomplete at startup, under its original id.
    pub async fn resume(&self, job: Job) {
        if job.is_terminal() {
            tracing::debug!("Job {} is already {}; not resuming", job.id, job.status);
            return;
        }
        tracing::info!("Resuming job {} ({})", job.id, job.status);
        self.launch(job).await;
    }

    pub async fn read(&self, id: JobId) -> Result<Job, DownloaderError> {
        self.store.read(id).await
    }

    pub async fn list(&self) -> Vec<Job> {
        self.store.list().await
    }

    /// Cancel any in-flight fetch for `id`, then remove its record and payload.
    pub async fn delete(&self, id: JobId) -> Result<(), DownloaderError> {
        self.store.read(id).await?;

        let handle = self.active.lock().await.remove(&id);
        if let Some(handle) = handle {
            self.stop(handle).await;
        }

        self.store.delete(id).await
    }

    /// Number of fetches still running.
    pub async fn active_count(&self) -> usize {
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.join_handle.is_finished());
        active.len()
    }

    /// Cancel every in-flight fetch and wait for the store to drain.
    ///
    /// Cancelled jobs keep their non-terminal status and are picked up by
    /// the next recovery.
    pub async fn shutdown(&self) {
        let handles: Vec<FetchHandle> = self.active.lock().await.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            tracing::info!("Cancelling {} in-flight fetch(es)", handles.len());
        }
        for handle in handles {
            self.stop(handle).await;
        }
        if let Err(e) = self.store.flush().await {
            tracing::error!("Failed to flush job store: {}", e);
        }
    }

    async fn launch(&self, job: Job) {
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.join_handle.is_finished());
        let handle = self.executor.spawn_fetch(job);
        active.insert(handle.job_id, handle);
    }

    /// Signal a fetch to stop and wait for it, aborting it after the grace period.
    async fn stop(&self, handle: FetchHandle) {
        let FetchHandle {
            job_id,
            join_handle,
            cancel_tx,
        } = handle;
        if join_handle.is_finished() {
            return;
        }

        let _ = cancel_tx.send(());
        let abort = join_handle.abort_handle();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, join_handle).await.is_err() {
            tracing::warn!("Fetch for job {} did not stop in time; aborting", job_id);
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::events::JobEvent;
    use crate::fetch::{Fetcher, MockFetcher};
    use crate::models::JobStatus;
    use crate::storage::payloads::FsPayloadStore;
    use crate::storage::records::FsRecordStore;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    async fn setup_orchestrator(fetcher: MockFetcher) -> (Orchestrator, TempDir) {
        let tmp = TempDir::new().expect("create temp dir");
        let config = Arc::new(DaemonConfig {
            shutdown_grace_secs: 2,
            ..DaemonConfig::default()
        });
        let records = Arc::new(
            FsRecordStore::new(tmp.path().to_path_buf())
                .await
                .expect("create record store"),
        );
        let (event_tx, _) = broadcast::channel::<JobEvent>(256);
        let (store, _writer) = JobRecordStore::spawn(records, Vec::new(), event_tx, &config);
        let executor = Executor::new(
            store.clone(),
            Arc::new(fetcher) as Arc<dyn Fetcher>,
            Arc::new(FsPayloadStore::new(tmp.path())),
            config.clone(),
        );
        (Orchestrator::new(store, executor, JobId(1), config), tmp)
    }

    fn new_job(url: &str) -> NewJob {
        NewJob {
            source_url: url.to_string(),
        }
    }

    async fn wait_for_terminal(orchestrator: &Orchestrator, id: JobId) -> Job {
        for _ in 0..100 {
            let job = orchestrator.read(id).await.expect("read");
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached a terminal state", id);
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let allocator = IdAllocator::new(JobId(7));
        assert_eq!(allocator.peek(), JobId(7));
        assert_eq!(allocator.allocate(), JobId(7));
        assert_eq!(allocator.allocate(), JobId(8));
        assert_eq!(allocator.peek(), JobId(9));
    }

    #[tokio::test]
    async fn test_create_returns_fresh_ids_and_is_readable() {
        let (orchestrator, _tmp) =
            setup_orchestrator(MockFetcher::with_chunks(vec![b"x".to_vec()])).await;

        let first = orchestrator
            .create(new_job("http://x/y/file.png"))
            .await
            .expect("create");
        let second = orchestrator
            .create(new_job("http://x/y/other.png"))
            .await
            .expect("create");
        assert_eq!(first.id, JobId(1));
        assert_eq!(second.id, JobId(2));
        assert_eq!(first.resource_name, "file.png");

        let read = orchestrator.read(first.id).await.expect("read");
        assert!(matches!(
            read.status,
            JobStatus::Pending | JobStatus::InProgress | JobStatus::Succeeded
        ));
    }

    #[tokio::test]
    async fn test_create_runs_fetch_to_success() {
        let (orchestrator, tmp) =
            setup_orchestrator(MockFetcher::with_chunks(vec![b"png bytes".to_vec()])).await;
        let job = orchestrator
            .create(new_job("http://x/y/file.png"))
            .await
            .expect("create");

        let done = wait_for_terminal(&orchestrator, job.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(tmp.path().join("requests/1/data.png").exists());
    }

    #[tokio::test]
    async fn test_create_invalid_url_rejected_without_record() {
        let (orchestrator, tmp) = setup_orchestrator(MockFetcher::with_chunks(vec![])).await;
        for url in ["", "not a url", "http://x/y/", "ftp://x/file.png"] {
            let result = orchestrator.create(new_job(url)).await;
            assert!(
                matches!(result, Err(DownloaderError::InvalidInput(_))),
                "{:?} should be rejected",
                url
            );
        }
        assert!(orchestrator.list().await.is_empty());
        let mut entries = tokio::fs::read_dir(tmp.path().join("requests"))
            .await
            .expect("read dir");
        assert!(entries.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn test_delete_cancels_in_flight_fetch() {
        let (orchestrator, tmp) =
            setup_orchestrator(MockFetcher::with_slow_chunks(vec![b"a".to_vec(); 100], 50)).await;
        let job = orchestrator
            .create(new_job("http://x/y/big.bin"))
            .await
            .expect("create");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(orchestrator.active_count().await, 1);

        orchestrator.delete(job.id).await.expect("delete");

        assert!(matches!(
            orchestrator.read(job.id).await,
            Err(DownloaderError::NotFound(_))
        ));
        assert_eq!(orchestrator.active_count().await, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tmp.path().join("requests/1").exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let (orchestrator, _tmp) = setup_orchestrator(MockFetcher::with_chunks(vec![])).await;
        assert!(matches!(
            orchestrator.delete(JobId(99)).await,
            Err(DownloaderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let (orchestrator, _tmp) =
            setup_orchestrator(MockFetcher::with_chunks(vec![b"x".to_vec()])).await;
        let first = orchestrator
            .create(new_job("http://x/a.txt"))
            .await
            .expect("create");
        wait_for_terminal(&orchestrator, first.id).await;
        orchestrator.delete(first.id).await.expect("delete");

        let second = orchestrator
            .create(new_job("http://x/b.txt"))
            .await
            .expect("create");
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_jobs_non_terminal() {
        let (orchestrator, _tmp) =
            setup_orchestrator(MockFetcher::with_slow_chunks(vec![b"a".to_vec(); 100], 50)).await;
        let job = orchestrator
            .create(new_job("http://x/y/big.bin"))
            .await
            .expect("create");
        tokio::time::sleep(Duration::from_millis(120)).await;

        orchestrator.shutdown().await;

        let after = orchestrator.read(job.id).await.expect("read");
        assert!(!after.is_terminal());
        assert_eq!(orchestrator.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_resume_terminal_job_is_ignored() {
        let (orchestrator, _tmp) = setup_orchestrator(MockFetcher::with_chunks(vec![])).await;
        let mut job = Job::new_pending(
            JobId(3),
            "http://x/done.txt".to_string(),
            "done.txt".to_string(),
            Utc::now(),
        );
        job.status = JobStatus::Succeeded;
        orchestrator.resume(job).await;
        assert_eq!(orchestrator.active_count().await, 0);
    }
}
