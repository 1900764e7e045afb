use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;

use crate::daemon::store::JobRecordStore;
use crate::errors::DownloaderError;
use crate::fetch::Fetcher;
use crate::models::{DaemonConfig, Job, JobId, JobTransition};
use crate::storage::payloads::FsPayloadStore;

/// Handle to an in-flight fetch, allowing monitoring and cancellation.
pub struct FetchHandle {
    pub job_id: JobId,
    pub join_handle: tokio::task::JoinHandle<()>,
    pub cancel_tx: oneshot::Sender<()>,
}

/// The Executor runs one fetch task per job and reports progress to the store.
pub struct Executor {
    store: JobRecordStore,
    fetcher: Arc<dyn Fetcher>,
    payloads: Arc<FsPayloadStore>,
    config: Arc<DaemonConfig>,
}

impl Executor {
    pub fn new(
        store: JobRecordStore,
        fetcher: Arc<dyn Fetcher>,
        payloads: Arc<FsPayloadStore>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            store,
            fetcher,
            payloads,
            config,
        }
    }

    /// Spawn the fetch for `job`, returning a FetchHandle for cancellation.
    ///
    /// The task never retries. A cancelled fetch leaves the record as it is
    /// and removes any partial payload.
    pub fn spawn_fetch(&self, job: Job) -> FetchHandle {
        let job_id = job.id;
        let store = self.store.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let payloads = Arc::clone(&self.payloads);
        let timeout_secs = self.config.fetch_timeout_secs;

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            tracing::info!("Fetching job {} from {}", job.id, job.source_url);

            let timeout_fut = if timeout_secs > 0 {
                tokio::time::sleep(Duration::from_secs(timeout_secs))
            } else {
                // Effectively no limit
                tokio::time::sleep(Duration::from_secs(u64::MAX / 2))
            };
            tokio::pin!(timeout_fut);

            let fetch = run_fetch(&job, fetcher.as_ref(), &payloads, &store);
            tokio::pin!(fetch);

            let outcome = tokio::select! {
                result = &mut fetch => result,
                Ok(()) = &mut cancel_rx => {
                    tracing::info!("Fetch for job {} cancelled", job.id);
                    if let Err(e) = payloads.discard_partial(&job).await {
                        tracing::warn!("Failed to clean up partial payload for job {}: {:#}", job.id, e);
                    }
                    return;
                }
                _ = &mut timeout_fut => Err(DownloaderError::Timeout(format!(
                    "fetch did not finish within {}s",
                    timeout_secs
                ))),
            };

            match outcome {
                Ok(bytes) => {
                    tracing::info!("Job {} fetched {} bytes", job.id, bytes);
                    store.submit(JobTransition::succeeded(job.id, Utc::now())).await;
                }
                Err(e) => {
                    tracing::warn!("Job {} failed: {}", job.id, e);
                    if let Err(e) = payloads.discard_partial(&job).await {
                        tracing::warn!("Failed to clean up partial payload for job {}: {:#}", job.id, e);
                    }
                    store
                        .submit(JobTransition::failed(job.id, Utc::now(), e.to_string()))
                        .await;
                }
            }
        });

        FetchHandle {
            job_id,
            join_handle,
            cancel_tx,
        }
    }
}

/// Open the source, mark the job started, then stream the body to disk.
async fn run_fetch(
    job: &Job,
    fetcher: &dyn Fetcher,
    payloads: &FsPayloadStore,
    store: &JobRecordStore,
) -> Result<u64, DownloaderError> {
    let body = fetcher.open(&job.source_url).await?;
    if let Some(len) = body.content_length {
        tracing::debug!("Job {} expects {} bytes", job.id, len);
    }

    store.submit(JobTransition::started(job.id, Utc::now())).await;

    payloads
        .write_stream(job, body.chunks)
        .await
        .map_err(|e| DownloaderError::Fetch(format!("{:#}", e)))
}
