use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::daemon::events::JobEvent;
use crate::errors::DownloaderError;
use crate::models::{DaemonConfig, Job, JobId, JobStatus, JobTransition};
use crate::storage::RecordStore;

enum StoreCommand {
    Create {
        job: Job,
        reply: oneshot::Sender<Result<(), DownloaderError>>,
    },
    Transition(JobTransition),
    Delete {
        id: JobId,
        reply: oneshot::Sender<Result<bool, DownloaderError>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the job record store.
///
/// Every mutation is queued to a single writer task, which persists the new
/// record before publishing it to the read cache. Reads never touch disk.
#[derive(Clone)]
pub struct JobRecordStore {
    tx: mpsc::Sender<StoreCommand>,
    cache: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl JobRecordStore {
    /// Spawn the writer task over `records`, seeding the cache with `initial`.
    pub fn spawn(
        records: Arc<dyn RecordStore>,
        initial: Vec<Job>,
        event_tx: broadcast::Sender<JobEvent>,
        config: &DaemonConfig,
    ) -> (Self, JoinHandle<()>) {
        let cache: HashMap<JobId, Job> = initial.into_iter().map(|job| (job.id, job)).collect();
        let cache = Arc::new(RwLock::new(cache));
        let (tx, rx) = mpsc::channel(config.store_queue_capacity.max(1));

        let writer = StoreWriter {
            records,
            cache: cache.clone(),
            rx,
            event_tx,
            unsaved: HashMap::new(),
            retry_attempts: config.persist_retry_attempts,
            retry_backoff: Duration::from_millis(config.persist_retry_backoff_ms),
        };
        let handle = tokio::spawn(writer.run());

        (Self { tx, cache }, handle)
    }

    /// Persist the initial record of a new job and wait until it is durable.
    pub async fn create(&self, job: Job) -> Result<(), DownloaderError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Create { job, reply }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    /// Queue a state change. The outcome is observed through `read`.
    pub async fn submit(&self, transition: JobTransition) {
        let job_id = transition.job_id;
        if self.tx.send(StoreCommand::Transition(transition)).await.is_err() {
            tracing::error!("Store writer is gone; dropping transition for job {}", job_id);
        }
    }

    /// Latest durable record for `id`.
    pub async fn read(&self, id: JobId) -> Result<Job, DownloaderError> {
        self.cache
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DownloaderError::NotFound(format!("Job {} not found", id)))
    }

    /// All records, sorted by id.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.cache.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Remove the record and its payload.
    pub async fn delete(&self, id: JobId) -> Result<(), DownloaderError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Delete { id, reply }).await?;
        match rx.await.map_err(|_| writer_gone())? {
            Ok(true) => Ok(()),
            Ok(false) => Err(DownloaderError::NotFound(format!("Job {} not found", id))),
            Err(e) => Err(e),
        }
    }

    /// Wait until every command queued before this call has been handled.
    pub async fn flush(&self) -> Result<(), DownloaderError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Flush { reply }).await?;
        rx.await.map_err(|_| writer_gone())
    }

    async fn send(&self, cmd: StoreCommand) -> Result<(), DownloaderError> {
        self.tx.send(cmd).await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> DownloaderError {
    DownloaderError::Internal("store writer is not running".to_string())
}

/// Map a storage error to a domain error, keeping typed errors intact.
fn into_domain(err: anyhow::Error) -> DownloaderError {
    match err.downcast::<DownloaderError>() {
        Ok(domain) => domain,
        Err(other) => DownloaderError::Persistence(format!("{:#}", other)),
    }
}

/// Errors that no amount of retrying will fix.
fn is_permanent(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DownloaderError>(),
        Some(DownloaderError::Conflict(_)) | Some(DownloaderError::NotFound(_))
    )
}

struct StoreWriter {
    records: Arc<dyn RecordStore>,
    cache: Arc<RwLock<HashMap<JobId, Job>>>,
    rx: mpsc::Receiver<StoreCommand>,
    event_tx: broadcast::Sender<JobEvent>,
    /// Snapshots whose save ran out of retries. The next transition for the
    /// job builds on these, so a lost write is carried into the next save
    /// instead of stranding the job behind the last durable record.
    unsaved: HashMap<JobId, Job>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl StoreWriter {
    async fn run(mut self) {
        tracing::debug!("Store writer started");
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                StoreCommand::Create { job, reply } => {
                    let result = self.handle_create(job).await;
                    let _ = reply.send(result);
                }
                StoreCommand::Transition(transition) => self.handle_transition(transition).await,
                StoreCommand::Delete { id, reply } => {
                    let result = self.handle_delete(id).await;
                    let _ = reply.send(result);
                }
                StoreCommand::Flush { reply } => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::debug!("Store writer stopped");
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_permanent(&e) || attempt >= self.retry_attempts => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        "Failed to {} (attempt {}/{}): {:#}",
                        what,
                        attempt,
                        self.retry_attempts + 1,
                        e
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
            }
        }
    }

    async fn handle_create(&self, job: Job) -> Result<(), DownloaderError> {
        let what = format!("create record for job {}", job.id);
        let records = &self.records;
        if let Err(e) = self.with_retry(&what, || records.insert(&job)).await {
            tracing::error!("Failed to {}: {:#}", what, e);
            return Err(into_domain(e));
        }

        tracing::debug!("Job {} recorded as pending", job.id);
        let event = JobEvent::Submitted {
            job_id: job.id,
            source_url: job.source_url.clone(),
            resource_name: job.resource_name.clone(),
            timestamp: job.submitted_at,
        };
        self.cache.write().await.insert(job.id, job);
        let _ = self.event_tx.send(event);
        Ok(())
    }

    async fn handle_transition(&mut self, transition: JobTransition) {
        let id = transition.job_id;
        let durable = self.cache.read().await.get(&id).cloned();
        let Some(durable) = durable else {
            self.unsaved.remove(&id);
            tracing::warn!(
                "Dropping {} transition for unknown job {}",
                transition.status,
                id
            );
            return;
        };

        let base = self.unsaved.get(&id).cloned().unwrap_or_else(|| durable.clone());
        let next = match base.apply(&transition) {
            Ok(next) => next,
            Err(rejected) => {
                tracing::warn!("Rejected transition: {}", rejected);
                return;
            }
        };

        if next == durable {
            self.unsaved.remove(&id);
            tracing::debug!("Job {} already {}", id, next.status);
            return;
        }

        let what = format!("persist job {} as {}", id, next.status);
        let records = &self.records;
        if let Err(e) = self.with_retry(&what, || records.save(&next)).await {
            if matches!(
                e.downcast_ref::<DownloaderError>(),
                Some(DownloaderError::NotFound(_))
            ) {
                self.unsaved.remove(&id);
                tracing::warn!("Job {} was removed before it became {}", id, next.status);
                return;
            }
            tracing::error!("Failed to {}: {:#}", what, e);
            let _ = self.event_tx.send(JobEvent::PersistFailed {
                job_id: id,
                status: next.status,
                error: format!("{:#}", e),
                timestamp: Utc::now(),
            });
            self.unsaved.insert(id, next);
            return;
        }
        self.unsaved.remove(&id);

        tracing::info!("Job {} is now {}", id, next.status);
        let mut events = Vec::new();
        if durable.status == JobStatus::Pending && next.status != JobStatus::Pending {
            if let Some(started_at) = next.started_at {
                events.push(JobEvent::Started {
                    job_id: id,
                    timestamp: started_at,
                });
            }
        }
        match next.status {
            JobStatus::Succeeded => events.push(JobEvent::Succeeded {
                job_id: id,
                timestamp: next.ended_at.unwrap_or(transition.at),
            }),
            JobStatus::Failed => events.push(JobEvent::Failed {
                job_id: id,
                error: transition.reason.clone().unwrap_or_default(),
                timestamp: next.ended_at.unwrap_or(transition.at),
            }),
            JobStatus::Pending | JobStatus::InProgress => {}
        }
        self.cache.write().await.insert(id, next);
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    async fn handle_delete(&mut self, id: JobId) -> Result<bool, DownloaderError> {
        let what = format!("remove job {}", id);
        let records = &self.records;
        let removed = match self.with_retry(&what, || records.remove(id)).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Failed to {}: {:#}", what, e);
                return Err(into_domain(e));
            }
        };

        self.unsaved.remove(&id);
        let cached = self.cache.write().await.remove(&id).is_some();
        if removed || cached {
            tracing::info!("Job {} deleted", id);
            let _ = self.event_tx.send(JobEvent::Deleted {
                job_id: id,
                timestamp: Utc::now(),
            });
        }
        Ok(removed || cached)
    }
}
