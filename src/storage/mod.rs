pub mod payloads;
pub mod records;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Job, JobId};

/// One job directory as found on disk during a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannedRecord {
    Valid(Job),
    /// The manifest exists but cannot be parsed.
    Corrupt {
        id: JobId,
        path: PathBuf,
        reason: String,
    },
    /// The directory exists without a manifest (crash between mkdir and write).
    Orphan { id: JobId, path: PathBuf },
}

impl ScannedRecord {
    pub fn id(&self) -> JobId {
        match self {
            ScannedRecord::Valid(job) => job.id,
            ScannedRecord::Corrupt { id, .. } | ScannedRecord::Orphan { id, .. } => *id,
        }
    }
}

/// Durable job records, one per job id.
///
/// Implementations are only ever driven by the store writer task, so they do
/// not need to guard against concurrent writers themselves.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn scan(&self) -> Result<Vec<ScannedRecord>>;
    async fn load(&self, id: JobId) -> Result<Option<Job>>;
    /// Create the record for a new job. Fails with `Conflict` if the id exists.
    async fn insert(&self, job: &Job) -> Result<()>;
    /// Atomically replace an existing record.
    async fn save(&self, job: &Job) -> Result<()>;
    /// Remove the record and everything stored alongside it.
    async fn remove(&self, id: JobId) -> Result<bool>;
    /// Highest id ever handed to `insert`, including deleted ones.
    async fn watermark(&self) -> Result<Option<JobId>>;
}
