use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::errors::DownloaderError;
use crate::models::{Job, JobId};
use crate::storage::{RecordStore, ScannedRecord};

const MANIFEST_FILE: &str = "manifest.json";
const WATERMARK_FILE: &str = "last_id";

/// Filesystem record store.
///
/// Layout:
/// ```text
/// {data_dir}/last_id                      highest id ever allocated
/// {data_dir}/requests/{id}/manifest.json  the job record
/// {data_dir}/requests/{id}/data.<ext>     the downloaded payload
/// ```
pub struct FsRecordStore {
    data_dir: PathBuf,
    requests_dir: PathBuf,
}

impl FsRecordStore {
    /// Create a new FsRecordStore rooted at data_dir/requests/.
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let requests_dir = data_dir.join("requests");
        tokio::fs::create_dir_all(&requests_dir)
            .await
            .context("Failed to create requests directory")?;
        Ok(Self {
            data_dir,
            requests_dir,
        })
    }

    pub fn requests_dir(&self) -> &Path {
        &self.requests_dir
    }

    fn job_dir(&self, id: JobId) -> PathBuf {
        self.requests_dir.join(id.to_string())
    }

    fn manifest_path(&self, id: JobId) -> PathBuf {
        self.job_dir(id).join(MANIFEST_FILE)
    }

    fn watermark_path(&self) -> PathBuf {
        self.data_dir.join(WATERMARK_FILE)
    }

    async fn write_manifest(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string_pretty(job).context("Failed to serialize job record")?;
        write_atomic(&self.manifest_path(job.id), json.as_bytes())
            .await
            .with_context(|| format!("Failed to write manifest for job {}", job.id))
    }

    async fn read_manifest(path: &Path) -> Result<Job> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let job = serde_json::from_str::<Job>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(job)
    }
}

/// Write `bytes` to a sibling `.tmp` file, then rename it over `path`.
/// Readers see either the old content or the new content, never a mix.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .await
        .with_context(|| format!("Failed to open {}", tmp_path.display()))?;
    file.write_all(bytes)
        .await
        .context("Failed to write temporary file")?;
    file.sync_all()
        .await
        .context("Failed to sync temporary file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to rename temporary file")?;

    // A fresh name only survives a crash once its directory entry is synced.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        let dir = tokio::fs::File::open(parent)
            .await
            .with_context(|| format!("Failed to open directory {}", parent.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to sync directory {}", parent.display()))?;
    }

    Ok(())
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn scan(&self) -> Result<Vec<ScannedRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.requests_dir)
            .await
            .context("Failed to read requests directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .map(JobId)
            else {
                tracing::warn!("Ignoring non-job directory {}", path.display());
                continue;
            };

            let manifest = path.join(MANIFEST_FILE);
            if !manifest.exists() {
                records.push(ScannedRecord::Orphan { id, path });
                continue;
            }

            match Self::read_manifest(&manifest).await {
                Ok(job) if job.id == id => records.push(ScannedRecord::Valid(job)),
                Ok(job) => records.push(ScannedRecord::Corrupt {
                    id,
                    path: manifest,
                    reason: format!("manifest claims id {} inside directory {}", job.id, id),
                }),
                Err(e) => records.push(ScannedRecord::Corrupt {
                    id,
                    path: manifest,
                    reason: format!("{:#}", e),
                }),
            }
        }

        records.sort_by_key(|r| r.id());
        Ok(records)
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_manifest(&path).await.map(Some)
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        if self.manifest_path(job.id).exists() {
            return Err(DownloaderError::Conflict(format!("Job id {} already used", job.id)).into());
        }

        // Record the id before anything else so it is never handed out again.
        let current = self.watermark().await?;
        if current.map_or(true, |w| job.id > w) {
            write_atomic(&self.watermark_path(), job.id.to_string().as_bytes())
                .await
                .context("Failed to update id watermark")?;
        }

        // A directory without a manifest is left over from a failed attempt.
        tokio::fs::create_dir_all(self.job_dir(job.id))
            .await
            .with_context(|| format!("Failed to create directory for job {}", job.id))?;
        self.write_manifest(job).await
    }

    async fn save(&self, job: &Job) -> Result<()> {
        if !self.job_dir(job.id).exists() {
            return Err(DownloaderError::NotFound(format!("Job {} has no record", job.id)).into());
        }
        self.write_manifest(job).await
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let dir = self.job_dir(id);
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to remove directory for job {}", id))?;
        Ok(true)
    }

    async fn watermark(&self) -> Result<Option<JobId>> {
        let path = self.watermark_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read id watermark")?;
        let id = content
            .parse::<JobId>()
            .with_context(|| format!("Failed to parse id watermark {}", path.display()))?;
        Ok(Some(id))
    }
}
