use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::fetch::ChunkStream;
use crate::models::Job;

/// Stores downloaded bytes next to the job's manifest.
///
/// Bytes stream into `data.<ext>.part` and are renamed to `data.<ext>` only
/// once the body has been read to the end, so a finished payload is never
/// confused with a partial one.
pub struct FsPayloadStore {
    requests_dir: PathBuf,
}

impl FsPayloadStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            requests_dir: data_dir.join("requests"),
        }
    }

    /// Final location of a job's payload.
    pub fn payload_path(&self, job: &Job) -> PathBuf {
        let file_name = match Path::new(&job.resource_name)
            .extension()
            .and_then(|e| e.to_str())
        {
            Some(ext) if !ext.is_empty() => format!("data.{}", ext),
            _ => "data".to_string(),
        };
        self.requests_dir.join(job.id.to_string()).join(file_name)
    }

    fn partial_path(&self, job: &Job) -> PathBuf {
        let mut path = self.payload_path(job).into_os_string();
        path.push(".part");
        PathBuf::from(path)
    }

    /// Drain `chunks` into the job's payload file. Returns the byte count.
    ///
    /// The job directory must already exist; it is not recreated, so a job
    /// deleted mid-transfer fails here instead of reappearing on disk.
    pub async fn write_stream(&self, job: &Job, mut chunks: ChunkStream) -> Result<u64> {
        let partial = self.partial_path(job);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial)
            .await
            .with_context(|| format!("Failed to open payload file for job {}", job.id))?;

        let mut written: u64 = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .context("Failed to write payload chunk")?;
            written += chunk.len() as u64;
        }

        file.flush().await.context("Failed to flush payload file")?;
        file.sync_all().await.context("Failed to sync payload file")?;
        drop(file);

        tokio::fs::rename(&partial, self.payload_path(job))
            .await
            .context("Failed to move payload into place")?;

        Ok(written)
    }

    /// Remove a half-written payload, if any.
    pub async fn discard_partial(&self, job: &Job) -> Result<()> {
        let partial = self.partial_path(job);
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove partial payload"),
        }
    }
}
