use std::sync::Arc;

use anyhow::Result;

use crate::errors::DownloaderError;
use crate::models::{Job, JobId, RecoveryPolicy};
use crate::storage::{RecordStore, ScannedRecord};

/// What the startup scan found on disk.
#[derive(Debug)]
pub struct RecoveryReport {
    /// Every readable record, in id order.
    pub records: Vec<Job>,
    /// Records left `pending` or `in_progress` by the previous run.
    pub incomplete: Vec<Job>,
    /// First id the allocator may hand out.
    pub next_id: JobId,
    /// Corrupt records passed over under `RecoveryPolicy::Skip`.
    pub skipped: Vec<JobId>,
    /// Directories without a manifest, removed during the scan.
    pub orphans: Vec<JobId>,
}

pub struct RecoveryScanner {
    records: Arc<dyn RecordStore>,
    policy: RecoveryPolicy,
}

impl RecoveryScanner {
    pub fn new(records: Arc<dyn RecordStore>, policy: RecoveryPolicy) -> Self {
        Self { records, policy }
    }

    /// Scan every job directory once, before anything else touches the store.
    pub async fn scan(&self) -> Result<RecoveryReport> {
        let scanned = self.records.scan().await?;
        let mut report = RecoveryReport {
            records: Vec::new(),
            incomplete: Vec::new(),
            next_id: JobId(1),
            skipped: Vec::new(),
            orphans: Vec::new(),
        };
        let mut highest: Option<JobId> = match self.records.watermark().await {
            Ok(watermark) => watermark,
            Err(e) if self.policy == RecoveryPolicy::Skip => {
                tracing::error!(
                    "Ignoring unreadable id watermark, using directory ids only: {:#}",
                    e
                );
                None
            }
            Err(e) => {
                return Err(DownloaderError::StartupCorruption(format!("{:#}", e)).into());
            }
        };

        for record in scanned {
            let id = record.id();
            highest = highest.max(Some(id));

            match record {
                ScannedRecord::Valid(job) => {
                    if !job.is_terminal() {
                        report.incomplete.push(job.clone());
                    }
                    report.records.push(job);
                }
                ScannedRecord::Corrupt { path, reason, .. } => match self.policy {
                    RecoveryPolicy::Abort => {
                        return Err(DownloaderError::StartupCorruption(format!(
                            "{}: {}",
                            path.display(),
                            reason
                        ))
                        .into());
                    }
                    RecoveryPolicy::Skip => {
                        tracing::error!(
                            "Skipping corrupt record for job {} at {}: {}",
                            id,
                            path.display(),
                            reason
                        );
                        report.skipped.push(id);
                    }
                },
                ScannedRecord::Orphan { path, .. } => {
                    tracing::warn!("Removing job directory without manifest: {}", path.display());
                    if let Err(e) = self.records.remove(id).await {
                        tracing::warn!("Failed to remove orphan directory for job {}: {:#}", id, e);
                    }
                    report.orphans.push(id);
                }
            }
        }

        report.next_id = highest.map_or(JobId(1), JobId::next);

        tracing::info!(
            "Recovery found {} record(s), {} incomplete, next id {}",
            report.records.len(),
            report.incomplete.len(),
            report.next_id
        );
        Ok(report)
    }
}
