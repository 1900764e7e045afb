use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::DownloaderError;

/// Numeric job identity. Allocated once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn next(self) -> JobId {
        JobId(self.0.saturating_add(1))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DownloaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(JobId)
            .map_err(|_| DownloaderError::InvalidInput(format!("'{}' is not a valid job id", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted job record. One per job directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub resource_name: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_pending(
        id: JobId,
        source_url: String,
        resource_name: String,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_url,
            resource_name,
            status: JobStatus::Pending,
            submitted_at,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Compute the record that results from applying `transition`.
    ///
    /// Only the forward edges of the job state machine are accepted:
    /// pending -> in_progress, pending -> failed, in_progress -> succeeded and
    /// in_progress -> failed. Re-asserting the current non-terminal status is
    /// a no-op. Timestamps already set are never overwritten, and new ones are
    /// clamped so that `submitted_at <= started_at <= ended_at` holds.
    pub fn apply(&self, transition: &JobTransition) -> Result<Job, TransitionRejected> {
        if transition.job_id != self.id {
            return Err(TransitionRejected::WrongJob {
                expected: self.id,
                got: transition.job_id,
            });
        }

        let from = self.status;
        let to = transition.status;

        if from.is_terminal() {
            return Err(TransitionRejected::Terminal {
                id: self.id,
                status: from,
                requested: to,
            });
        }

        let mut next = self.clone();
        match (from, to) {
            (JobStatus::Pending, JobStatus::Pending)
            | (JobStatus::InProgress, JobStatus::InProgress) => {}
            (JobStatus::Pending, JobStatus::InProgress) => {
                next.status = JobStatus::InProgress;
                next.started_at = Some(transition.at.max(self.submitted_at));
            }
            (JobStatus::Pending, JobStatus::Failed)
            | (JobStatus::InProgress, JobStatus::Succeeded)
            | (JobStatus::InProgress, JobStatus::Failed) => {
                let floor = self.started_at.unwrap_or(self.submitted_at);
                next.status = to;
                next.ended_at = Some(transition.at.max(floor));
            }
            _ => {
                return Err(TransitionRejected::InvalidEdge {
                    id: self.id,
                    from,
                    to,
                })
            }
        }

        Ok(next)
    }
}

/// Body of a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(alias = "url")]
    pub source_url: String,
}

/// A requested change to a job's status and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub job_id: JobId,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    /// Why the job failed. Kept for logs and events only.
    pub reason: Option<String>,
}

impl JobTransition {
    pub fn started(job_id: JobId, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::InProgress,
            at,
            reason: None,
        }
    }

    pub fn succeeded(job_id: JobId, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            at,
            reason: None,
        }
    }

    pub fn failed(job_id: JobId, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            at,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionRejected {
    #[error("job {id} is already {status}; refusing move to {requested}")]
    Terminal {
        id: JobId,
        status: JobStatus,
        requested: JobStatus,
    },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidEdge {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("transition for job {got} applied to job {expected}")]
    WrongJob { expected: JobId, got: JobId },
}

/// Validate a NewJob and derive the resource name from its URL.
pub fn validate_new_job(new: &NewJob) -> Result<String, DownloaderError> {
    let raw = new.source_url.trim();
    if raw.is_empty() {
        return Err(DownloaderError::InvalidInput(
            "source_url cannot be empty".to_string(),
        ));
    }
    derive_resource_name(raw)
}

/// Derive the resource name from the last path segment of `source_url`.
///
/// Query strings and fragments are not part of the name. URLs without a
/// path segment, or ending in a slash, are rejected.
pub fn derive_resource_name(source_url: &str) -> Result<String, DownloaderError> {
    let url = reqwest::Url::parse(source_url).map_err(|e| {
        DownloaderError::InvalidInput(format!("Invalid source_url '{}': {}", source_url, e))
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DownloaderError::InvalidInput(format!(
                "Unsupported URL scheme '{}' (expected http or https)",
                other
            )))
        }
    }

    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    if name.is_empty() {
        return Err(DownloaderError::InvalidInput(format!(
            "source_url '{}' has no resource name in its path",
            source_url
        )));
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_job(status: JobStatus) -> Job {
        let mut job = Job::new_pending(
            JobId(1),
            "http://x/y/file.png".to_string(),
            "file.png".to_string(),
            Utc::now(),
        );
        job.status = status;
        job
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let mut job = make_job(JobStatus::Succeeded);
        job.started_at = Some(job.submitted_at + Duration::milliseconds(5));
        job.ended_at = Some(job.submitted_at + Duration::milliseconds(10));
        let json = serde_json::to_string(&job).expect("serialize");
        let deserialized: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(job, deserialized);
    }

    #[test]
    fn test_job_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
        let status: JobStatus = serde_json::from_str("\"succeeded\"").expect("deserialize");
        assert_eq!(status, JobStatus::Succeeded);
    }

    #[test]
    fn test_job_id_serializes_as_number() {
        let job = make_job(JobStatus::Pending);
        let value = serde_json::to_value(&job).expect("serialize");
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_job_id_from_str() {
        assert_eq!("42".parse::<JobId>().expect("parse"), JobId(42));
        assert!("abc".parse::<JobId>().is_err());
        assert!("-1".parse::<JobId>().is_err());
    }

    #[test]
    fn test_new_job_accepts_url_alias() {
        let new: NewJob = serde_json::from_str(r#"{"url":"http://x/a.txt"}"#).expect("deserialize");
        assert_eq!(new.source_url, "http://x/a.txt");
    }

    #[test]
    fn test_derive_resource_name_last_segment() {
        assert_eq!(
            derive_resource_name("http://x/y/file.png").expect("derive"),
            "file.png"
        );
    }

    #[test]
    fn test_derive_resource_name_ignores_query_and_fragment() {
        assert_eq!(
            derive_resource_name("https://cdn.example.com/a/b/report.pdf?sig=abc#page=2")
                .expect("derive"),
            "report.pdf"
        );
    }

    #[test]
    fn test_derive_resource_name_trailing_slash_rejected() {
        match derive_resource_name("http://x/y/") {
            Err(DownloaderError::InvalidInput(msg)) => assert!(msg.contains("no resource name")),
            other => panic!("Expected InvalidInput, got: {:?}", other),
        }
    }

    #[test]
    fn test_derive_resource_name_host_only_rejected() {
        assert!(derive_resource_name("http://example.com").is_err());
    }

    #[test]
    fn test_derive_resource_name_no_separator_rejected() {
        assert!(matches!(
            derive_resource_name("file.png"),
            Err(DownloaderError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_derive_resource_name_bad_scheme_rejected() {
        match derive_resource_name("ftp://x/file.png") {
            Err(DownloaderError::InvalidInput(msg)) => assert!(msg.contains("scheme")),
            other => panic!("Expected InvalidInput, got: {:?}", other),
        }
    }

    #[test]
    fn test_validate_new_job_empty_rejected() {
        let new = NewJob {
            source_url: "   ".to_string(),
        };
        assert!(matches!(
            validate_new_job(&new),
            Err(DownloaderError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_apply_pending_to_in_progress_sets_started_at() {
        let job = make_job(JobStatus::Pending);
        let at = job.submitted_at + Duration::seconds(1);
        let next = job.apply(&JobTransition::started(job.id, at)).expect("apply");
        assert_eq!(next.status, JobStatus::InProgress);
        assert_eq!(next.started_at, Some(at));
        assert!(next.ended_at.is_none());
    }

    #[test]
    fn test_apply_clamps_timestamps_non_decreasing() {
        let job = make_job(JobStatus::Pending);
        let before = job.submitted_at - Duration::seconds(5);
        let started = job.apply(&JobTransition::started(job.id, before)).expect("apply");
        assert_eq!(started.started_at, Some(job.submitted_at));

        let ended = started
            .apply(&JobTransition::succeeded(job.id, before))
            .expect("apply");
        assert!(ended.submitted_at <= ended.started_at.expect("started"));
        assert!(ended.started_at.expect("started") <= ended.ended_at.expect("ended"));
    }

    #[test]
    fn test_apply_pending_to_failed_leaves_started_unset() {
        let job = make_job(JobStatus::Pending);
        let next = job
            .apply(&JobTransition::failed(job.id, Utc::now(), "dns failure"))
            .expect("apply");
        assert_eq!(next.status, JobStatus::Failed);
        assert!(next.started_at.is_none());
        assert!(next.ended_at.is_some());
    }

    #[test]
    fn test_apply_in_progress_again_keeps_started_at() {
        let job = make_job(JobStatus::Pending);
        let first = job
            .apply(&JobTransition::started(job.id, job.submitted_at))
            .expect("apply");
        let later = first.submitted_at + Duration::minutes(3);
        let second = first
            .apply(&JobTransition::started(job.id, later))
            .expect("apply");
        assert_eq!(second.started_at, first.started_at);
    }

    #[test]
    fn test_apply_terminal_rejected() {
        for status in [JobStatus::Succeeded, JobStatus::Failed] {
            let job = make_job(status);
            let result = job.apply(&JobTransition::started(job.id, Utc::now()));
            assert!(matches!(result, Err(TransitionRejected::Terminal { .. })));
            let result = job.apply(&JobTransition::failed(job.id, Utc::now(), "late"));
            assert!(matches!(result, Err(TransitionRejected::Terminal { .. })));
        }
    }

    #[test]
    fn test_apply_pending_to_succeeded_rejected() {
        let job = make_job(JobStatus::Pending);
        let result = job.apply(&JobTransition::succeeded(job.id, Utc::now()));
        assert!(matches!(result, Err(TransitionRejected::InvalidEdge { .. })));
    }

    #[test]
    fn test_apply_backward_rejected() {
        let job = make_job(JobStatus::InProgress);
        let back = JobTransition {
            job_id: job.id,
            status: JobStatus::Pending,
            at: Utc::now(),
            reason: None,
        };
        assert!(matches!(
            job.apply(&back),
            Err(TransitionRejected::InvalidEdge { .. })
        ));
    }

    #[test]
    fn test_apply_wrong_job_rejected() {
        let job = make_job(JobStatus::Pending);
        let result = job.apply(&JobTransition::started(JobId(99), Utc::now()));
        assert!(matches!(result, Err(TransitionRejected::WrongJob { .. })));
    }
}
