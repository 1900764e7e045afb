use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{JobId, JobStatus};

/// Lifecycle notifications broadcast to SSE subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum JobEvent {
    Submitted {
        job_id: JobId,
        source_url: String,
        resource_name: String,
        timestamp: DateTime<Utc>,
    },
    Started {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    Succeeded {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: JobId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Deleted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A transition was accepted but could not be written to disk.
    PersistFailed {
        job_id: JobId,
        status: JobStatus,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Deleted { job_id, .. }
            | JobEvent::PersistFailed { job_id, .. } => *job_id,
        }
    }

    /// SSE event type name.
    pub fn event_name(&self) -> &'static str {
        match self {
            JobEvent::Submitted { .. } => "submitted",
            JobEvent::Started { .. } => "started",
            JobEvent::Succeeded { .. } => "succeeded",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Deleted { .. } => "deleted",
            JobEvent::PersistFailed { .. } => "persist_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[test]
    fn test_submitted_event_serializes() {
        let event = JobEvent::Submitted {
            job_id: JobId(3),
            source_url: "http://x/y/file.png".to_string(),
            resource_name: "file.png".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], "Submitted");
        assert_eq!(value["data"]["job_id"], 3);
        assert_eq!(value["data"]["resource_name"], "file.png");
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn test_succeeded_event_serializes() {
        let event = JobEvent::Succeeded {
            job_id: JobId(1),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"Succeeded\""));
        assert!(json.contains("\"job_id\":1"));
    }

    #[test]
    fn test_failed_event_serializes() {
        let event = JobEvent::Failed {
            job_id: JobId(1),
            error: "connection refused".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"Failed\""));
        assert!(json.contains("\"error\":\"connection refused\""));
    }

    #[test]
    fn test_persist_failed_event_carries_status() {
        let event = JobEvent::PersistFailed {
            job_id: JobId(8),
            status: JobStatus::Succeeded,
            error: "disk full".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], "PersistFailed");
        assert_eq!(value["data"]["status"], "succeeded");
    }

    #[test]
    fn test_job_id_accessor() {
        let now = Utc::now();
        let events = vec![
            JobEvent::Started { job_id: JobId(4), timestamp: now },
            JobEvent::Deleted { job_id: JobId(4), timestamp: now },
            JobEvent::Failed {
                job_id: JobId(4),
                error: String::new(),
                timestamp: now,
            },
        ];
        for event in events {
            assert_eq!(event.job_id(), JobId(4));
        }
    }

    #[tokio::test]
    async fn test_broadcast_two_subscribers_both_receive() {
        let (tx, mut rx1) = broadcast::channel::<JobEvent>(16);
        let mut rx2 = tx.subscribe();

        tx.send(JobEvent::Started {
            job_id: JobId(11),
            timestamp: Utc::now(),
        })
        .expect("send");

        let received1 = rx1.recv().await.expect("recv1");
        let received2 = rx2.recv().await.expect("recv2");
        assert_eq!(received1.job_id(), JobId(11));
        assert_eq!(received2.job_id(), JobId(11));
    }

    #[tokio::test]
    async fn test_broadcast_lagged_subscriber() {
        let (tx, mut rx) = broadcast::channel::<JobEvent>(2);

        for i in 0..4 {
            let _ = tx.send(JobEvent::Started {
                job_id: JobId(i),
                timestamp: Utc::now(),
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("Channel should not be closed"),
        }
    }
}
