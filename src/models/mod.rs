pub mod config;
pub mod job;

pub use config::{DaemonConfig, RecoveryPolicy};
pub use job::{Job, JobId, JobStatus, JobTransition, NewJob, TransitionRejected};
