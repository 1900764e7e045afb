use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Startup corruption: {0}")]
    StartupCorruption(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DownloaderError {
    fn from(err: std::io::Error) -> Self {
        DownloaderError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for DownloaderError {
    fn from(err: serde_json::Error) -> Self {
        DownloaderError::Persistence(err.to_string())
    }
}

impl DownloaderError {
    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DownloaderError::InvalidInput(_) => "invalid_input",
            DownloaderError::NotFound(_) => "not_found",
            DownloaderError::Conflict(_) => "conflict",
            DownloaderError::Fetch(_) => "fetch_error",
            DownloaderError::Persistence(_) => "persistence_error",
            DownloaderError::StartupCorruption(_) => "startup_corruption",
            DownloaderError::Timeout(_) => "timeout",
            DownloaderError::Internal(_) => "internal_error",
        }
    }
}
