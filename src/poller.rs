use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ProcessingError, UploadError};
use crate::metadata::ResourceId;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Server-side processing status of an uploaded video (`status.uploadStatus`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingState {
    Uploaded,
    Processing,
    Processed,
    Rejected,
    Failed,
    Deleted,
    Other(String),
}

impl From<&str> for ProcessingState {
    fn from(label: &str) -> Self {
        match label {
            "uploaded" => ProcessingState::Uploaded,
            "processing" => ProcessingState::Processing,
            "processed" => ProcessingState::Processed,
            "rejected" => ProcessingState::Rejected,
            "failed" => ProcessingState::Failed,
            "deleted" => ProcessingState::Deleted,
            other => ProcessingState::Other(other.to_string()),
        }
    }
}

impl Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingState::Uploaded => write!(f, "uploaded"),
            ProcessingState::Processing => write!(f, "processing"),
            ProcessingState::Processed => write!(f, "processed"),
            ProcessingState::Rejected => write!(f, "rejected"),
            ProcessingState::Failed => write!(f, "failed"),
            ProcessingState::Deleted => write!(f, "deleted"),
            ProcessingState::Other(label) => write!(f, "{label}"),
        }
    }
}

pub fn is_success(state: &ProcessingState) -> bool {
    matches!(state, ProcessingState::Processed)
}

pub fn is_failure(state: &ProcessingState) -> bool {
    matches!(
        state,
        ProcessingState::Rejected | ProcessingState::Failed | ProcessingState::Deleted
    )
}

/// Whether polling can stop at `state`. Unknown labels keep the poller waiting.
pub fn is_terminal(state: &ProcessingState) -> bool {
    is_success(state) || is_failure(state)
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn processing_state(&self, id: &ResourceId) -> Result<ProcessingState, UploadError>;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Upper bound on the total wait, measured from the first query.
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub queries: u32,
    pub waited: Duration,
}

/// Waits for the server to finish processing an uploaded video.
pub struct ProcessingPoller<'a, S: StatusSource + ?Sized> {
    source: &'a S,
    config: PollConfig,
    cancel: CancellationToken,
}

impl<'a, S: StatusSource + ?Sized> ProcessingPoller<'a, S> {
    pub fn new(source: &'a S, config: PollConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Queries the state right away, then once per interval, until it is `processed`.
    ///
    /// A failure state (`rejected`, `failed`, `deleted`) ends the wait with an error,
    /// and so does exceeding `max_wait`.
    pub async fn wait_until_processed(&self, id: &ResourceId) -> Result<PollSummary, UploadError> {
        let started = Instant::now();
        let mut queries = 0u32;

        loop {
            let state = self.source.processing_state(id).await?;
            queries += 1;
            let waited = started.elapsed();
            info!(video_id = %id, state = %state, queries, "Video processing state");

            if is_success(&state) {
                return Ok(PollSummary { queries, waited });
            }
            if is_failure(&state) {
                return Err(ProcessingError::Rejected {
                    id: id.clone(),
                    state,
                }
                .into());
            }
            if waited + self.config.interval > self.config.max_wait {
                return Err(ProcessingError::TimedOut {
                    id: id.clone(),
                    last: state,
                    waited,
                }
                .into());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ProcessingError::Cancelled { id: id.clone() }.into());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}
