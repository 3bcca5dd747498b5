use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use crate::metadata::ResourceId;
use crate::poller::ProcessingState;

pub const EXIT_OTHER: u8 = 1;
pub const EXIT_OPTIONS: u8 = 2;
pub const EXIT_REQUEST: u8 = 3;
pub const EXIT_AUTHENTICATION: u8 = 4;

/// Post-upload step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Thumbnail,
    Playlist,
    Caption,
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Thumbnail => write!(f, "thumbnail"),
            Step::Playlist => write!(f, "playlist"),
            Step::Caption => write!(f, "caption"),
        }
    }
}

/// Failure of the chunked transfer of one video.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to read video file: {0}")]
    Io(#[from] std::io::Error),
    #[error("server rejected chunk at offset {offset} ({status}): {message}")]
    Rejected {
        offset: u64,
        status: u16,
        message: String,
    },
    #[error("chunk at offset {offset} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        message: String,
    },
    #[error("server confirmed offset {confirmed}, previously {previous} of {total} bytes")]
    InvalidOffset {
        previous: u64,
        confirmed: u64,
        total: u64,
    },
    #[error("all {total} bytes were accepted but the server returned no video id")]
    MissingResourceId { total: u64 },
    #[error("upload cancelled after {confirmed} of {total} bytes")]
    Cancelled { confirmed: u64, total: u64 },
}

impl TransferError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, TransferError::Rejected { status: 401, .. })
    }
}

/// Server-side processing of an uploaded video did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("processing of video {id} ended in state '{state}'")]
    Rejected {
        id: ResourceId,
        state: ProcessingState,
    },
    #[error("video {id} still '{last}' after waiting {}", format_wait(.waited))]
    TimedOut {
        id: ResourceId,
        last: ProcessingState,
        waited: Duration,
    },
    #[error("waiting for video {id} was cancelled")]
    Cancelled { id: ResourceId },
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0} is not a valid category")]
    InvalidCategory(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{}", request_message(.status, .message))]
    Request {
        status: Option<u16>,
        message: String,
    },
    #[error("unable to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload of {} failed: {source}", .path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: TransferError,
    },
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("{step} step failed for video {id}: {source}")]
    PostProcessing {
        id: ResourceId,
        step: Step,
        #[source]
        source: Box<UploadError>,
    },
}

fn format_wait(waited: &Duration) -> String {
    humantime::format_duration(*waited).to_string()
}

fn request_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("Server response ({status}): {message}"),
        None => format!("Request failed: {message}"),
    }
}

impl UploadError {
    pub fn configuration(message: impl Into<String>) -> Self {
        UploadError::Configuration(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UploadError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code reported by the command line tool for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            UploadError::Configuration(_) => EXIT_OPTIONS,
            UploadError::InvalidCategory(_) => EXIT_REQUEST,
            UploadError::Authentication(_) => EXIT_AUTHENTICATION,
            UploadError::Request { status: Some(401), .. } => EXIT_AUTHENTICATION,
            UploadError::Request { .. } => EXIT_REQUEST,
            UploadError::Io { .. } => EXIT_OTHER,
            UploadError::Transfer { source, .. } if source.is_unauthorized() => {
                EXIT_AUTHENTICATION
            }
            UploadError::Transfer { .. } => EXIT_REQUEST,
            UploadError::Processing(_) => EXIT_REQUEST,
            UploadError::PostProcessing { source, .. } => source.exit_code(),
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(error: reqwest::Error) -> Self {
        UploadError::Request {
            status: error.status().map(|status| status.as_u16()),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(UploadError::configuration("missing title").exit_code(), 2);
        assert_eq!(UploadError::InvalidCategory("Foo".into()).exit_code(), 3);
        assert_eq!(UploadError::Authentication("expired".into()).exit_code(), 4);
        assert_eq!(
            UploadError::Request {
                status: Some(403),
                message: "quotaExceeded".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn unauthorized_transfer_maps_to_authentication_code() {
        let error = UploadError::Transfer {
            path: "a.mp4".into(),
            source: TransferError::Rejected {
                offset: 0,
                status: 401,
                message: "Invalid Credentials".into(),
            },
        };
        assert_eq!(error.exit_code(), EXIT_AUTHENTICATION);
    }

    #[test]
    fn post_processing_uses_inner_code_and_names_step() {
        let error = UploadError::PostProcessing {
            id: ResourceId::from("abc123"),
            step: Step::Playlist,
            source: Box::new(UploadError::Authentication("revoked".into())),
        };
        assert_eq!(error.exit_code(), EXIT_AUTHENTICATION);
        let message = error.to_string();
        assert!(message.contains("playlist"));
        assert!(message.contains("abc123"));
    }
}
