use async_trait::async_trait;

use crate::metadata::{ResourceId, UploadRequest};

/// Server-issued handle of a resumable upload session (the session URI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the server reported after receiving (part of) the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Bytes `0..confirmed` are stored server side; the upload is not complete yet.
    Incomplete { confirmed: u64 },
    /// The whole file was received and the video resource was created.
    Complete(ResourceId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Worth retrying against the same session: 5xx, 408, 429, connection failures.
    #[error("{0}")]
    Transient(String),
    #[error("{status}: {message}")]
    Permanent { status: u16, message: String },
}

pub fn is_retriable_status(status: u16) -> bool {
    status >= 500 || matches!(status, 408 | 429)
}

/// Maps a non-success HTTP status of the upload path to a [`ChunkError`].
pub fn classify_status(status: u16, message: impl Into<String>) -> ChunkError {
    let message = message.into();
    if is_retriable_status(status) {
        ChunkError::Transient(format!("{status}: {message}"))
    } else {
        ChunkError::Permanent { status, message }
    }
}

/// The resumable upload protocol, as seen by the chunked uploader.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Negotiates a resumable session for `request`.
    async fn start_session(&self, request: &UploadRequest) -> Result<SessionHandle, ChunkError>;

    /// Sends `data`, the bytes of the file starting at `offset`.
    async fn send_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        total: u64,
        data: Vec<u8>,
    ) -> Result<ChunkOutcome, ChunkError>;

    /// Asks the server how many bytes of the session it has stored.
    async fn query_offset(
        &self,
        session: &SessionHandle,
        total: u64,
    ) -> Result<ChunkOutcome, ChunkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500, 502, 503, 504, 408, 429] {
            assert!(matches!(
                classify_status(status, "try again"),
                ChunkError::Transient(_)
            ));
        }
    }

    #[test]
    fn other_client_errors_are_permanent() {
        for status in [400, 401, 403, 404] {
            assert_eq!(
                classify_status(status, "nope"),
                ChunkError::Permanent {
                    status,
                    message: "nope".into()
                }
            );
        }
    }
}
