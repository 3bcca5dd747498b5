use std::future::Future;
use std::io::SeekFrom;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::metadata::{ResourceId, UploadRequest};
use crate::progress::{ProgressGuard, ProgressReporter};
use crate::transport::{ChunkError, ChunkOutcome, SessionHandle, UploadTransport};

/// Exponential backoff applied to transient chunk failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries for one chunk
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// State of one resumable upload, owned by the uploader for a single call.
#[derive(Debug)]
pub struct UploadSession {
    handle: SessionHandle,
    total_bytes: u64,
    confirmed_bytes: u64,
    last_chunk_offset: Option<u64>,
}

impl UploadSession {
    pub fn new(handle: SessionHandle, total_bytes: u64) -> Self {
        Self {
            handle,
            total_bytes,
            confirmed_bytes: 0,
            last_chunk_offset: None,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed_bytes
    }

    /// Offset at which the last accepted chunk started.
    pub fn last_chunk_offset(&self) -> Option<u64> {
        self.last_chunk_offset
    }

    /// Records the offset confirmed by the server and returns whether it advanced.
    ///
    /// The confirmed offset never moves backwards and never passes the total size.
    pub fn confirm(&mut self, confirmed: u64) -> Result<bool, TransferError> {
        if confirmed < self.confirmed_bytes || confirmed > self.total_bytes {
            return Err(TransferError::InvalidOffset {
                previous: self.confirmed_bytes,
                confirmed,
                total: self.total_bytes,
            });
        }
        if confirmed == self.confirmed_bytes {
            return Ok(false);
        }
        self.last_chunk_offset = Some(self.confirmed_bytes);
        self.confirmed_bytes = confirmed;
        Ok(true)
    }
}

/// Sends a file through an [`UploadTransport`] in bounded-size chunks.
pub struct ChunkedUploader<'a, T: UploadTransport + ?Sized> {
    transport: &'a T,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a, T: UploadTransport + ?Sized> ChunkedUploader<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cancellation is only observed between chunks and between retries.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn upload(
        &self,
        request: &UploadRequest,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<ResourceId, TransferError> {
        let mut progress = ProgressGuard::new(reporter);
        let total = request.size;

        info!(
            path = %request.path.display(),
            total_bytes = total,
            chunk_size = request.chunk_size,
            chunks = request.chunk_count(),
            "Start upload"
        );

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled {
                confirmed: 0,
                total,
            });
        }

        let mut file = tokio::fs::File::open(&request.path).await?;
        let handle = self
            .retrying(0, total, &mut Attempts::default(), || {
                self.transport.start_session(request)
            })
            .await?;
        debug!(session = handle.as_str(), "resumable session started");

        let mut session = UploadSession::new(handle, total);
        let mut attempts = Attempts::default();

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled {
                    confirmed: session.confirmed_bytes(),
                    total,
                });
            }

            let offset = session.confirmed_bytes();
            let failed_before = attempts.count;
            let outcome = if offset == total {
                let handle = session.handle();
                self.retrying(offset, total, &mut attempts, || {
                    self.transport.query_offset(handle, total)
                })
                .await?
            } else {
                let len = request.chunk_size.min(total - offset) as usize;
                let mut data = vec![0u8; len];
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut data).await?;
                self.deliver(&session, offset, data, &mut attempts).await?
            };

            match outcome {
                ChunkOutcome::Complete(id) => {
                    if session.confirm(total)? {
                        progress.report(total, total);
                    }
                    info!(video_id = %id, "Upload complete");
                    return Ok(id);
                }
                ChunkOutcome::Incomplete { confirmed } if offset == total && confirmed == total => {
                    return Err(TransferError::MissingResourceId { total });
                }
                ChunkOutcome::Incomplete { confirmed } => {
                    if session.confirm(confirmed)? {
                        attempts = Attempts::default();
                        debug!(confirmed, total, "chunk accepted");
                        progress.report(total, confirmed);
                        continue;
                    }

                    // A server that answers without storing anything, and without
                    // an error, still spends the chunk's retry budget.
                    if attempts.count == failed_before {
                        attempts.count += 1;
                    }
                    if attempts.count > self.retry.max_retries {
                        return Err(TransferError::RetriesExhausted {
                            offset,
                            attempts: attempts.count,
                            message: attempts.last_error.take().unwrap_or_else(|| {
                                "server did not store any bytes of the chunk".into()
                            }),
                        });
                    }
                    warn!(
                        offset,
                        attempts = attempts.count,
                        "server made no progress, resending chunk"
                    );
                }
            }
        }
    }

    /// Sends one chunk. After a transient failure the chunk is not blindly
    /// resent: the server is asked for its confirmed offset instead, and the
    /// caller resumes from there.
    async fn deliver(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
        attempts: &mut Attempts,
    ) -> Result<ChunkOutcome, TransferError> {
        let handle = session.handle();
        let total = session.total_bytes();
        let mut data = Some(data);

        self.retrying(offset, total, attempts, || {
            let chunk = data.take();
            async move {
                match chunk {
                    Some(chunk) => {
                        self.transport
                            .send_chunk(handle, offset, total, chunk)
                            .await
                    }
                    None => self.transport.query_offset(handle, total).await,
                }
            }
        })
        .await
    }

    async fn retrying<F, Fut, R>(
        &self,
        offset: u64,
        total: u64,
        attempts: &mut Attempts,
        mut operation: F,
    ) -> Result<R, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, ChunkError>>,
    {
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(ChunkError::Permanent { status, message }) => {
                    return Err(TransferError::Rejected {
                        offset,
                        status,
                        message,
                    });
                }
                Err(ChunkError::Transient(message)) => {
                    attempts.count += 1;

                    if attempts.count > self.retry.max_retries {
                        warn!(offset, "Max retries ({}) reached", self.retry.max_retries);
                        return Err(TransferError::RetriesExhausted {
                            offset,
                            attempts: attempts.count,
                            message,
                        });
                    }

                    let delay = self.retry.backoff(attempts.count);
                    warn!(
                        offset,
                        error = %message,
                        "Retry attempt {}/{}, waiting {:?}",
                        attempts.count,
                        self.retry.max_retries,
                        delay
                    );
                    attempts.last_error = Some(message);

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(TransferError::Cancelled { confirmed: offset, total });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Retry budget of the chunk at the current offset. Only a confirmed advance
/// of the offset resets it.
#[derive(Debug, Default)]
struct Attempts {
    count: u32,
    last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::VideoMetadata;
    use crate::progress::RecordingReporter;
    use crate::testing::{FakeYoutube, video_file};

    const MIB: u64 = 1024 * 1024;

    fn request(size: u64, chunk_size: u64) -> (tempfile::NamedTempFile, UploadRequest) {
        let file = video_file(size);
        let request = UploadRequest::new(file.path(), VideoMetadata::default(), chunk_size).unwrap();
        (file, request)
    }

    fn quick_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn uneven_chunks_report_total_exactly_once() {
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        let mut reporter = RecordingReporter::default();

        let id = ChunkedUploader::new(&api)
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        assert_eq!(id.as_str(), "vid-123");
        assert_eq!(api.state().sent_lengths(), vec![300, 300, 300, 100]);
        assert_eq!(
            reporter.updates,
            vec![(1000, 300), (1000, 600), (1000, 900), (1000, 1000)]
        );
        assert_eq!(reporter.updates.iter().filter(|(_, sent)| *sent == 1000).count(), 1);
        assert_eq!(reporter.finished, 1);
    }

    #[tokio::test]
    async fn even_chunks_report_total_exactly_once() {
        let (_file, request) = request(900, 300);
        let api = FakeYoutube::new();
        let mut reporter = RecordingReporter::default();

        ChunkedUploader::new(&api)
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        assert_eq!(api.state().sent_lengths(), vec![300, 300, 300]);
        assert_eq!(reporter.updates.last(), Some(&(900, 900)));
        assert_eq!(reporter.updates.iter().filter(|(_, sent)| *sent == 900).count(), 1);
        assert_eq!(reporter.finished, 1);
    }

    #[tokio::test]
    async fn transient_failure_resumes_from_confirmed_offset() {
        tokio::time::pause();
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        api.fail_chunk(300, ChunkError::Transient("503: backend error".into()), 0);
        let mut reporter = RecordingReporter::default();

        ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(3))
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        let state = api.state();
        assert_eq!(
            state.sends,
            vec![(0, 300), (300, 300), (300, 300), (600, 300), (900, 100)]
        );
        assert_eq!(state.offset_queries, 1);
        assert_eq!(state.sessions_started, 1);
        assert_eq!(reporter.finished, 1);
        assert_eq!(reporter.updates.last(), Some(&(1000, 1000)));
    }

    #[tokio::test]
    async fn partially_stored_chunk_is_not_resent_in_full() {
        tokio::time::pause();
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        api.fail_chunk(300, ChunkError::Transient("connection reset".into()), 150);
        let mut reporter = RecordingReporter::default();

        ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(3))
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        let state = api.state();
        assert_eq!(
            state.sends,
            vec![(0, 300), (300, 300), (450, 300), (750, 250)]
        );
        assert_eq!(
            reporter.updates,
            vec![(1000, 300), (1000, 450), (1000, 750), (1000, 1000)]
        );
    }

    #[tokio::test]
    async fn permanent_failure_makes_exactly_one_attempt() {
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        api.fail_chunk(
            300,
            ChunkError::Permanent {
                status: 403,
                message: "quotaExceeded".into(),
            },
            0,
        );
        let mut reporter = RecordingReporter::default();

        let error = ChunkedUploader::new(&api)
            .upload(&request, &mut reporter)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            TransferError::Rejected {
                offset: 300,
                status: 403,
                ..
            }
        ));
        let state = api.state();
        assert_eq!(state.sends.iter().filter(|(offset, _)| *offset == 300).count(), 1);
        assert_eq!(state.offset_queries, 0);
        assert_eq!(reporter.finished, 1);
    }

    #[tokio::test]
    async fn persistent_transient_failure_gives_up() {
        tokio::time::pause();
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        for _ in 0..10 {
            api.fail_chunk(0, ChunkError::Transient("502: bad gateway".into()), 0);
        }
        let mut reporter = RecordingReporter::default();

        let error = ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(2))
            .upload(&request, &mut reporter)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            TransferError::RetriesExhausted { offset: 0, .. }
        ));
        assert!(reporter.updates.is_empty());
        assert_eq!(reporter.finished, 1);
    }

    #[tokio::test]
    async fn backoff_keeps_growing_while_the_same_chunk_fails() {
        tokio::time::pause();
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        for _ in 0..10 {
            api.fail_chunk(0, ChunkError::Transient("503: backend error".into()), 0);
        }
        let mut reporter = RecordingReporter::default();
        let started = tokio::time::Instant::now();

        let error = ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(3))
            .upload(&request, &mut reporter)
            .await
            .unwrap_err();

        // 10ms + 20ms + 40ms before the fourth failure ends the transfer.
        assert!(started.elapsed() >= Duration::from_millis(70));
        match error {
            TransferError::RetriesExhausted {
                offset,
                attempts,
                message,
            } => {
                assert_eq!(offset, 0);
                assert_eq!(attempts, 4);
                assert!(message.contains("503"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(api.state().sends.len(), 4);
    }

    #[tokio::test]
    async fn retry_budget_resets_once_the_server_confirms_bytes() {
        tokio::time::pause();
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        for _ in 0..2 {
            api.fail_chunk(0, ChunkError::Transient("503: backend error".into()), 0);
            api.fail_chunk(300, ChunkError::Transient("503: backend error".into()), 0);
        }
        let mut reporter = RecordingReporter::default();

        ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(2))
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        assert_eq!(reporter.updates.last(), Some(&(1000, 1000)));
    }

    #[tokio::test]
    async fn session_start_is_retried_on_server_errors() {
        tokio::time::pause();
        let (_file, request) = request(100, 300);
        let api = FakeYoutube::new();
        api.fail_session(ChunkError::Transient("500: internal".into()));
        let mut reporter = RecordingReporter::default();

        ChunkedUploader::new(&api)
            .with_retry_policy(quick_retries(3))
            .upload(&request, &mut reporter)
            .await
            .unwrap();

        assert_eq!(api.state().session_attempts, 2);
        assert_eq!(api.state().sent_lengths(), vec![100]);
    }

    #[tokio::test]
    async fn twenty_mebibytes_go_out_as_three_chunks() {
        let (_file, request) = request(20 * MIB, 8 * MIB);
        let api = FakeYoutube::new();

        ChunkedUploader::new(&api)
            .upload(&request, &mut crate::progress::NullReporter)
            .await
            .unwrap();

        assert_eq!(
            api.state().sent_lengths(),
            vec![8 * MIB as usize, 8 * MIB as usize, 4 * MIB as usize]
        );
    }

    #[tokio::test]
    async fn cancelled_upload_sends_nothing_and_still_finishes() {
        let (_file, request) = request(1000, 300);
        let api = FakeYoutube::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reporter = RecordingReporter::default();

        let error = ChunkedUploader::new(&api)
            .with_cancellation(cancel)
            .upload(&request, &mut reporter)
            .await
            .unwrap_err();

        assert!(matches!(error, TransferError::Cancelled { confirmed: 0, total: 1000 }));
        assert_eq!(api.state().session_attempts, 0);
        assert!(api.state().sends.is_empty());
        assert_eq!(reporter.finished, 1);
    }

    #[test]
    fn session_offset_is_monotonic_and_bounded() {
        let mut session = UploadSession::new(SessionHandle::new("s"), 100);
        assert!(session.confirm(40).unwrap());
        assert!(!session.confirm(40).unwrap());
        assert_eq!(session.last_chunk_offset(), Some(0));
        assert!(matches!(
            session.confirm(10),
            Err(TransferError::InvalidOffset { previous: 40, confirmed: 10, .. })
        ));
        assert!(session.confirm(101).is_err());
        assert!(session.confirm(100).unwrap());
        assert_eq!(session.last_chunk_offset(), Some(40));
        assert_eq!(session.confirmed_bytes(), 100);
    }

    #[test]
    fn backoff_grows_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(32));
    }
}
