//! In-memory stand-in for the video service, shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Step, UploadError};
use crate::metadata::{ResourceId, UploadRequest};
use crate::orchestrator::{CaptionInfo, CaptionRequest, MediaApi, PlaylistTarget};
use crate::poller::{ProcessingState, StatusSource};
use crate::transport::{ChunkError, ChunkOutcome, SessionHandle, UploadTransport};

/// A temporary file of `size` zero bytes.
pub(crate) fn video_file(size: u64) -> tempfile::NamedTempFile {
    let file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
    file.as_file().set_len(size).unwrap();
    file
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub(crate) session_attempts: u32,
    pub(crate) sessions_started: u32,
    pub(crate) session_failures: VecDeque<ChunkError>,
    /// Failures keyed by chunk offset, with the number of bytes stored before failing.
    pub(crate) chunk_failures: HashMap<u64, VecDeque<(ChunkError, u64)>>,
    pub(crate) sends: Vec<(u64, usize)>,
    pub(crate) offset_queries: u32,
    pub(crate) stored: u64,
    pub(crate) total: u64,
    pub(crate) uploads_completed: u32,
    pub(crate) states: VecDeque<ProcessingState>,
    pub(crate) status_queries: u32,
    pub(crate) failing_steps: Vec<Step>,
    /// Every post-upload call in order, e.g. `thumbnail:vid-123`.
    pub(crate) calls: Vec<String>,
    pub(crate) caption_paths: Vec<PathBuf>,
    pub(crate) caption_contents: Vec<String>,
}

impl FakeState {
    pub(crate) fn sent_lengths(&self) -> Vec<usize> {
        self.sends.iter().map(|(_, len)| *len).collect()
    }

    fn outcome(&mut self) -> ChunkOutcome {
        if self.stored == self.total {
            self.uploads_completed += 1;
            ChunkOutcome::Complete(ResourceId::from(format!(
                "vid-{}",
                122 + self.uploads_completed
            )))
        } else {
            ChunkOutcome::Incomplete {
                confirmed: self.stored,
            }
        }
    }

    fn step_result(&self, step: Step) -> Result<(), UploadError> {
        if self.failing_steps.contains(&step) {
            Err(UploadError::Request {
                status: Some(500),
                message: format!("{step} backend error"),
            })
        } else {
            Ok(())
        }
    }
}

/// Fake service. Videos get the ids `vid-123`, `vid-124`, ... in upload order.
#[derive(Debug, Default)]
pub(crate) struct FakeYoutube {
    state: Mutex<FakeState>,
}

impl FakeYoutube {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_session(&self, error: ChunkError) {
        self.state().session_failures.push_back(error);
    }

    pub(crate) fn fail_chunk(&self, offset: u64, error: ChunkError, stored: u64) {
        self.state()
            .chunk_failures
            .entry(offset)
            .or_default()
            .push_back((error, stored));
    }

    /// Processing states returned by successive status queries; the last one repeats.
    pub(crate) fn with_states(self, states: &[&str]) -> Self {
        self.state().states = states.iter().map(|s| ProcessingState::from(*s)).collect();
        self
    }

    pub(crate) fn fail_step(self, step: Step) -> Self {
        self.state().failing_steps.push(step);
        self
    }
}

#[async_trait]
impl UploadTransport for FakeYoutube {
    async fn start_session(&self, request: &UploadRequest) -> Result<SessionHandle, ChunkError> {
        let mut state = self.state();
        state.session_attempts += 1;
        if let Some(error) = state.session_failures.pop_front() {
            return Err(error);
        }
        state.sessions_started += 1;
        state.total = request.size;
        state.stored = 0;
        Ok(SessionHandle::new(format!(
            "https://upload.test/session/{}",
            state.sessions_started
        )))
    }

    async fn send_chunk(
        &self,
        _session: &SessionHandle,
        offset: u64,
        _total: u64,
        data: Vec<u8>,
    ) -> Result<ChunkOutcome, ChunkError> {
        let mut state = self.state();
        state.sends.push((offset, data.len()));
        let failure = state
            .chunk_failures
            .get_mut(&offset)
            .and_then(|failures| failures.pop_front());
        if let Some((error, stored)) = failure {
            state.stored = offset + stored;
            return Err(error);
        }
        state.stored = offset + data.len() as u64;
        Ok(state.outcome())
    }

    async fn query_offset(
        &self,
        _session: &SessionHandle,
        _total: u64,
    ) -> Result<ChunkOutcome, ChunkError> {
        let mut state = self.state();
        state.offset_queries += 1;
        Ok(state.outcome())
    }
}

#[async_trait]
impl StatusSource for FakeYoutube {
    async fn processing_state(&self, id: &ResourceId) -> Result<ProcessingState, UploadError> {
        let mut state = self.state();
        state.status_queries += 1;
        state.calls.push(format!("status:{id}"));
        let current = if state.states.len() > 1 {
            state.states.pop_front()
        } else {
            state.states.front().cloned()
        };
        Ok(current.unwrap_or(ProcessingState::Processed))
    }
}

#[async_trait]
impl MediaApi for FakeYoutube {
    async fn set_thumbnail(&self, id: &ResourceId, image: &Path) -> Result<(), UploadError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("thumbnail:{id}:{}", image.display()));
        state.step_result(Step::Thumbnail)
    }

    async fn add_to_playlist(
        &self,
        id: &ResourceId,
        playlist: &PlaylistTarget,
    ) -> Result<String, UploadError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("playlist:{id}:{}", playlist.title));
        state.step_result(Step::Playlist)?;
        Ok("PL-1".to_string())
    }

    async fn insert_caption(
        &self,
        id: &ResourceId,
        caption: &CaptionRequest,
        caption_file: &Path,
    ) -> Result<CaptionInfo, UploadError> {
        let contents = std::fs::read_to_string(caption_file).unwrap();
        let mut state = self.state();
        state.calls.push(format!(
            "caption:{id}:{}:{}",
            caption.language, caption.draft
        ));
        state.caption_paths.push(caption_file.to_path_buf());
        state.caption_contents.push(contents);
        state.step_result(Step::Caption)?;
        Ok(CaptionInfo {
            id: "cap-1".into(),
            name: caption.name.clone(),
            language: caption.language.clone(),
            status: Some("serving".into()),
        })
    }
}
