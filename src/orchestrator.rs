use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Step, UploadError};
use crate::metadata::{Privacy, ResourceId, UploadRequest};
use crate::poller::{PollConfig, ProcessingPoller, StatusSource};
use crate::progress::{NullReporter, ProgressReporter};
use crate::transport::UploadTransport;
use crate::upload::{ChunkedUploader, RetryPolicy};

pub const WATCH_VIDEO_URL: &str = "https://www.youtube.com/watch?v=";
pub const DEFAULT_CAPTION_LANGUAGE: &str = "en";
pub const DEFAULT_CAPTION_NAME: &str = "Uploaded from ytup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistTarget {
    pub title: String,
    /// Privacy given to the playlist if it has to be created.
    pub privacy: Privacy,
}

#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub language: String,
    pub name: String,
    pub draft: bool,
    pub contents: String,
}

impl CaptionRequest {
    /// Reads the caption track from `path`.
    pub fn load(
        path: &Path,
        language: impl Into<String>,
        name: impl Into<String>,
        draft: bool,
    ) -> Result<Self, UploadError> {
        let contents = std::fs::read_to_string(path).map_err(|e| UploadError::io(path, e))?;
        Ok(CaptionRequest {
            language: language.into(),
            name: name.into(),
            draft,
            contents,
        })
    }
}

/// Parses the `--caption-asdraft` value: `yes`/`y` or `no`/`n`, any case.
pub fn parse_draft_flag(value: &str) -> Result<bool, UploadError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" => Ok(true),
        "no" | "n" => Ok(false),
        other => Err(UploadError::configuration(format!(
            "invalid caption draft flag '{other}' (expected yes, y, no or n)"
        ))),
    }
}

/// Content type of a thumbnail image, derived from its extension.
pub fn thumbnail_content_type(path: &Path) -> Result<&'static str, UploadError> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => Ok("image/jpeg"),
        Some("png") => Ok("image/png"),
        _ => Err(UploadError::configuration(format!(
            "thumbnail {} must be a JPEG or PNG image",
            path.display()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionInfo {
    pub id: String,
    pub name: String,
    pub language: String,
    pub status: Option<String>,
}

/// Operations issued against an uploaded video.
#[async_trait]
pub trait MediaApi: StatusSource {
    async fn set_thumbnail(&self, id: &ResourceId, image: &Path) -> Result<(), UploadError>;

    /// Appends the video to the playlist with the given title, creating the
    /// playlist first if the channel has none. Returns the playlist id.
    async fn add_to_playlist(
        &self,
        id: &ResourceId,
        playlist: &PlaylistTarget,
    ) -> Result<String, UploadError>;

    async fn insert_caption(
        &self,
        id: &ResourceId,
        caption: &CaptionRequest,
        caption_file: &Path,
    ) -> Result<CaptionInfo, UploadError>;
}

/// What to do with each video once it is uploaded.
#[derive(Debug, Clone, Default)]
pub struct PostProcessPlan {
    pub thumbnail: Option<PathBuf>,
    pub playlist: Option<PlaylistTarget>,
    pub caption: Option<CaptionRequest>,
}

/// Checks option combinations before anything touches the network.
pub fn validate_batch(videos: &[PathBuf], plan: &PostProcessPlan) -> Result<(), UploadError> {
    if videos.is_empty() {
        return Err(UploadError::configuration("no video file given"));
    }
    if plan.caption.is_some() && videos.len() > 1 {
        return Err(UploadError::configuration(
            "Multiple uploads are not supported when uploading a caption file.",
        ));
    }
    if let Some(thumbnail) = &plan.thumbnail {
        thumbnail_content_type(thumbnail)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct StepReport {
    pub step: Step,
    pub result: Result<(), UploadError>,
}

/// Outcome of one uploaded video. The upload itself succeeded; steps may not have.
#[derive(Debug)]
pub struct VideoReport {
    pub path: PathBuf,
    pub id: ResourceId,
    pub steps: Vec<StepReport>,
    pub caption: Option<CaptionInfo>,
}

impl VideoReport {
    fn new(path: &Path, id: ResourceId) -> Self {
        Self {
            path: path.to_path_buf(),
            id,
            steps: Vec::new(),
            caption: None,
        }
    }

    pub fn watch_url(&self) -> String {
        format!("{WATCH_VIDEO_URL}{}", self.id)
    }

    pub fn errors(&self) -> impl Iterator<Item = &UploadError> {
        self.steps.iter().filter_map(|step| step.result.as_ref().err())
    }

    fn record(&mut self, step: Step, result: Result<(), UploadError>) {
        let result = result.map_err(|error| match error {
            UploadError::Processing(_) => error,
            other => UploadError::PostProcessing {
                id: self.id.clone(),
                step,
                source: Box::new(other),
            },
        });
        if let Err(error) = &result {
            warn!(video_id = %self.id, %step, "{error}");
        }
        self.steps.push(StepReport { step, result });
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub videos: Vec<VideoReport>,
    pub failures: Vec<UploadError>,
    /// Videos not attempted because of `fail_fast` or cancellation.
    pub skipped: usize,
}

impl BatchReport {
    /// Exit code of the most severe error of the run, 0 if there was none.
    pub fn exit_code(&self) -> u8 {
        self.failures
            .iter()
            .chain(self.videos.iter().flat_map(|video| video.errors()))
            .map(UploadError::exit_code)
            .max()
            .unwrap_or(0)
    }
}

/// Hooks called by [`Orchestrator::publish_all`] around each video of a batch.
pub trait BatchObserver {
    /// Progress reporter for the upload of video `index`.
    fn reporter_for(&mut self, _request: &UploadRequest, _index: usize) -> Box<dyn ProgressReporter> {
        Box::new(NullReporter)
    }

    /// Called once a video and its post-upload steps are done, before the
    /// next video starts.
    fn published(&mut self, _report: &VideoReport) {}
}

/// Observer that draws nothing and ignores finished videos.
pub struct QuietBatch;

impl BatchObserver for QuietBatch {}

/// Uploads videos and drives the steps that depend on them.
pub struct Orchestrator<'a, A: UploadTransport + MediaApi + ?Sized> {
    api: &'a A,
    retry: RetryPolicy,
    poll: PollConfig,
    cancel: CancellationToken,
}

impl<'a, A: UploadTransport + MediaApi + ?Sized> Orchestrator<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            poll: PollConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Uploads the videos one after the other.
    ///
    /// A failed upload is recorded and the run moves on to the next video,
    /// unless `fail_fast` is set.
    pub async fn publish_all<O: BatchObserver + ?Sized>(
        &self,
        requests: &[UploadRequest],
        plan: &PostProcessPlan,
        fail_fast: bool,
        observer: &mut O,
    ) -> Result<BatchReport, UploadError> {
        let paths: Vec<PathBuf> = requests.iter().map(|r| r.path.clone()).collect();
        validate_batch(&paths, plan)?;

        let mut batch = BatchReport::default();
        for (index, request) in requests.iter().enumerate() {
            if self.cancel.is_cancelled() {
                batch.skipped = requests.len() - index;
                break;
            }

            let mut reporter = observer.reporter_for(request, index);
            let published = self.publish(request, plan, reporter.as_mut()).await;
            drop(reporter);
            match published {
                Ok(report) => {
                    observer.published(&report);
                    batch.videos.push(report);
                }
                Err(e) => {
                    error!(path = %request.path.display(), "{e}");
                    batch.failures.push(e);
                    if fail_fast {
                        batch.skipped = requests.len() - index - 1;
                        break;
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Uploads one video, then runs the requested post-upload steps.
    pub async fn publish(
        &self,
        request: &UploadRequest,
        plan: &PostProcessPlan,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<VideoReport, UploadError> {
        let id = ChunkedUploader::new(self.api)
            .with_retry_policy(self.retry.clone())
            .with_cancellation(self.cancel.clone())
            .upload(request, reporter)
            .await
            .map_err(|source| UploadError::Transfer {
                path: request.path.clone(),
                source,
            })?;
        info!(video_id = %id, "Video URL: {WATCH_VIDEO_URL}{id}");

        Ok(self.post_process(&request.path, id, plan).await)
    }

    /// Runs thumbnail, playlist and caption steps. Each is attempted
    /// regardless of how the previous ones went; nothing is rolled back.
    pub async fn post_process(
        &self,
        path: &Path,
        id: ResourceId,
        plan: &PostProcessPlan,
    ) -> VideoReport {
        let mut report = VideoReport::new(path, id);

        if let Some(thumbnail) = &plan.thumbnail {
            let result = self.api.set_thumbnail(&report.id, thumbnail).await;
            report.record(Step::Thumbnail, result);
        }

        if let Some(playlist) = &plan.playlist {
            let result = self
                .api
                .add_to_playlist(&report.id, playlist)
                .await
                .map(|playlist_id| {
                    info!(video_id = %report.id, %playlist_id, "Added to playlist '{}'", playlist.title);
                });
            report.record(Step::Playlist, result);
        }

        if let Some(caption) = &plan.caption {
            match self.attach_caption(&report.id, caption).await {
                Ok(info) => {
                    info!(video_id = %report.id, caption_id = %info.id, "Caption uploaded");
                    report.caption = Some(info);
                    report.record(Step::Caption, Ok(()));
                }
                Err(e) => report.record(Step::Caption, Err(e)),
            }
        }

        report
    }

    async fn attach_caption(
        &self,
        id: &ResourceId,
        caption: &CaptionRequest,
    ) -> Result<CaptionInfo, UploadError> {
        info!(
            video_id = %id,
            language = %caption.language,
            name = %caption.name,
            draft = caption.draft,
            "Waiting for the video to be processed before uploading the caption"
        );
        ProcessingPoller::new(self.api, self.poll.clone())
            .with_cancellation(self.cancel.clone())
            .wait_until_processed(id)
            .await?;

        // Removed when dropped, on every return path.
        let file = write_caption_file(caption)?;
        self.api.insert_caption(id, caption, file.path()).await
    }
}

fn write_caption_file(caption: &CaptionRequest) -> Result<NamedTempFile, UploadError> {
    let temp_dir = std::env::temp_dir();
    let mut file = tempfile::Builder::new()
        .prefix("ytup-caption-")
        .suffix(".txt")
        .tempfile()
        .map_err(|e| UploadError::io(&temp_dir, e))?;
    file.write_all(caption.contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| UploadError::io(file.path(), e))?;
    Ok(file)
}
