//! Resumable chunked video uploads to YouTube, with the steps that follow an
//! upload: thumbnail, playlist membership and captions once processing is done.

pub mod categories;
pub mod client;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod poller;
pub mod progress;
pub mod rest_types;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod testing;

pub use client::YoutubeClient;
pub use error::{ProcessingError, Step, TransferError, UploadError};
pub use metadata::{ResourceId, UploadRequest, VideoMetadata};
pub use orchestrator::{
    BatchObserver, BatchReport, Orchestrator, PostProcessPlan, VideoReport, WATCH_VIDEO_URL,
};
pub use poller::{PollConfig, ProcessingPoller, ProcessingState};
pub use progress::ProgressReporter;
pub use upload::{ChunkedUploader, RetryPolicy};
