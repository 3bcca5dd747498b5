use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::watch;
use tracing::warn;

/// Sink for upload progress.
///
/// Both operations are fire-and-forget: a reporter that panics is logged and
/// ignored, it never aborts the transfer.
pub trait ProgressReporter: Send {
    fn on_progress(&mut self, total_bytes: u64, sent_bytes: u64);

    /// Called exactly once per upload attempt, whether the upload succeeded or not.
    fn on_finish(&mut self);
}

/// Reporter used when no visual progress is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn on_progress(&mut self, _total_bytes: u64, _sent_bytes: u64) {}

    fn on_finish(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub finished: bool,
}

impl UploadProgress {
    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_uploaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0) as f32
        }
    }
}

/// Publishes progress on a watch channel for a renderer running elsewhere.
pub struct ChannelReporter {
    tx: watch::Sender<UploadProgress>,
}

impl ChannelReporter {
    pub fn new() -> (Self, watch::Receiver<UploadProgress>) {
        let (tx, rx) = watch::channel(UploadProgress::default());
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&mut self, total_bytes: u64, sent_bytes: u64) {
        let _ = self.tx.send(UploadProgress {
            bytes_uploaded: sent_bytes,
            total_bytes,
            finished: false,
        });
    }

    fn on_finish(&mut self) {
        self.tx.send_modify(|progress| progress.finished = true);
    }
}

/// Scoped handle over a reporter for the duration of one upload attempt.
///
/// `on_finish` runs when the guard is dropped, so every exit path of the
/// transfer (success, error, cancellation) finishes the reporter exactly once.
pub(crate) struct ProgressGuard<'a> {
    reporter: &'a mut dyn ProgressReporter,
}

impl<'a> ProgressGuard<'a> {
    pub(crate) fn new(reporter: &'a mut dyn ProgressReporter) -> Self {
        Self { reporter }
    }

    pub(crate) fn report(&mut self, total_bytes: u64, sent_bytes: u64) {
        let reporter = &mut *self.reporter;
        if catch_unwind(AssertUnwindSafe(|| reporter.on_progress(total_bytes, sent_bytes))).is_err()
        {
            warn!(sent_bytes, total_bytes, "progress reporter panicked, ignoring");
        }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        let reporter = &mut *self.reporter;
        if catch_unwind(AssertUnwindSafe(|| reporter.on_finish())).is_err() {
            warn!("progress reporter panicked while finishing, ignoring");
        }
    }
}

/// Reporter that records every call, shared by the tests of the upload pipeline.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    pub(crate) updates: Vec<(u64, u64)>,
    pub(crate) finished: u32,
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn on_progress(&mut self, total_bytes: u64, sent_bytes: u64) {
        self.updates.push((total_bytes, sent_bytes));
    }

    fn on_finish(&mut self) {
        self.finished += 1;
    }
}
