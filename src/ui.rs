use iocraft::prelude::*;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use ytup::metadata::UploadRequest;
use ytup::orchestrator::{BatchObserver, VideoReport};
use ytup::poller::{ProcessingState, is_failure, is_success};
use ytup::progress::{ChannelReporter, NullReporter, ProgressReporter, UploadProgress};

const BAR_WIDTH: usize = 40;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[derive(Default, Props)]
pub struct ProgressBarProps {
    pub title: String,
    pub progress: Option<watch::Receiver<UploadProgress>>,
}

#[component]
pub fn ProgressBar(props: &ProgressBarProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut system = hooks.use_context_mut::<SystemContext>();
    let mut progress = hooks.use_state(UploadProgress::default);
    let mut should_exit = hooks.use_state(|| false);
    let receiver = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut receiver) = receiver else {
            should_exit.set(true);
            return;
        };
        loop {
            let current = *receiver.borrow_and_update();
            progress.set(current);
            // A closed channel means the reporter is gone.
            if current.finished || receiver.changed().await.is_err() {
                should_exit.set(true);
                return;
            }
        }
    });

    if should_exit.get() {
        system.exit();
    }

    let current = progress.get();
    let fraction = current.fraction();
    let filled = ((fraction * BAR_WIDTH as f32).round() as usize).min(BAR_WIDTH);

    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(weight: Weight::Bold, content: format!("{} ", props.title))
            Text(color: Color::Green, content: "█".repeat(filled))
            Text(color: Color::DarkGrey, content: "░".repeat(BAR_WIDTH - filled))
            Text(content: format!(
                " {:>5.1}% {}/{}",
                fraction * 100.0,
                format_bytes(current.bytes_uploaded),
                format_bytes(current.total_bytes)
            ))
        }
    }
}

#[derive(Default, Props)]
pub struct MessageProps {
    pub message: String,
}

#[component]
pub fn SuccessMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Green, content: "◆ ")
            Text(content: &props.message)
        }
    }
}

#[component]
pub fn ErrorMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Red, content: "▲ ")
            Text(content: &props.message)
        }
    }
}

#[derive(Default, Props)]
pub struct ProcessingStatusProps {
    pub video_id: String,
    pub state: Option<ProcessingState>,
}

#[component]
pub fn ProcessingStatus(props: &ProcessingStatusProps) -> impl Into<AnyElement<'static>> {
    let (icon, color) = match &props.state {
        Some(state) if is_success(state) => ("◆", Color::Green),
        Some(state) if is_failure(state) => ("■", Color::Red),
        Some(_) => ("◇", Color::Yellow),
        None => ("❓", Color::Yellow),
    };
    let state = props
        .state
        .as_ref()
        .map_or_else(|| "unknown".to_string(), ToString::to_string);

    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: color, content: format!("{icon} "))
            Text(weight: Weight::Bold, content: &props.video_id)
            Text(content: format!(": {state}"))
        }
    }
}

/// What the terminal shows for a batch, in the order it happened.
#[derive(Debug)]
pub enum BatchEvent {
    /// An upload started. Its bar follows the receiver until the upload finishes.
    Upload {
        title: String,
        progress: watch::Receiver<UploadProgress>,
    },
    Published {
        id: String,
        summary: String,
        errors: Vec<String>,
    },
}

/// Batch observer feeding [`render_batch`], which runs next to the uploads on
/// the same task.
pub struct TerminalBatch {
    events: mpsc::UnboundedSender<BatchEvent>,
    show_progress: bool,
    total: usize,
}

impl TerminalBatch {
    pub fn new(
        events: mpsc::UnboundedSender<BatchEvent>,
        show_progress: bool,
        total: usize,
    ) -> Self {
        Self {
            events,
            show_progress,
            total,
        }
    }
}

impl BatchObserver for TerminalBatch {
    fn reporter_for(&mut self, request: &UploadRequest, index: usize) -> Box<dyn ProgressReporter> {
        if !self.show_progress {
            return Box::new(NullReporter);
        }
        let name = request
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (reporter, progress) = ChannelReporter::new();
        let _ = self.events.send(BatchEvent::Upload {
            title: format!("[{}/{}] {name}", index + 1, self.total),
            progress,
        });
        Box::new(reporter)
    }

    fn published(&mut self, report: &VideoReport) {
        let _ = self.events.send(BatchEvent::Published {
            id: report.id.to_string(),
            summary: format!("{} uploaded: {}", report.path.display(), report.watch_url()),
            errors: report.errors().map(ToString::to_string).collect(),
        });
    }
}

/// Draws batch events until every [`TerminalBatch`] sender is dropped.
///
/// A bar is drawn until its upload finishes, so a `Done for ID:` line never
/// lands in the middle of one.
pub async fn render_batch(mut events: mpsc::UnboundedReceiver<BatchEvent>, interactive: bool) {
    while let Some(event) = events.recv().await {
        match event {
            BatchEvent::Upload { title, progress } => {
                let mut progress_bar =
                    element!(ProgressBar(title: title, progress: Some(progress)));
                if let Err(e) = progress_bar.render_loop().await {
                    warn!("progress bar failed: {e}");
                }
            }
            BatchEvent::Published {
                id,
                summary,
                errors,
            } => {
                if interactive {
                    element!(SuccessMessage(message: summary)).print();
                    for error in errors {
                        element!(ErrorMessage(message: error)).print();
                    }
                }
                println!("Done for ID: {id}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ytup::metadata::ResourceId;

    fn report(id: &str) -> VideoReport {
        VideoReport {
            path: PathBuf::from("trip.mp4"),
            id: ResourceId::from(id),
            steps: Vec::new(),
            caption: None,
        }
    }

    #[test]
    fn bytes_are_shown_in_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn published_videos_are_queued_without_a_bar_when_progress_is_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batch = TerminalBatch::new(tx, false, 2);

        batch.published(&report("vid-1"));

        match rx.try_recv().unwrap() {
            BatchEvent::Published {
                id,
                summary,
                errors,
            } => {
                assert_eq!(id, "vid-1");
                assert_eq!(
                    summary,
                    "trip.mp4 uploaded: https://www.youtube.com/watch?v=vid-1"
                );
                assert!(errors.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rendering_stops_once_the_batch_is_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let batch = TerminalBatch::new(tx, false, 1);
        drop(batch);

        render_batch(rx, false).await;
    }
}
