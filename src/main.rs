use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{ArgValueCompleter, CompletionCandidate};
use iocraft::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use ytup::categories::{category_id, category_names};
use ytup::client::YoutubeClient;
use ytup::error::{EXIT_OTHER, UploadError};
use ytup::metadata::{
    DEFAULT_TITLE_TEMPLATE, Location, Privacy, ResourceId, UploadRequest, VideoMetadata,
    parse_tags, parse_timestamp,
};
use ytup::orchestrator::{
    BatchReport, CaptionRequest, DEFAULT_CAPTION_LANGUAGE, DEFAULT_CAPTION_NAME, Orchestrator,
    PlaylistTarget, PostProcessPlan, parse_draft_flag, validate_batch,
};
use ytup::poller::{PollConfig, StatusSource};

use crate::config::Config;
use crate::ui::{ErrorMessage, ProcessingStatus, SuccessMessage, TerminalBatch, render_batch};

mod config;
mod ui;

#[derive(Parser)]
#[command(name = "ytup")]
#[command(version)]
#[command(about = "Upload videos to YouTube")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct UploadArgs {
    /// Video files to upload
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    videos: Vec<PathBuf>,
    /// Video title
    #[arg(short, long)]
    title: Option<String>,
    /// Video category name, e.g. "Music"
    #[arg(short, long, add = ArgValueCompleter::new(category_completer))]
    category: Option<String>,
    #[arg(short, long, conflicts_with = "description_file")]
    description: Option<String>,
    /// Read the description from a file
    #[arg(long, value_hint = ValueHint::FilePath)]
    description_file: Option<PathBuf>,
    /// Comma separated tags
    #[arg(long)]
    tags: Option<String>,
    /// public, unlisted or private
    #[arg(long, default_value = "public")]
    privacy: String,
    /// Scheduled publication date (ISO 8601); forces private privacy
    #[arg(long)]
    publish_at: Option<String>,
    /// latitude=VAL,longitude=VAL[,altitude=VAL]
    #[arg(long)]
    location: Option<String>,
    /// Recording date (ISO 8601)
    #[arg(long)]
    recording_date: Option<String>,
    #[arg(long)]
    default_language: Option<String>,
    #[arg(long)]
    default_audio_language: Option<String>,
    /// JPEG or PNG image used as the video thumbnail
    #[arg(long, value_hint = ValueHint::FilePath)]
    thumbnail: Option<PathBuf>,
    /// Playlist title, created if it does not exist
    #[arg(long)]
    playlist: Option<String>,
    /// Title of each video when uploading several
    #[arg(long, default_value = DEFAULT_TITLE_TEMPLATE)]
    title_template: String,
    /// Caption track, uploaded once the video is processed
    #[arg(long, value_hint = ValueHint::FilePath)]
    caption_file: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_CAPTION_LANGUAGE)]
    caption_lang: String,
    #[arg(long, default_value = DEFAULT_CAPTION_NAME)]
    caption_name: String,
    /// Upload the caption as a draft (yes/no)
    #[arg(long, default_value = "no")]
    caption_asdraft: String,
    /// Upload chunk size in bytes
    #[arg(long)]
    chunksize: Option<u64>,
    /// Delay between processing status checks, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,
    /// Give up waiting for processing after this long, e.g. "2h"
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_timeout: Option<Duration>,
    /// Stop at the first video that fails to upload
    #[arg(long)]
    fail_fast: bool,
    /// Do not draw a progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more videos
    Upload(UploadArgs),
    /// Show the processing state of an uploaded video
    Status { video_id: String },
    /// Store the access token in the OS keyring
    SetToken { token: String },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() -> ExitCode {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Unable to start the async runtime: {e}");
            return ExitCode::from(EXIT_OTHER);
        }
    };
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();
    init_tracing();

    let result: Result<u8> = rt.block_on(async {
        match cli.command {
            Commands::SetToken { token } => {
                config::set_access_token_keyring(token)?;
                element!(SuccessMessage(message: "Access token stored in the OS keyring".to_string()))
                    .print();
                Ok(0)
            }
            requires_token => {
                let config = config::read_config()?;
                match requires_token {
                    Commands::Upload(args) => upload(args, &config).await,
                    Commands::Status { video_id } => status(&config, video_id).await,
                    Commands::SetToken { .. } => unreachable!("handled above"),
                }
            }
        }
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<UploadError>())
        .map_or(EXIT_OTHER, UploadError::exit_code)
}

fn client(config: &Config) -> Result<YoutubeClient> {
    Ok(YoutubeClient::new(
        config.api_base_url.clone(),
        config.upload_base_url.clone(),
        config.access_token()?,
    )?)
}

async fn status(config: &Config, video_id: String) -> Result<u8> {
    let client = client(config)?;
    let state = client
        .processing_state(&ResourceId::from(video_id.as_str()))
        .await?;
    element!(ProcessingStatus(video_id: video_id, state: Some(state))).print();
    Ok(0)
}

fn read_metadata(args: &UploadArgs) -> Result<VideoMetadata, UploadError> {
    let description = match &args.description_file {
        Some(path) => {
            Some(std::fs::read_to_string(path).map_err(|e| UploadError::io(path, e))?)
        }
        None => args.description.clone(),
    };
    let category = args
        .category
        .as_deref()
        .map(category_id)
        .transpose()?
        .map(str::to_string);

    let metadata = VideoMetadata {
        title: args.title.clone().unwrap_or_default(),
        description,
        tags: args.tags.as_deref().map(parse_tags).unwrap_or_default(),
        category_id: category,
        privacy: args.privacy.parse()?,
        publish_at: args
            .publish_at
            .as_deref()
            .map(|value| parse_timestamp("publish-at", value))
            .transpose()?,
        recording_date: args
            .recording_date
            .as_deref()
            .map(|value| parse_timestamp("recording-date", value))
            .transpose()?,
        location: args
            .location
            .as_deref()
            .map(str::parse::<Location>)
            .transpose()?,
        default_language: args.default_language.clone(),
        default_audio_language: args.default_audio_language.clone(),
    };
    metadata.validate()?;
    Ok(metadata)
}

fn read_plan(args: &UploadArgs, privacy: Privacy) -> Result<PostProcessPlan, UploadError> {
    let caption = match &args.caption_file {
        Some(path) => Some(CaptionRequest::load(
            path,
            args.caption_lang.as_str(),
            args.caption_name.as_str(),
            parse_draft_flag(&args.caption_asdraft)?,
        )?),
        None => None,
    };

    Ok(PostProcessPlan {
        thumbnail: args.thumbnail.clone(),
        playlist: args.playlist.clone().map(|title| PlaylistTarget { title, privacy }),
        caption,
    })
}

async fn upload(args: UploadArgs, config: &Config) -> Result<u8> {
    let metadata = read_metadata(&args)?;
    let plan = read_plan(&args, metadata.privacy)?;
    validate_batch(&args.videos, &plan)?;

    let chunk_size = args.chunksize.unwrap_or(config.chunk_size);
    let total = args.videos.len();
    let requests = args
        .videos
        .iter()
        .enumerate()
        .map(|(index, path)| {
            UploadRequest::new(
                path,
                metadata.for_video(&args.title_template, index, total),
                chunk_size,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let client = client(config)?;
    let poll = PollConfig {
        interval: args.poll_interval.unwrap_or(config.poll_interval),
        max_wait: args.poll_timeout.unwrap_or(config.poll_timeout),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the upload");
            on_interrupt.cancel();
        }
    });

    let interactive = std::io::stdout().is_terminal();
    let (events, rendered) = mpsc::unbounded_channel();
    let publishing = async {
        // Dropping the observer at the end of this block ends the renderer.
        let mut observer = TerminalBatch::new(events, interactive && !args.no_progress, total);
        Orchestrator::new(&client)
            .with_poll_config(poll)
            .with_cancellation(cancel)
            .publish_all(&requests, &plan, args.fail_fast, &mut observer)
            .await
    };
    let (batch, ()) = tokio::join!(publishing, render_batch(rendered, interactive));
    let batch = batch?;

    if interactive {
        print_failures(&batch);
    }
    Ok(batch.exit_code())
}

fn print_failures(batch: &BatchReport) {
    for failure in &batch.failures {
        element!(ErrorMessage(message: failure.to_string())).print();
    }
    if batch.skipped > 0 {
        element!(ErrorMessage(message: format!("{} video(s) not attempted", batch.skipped)))
            .print();
    }
}

fn category_completer(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let Some(current) = current.to_str() else {
        return Vec::new();
    };
    category_names()
        .filter(|name| name.starts_with(current))
        .map(CompletionCandidate::new)
        .collect()
}
