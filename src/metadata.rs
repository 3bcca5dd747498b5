use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::UploadError;
use crate::rest_types::{RecordingDetails, VideoResource, VideoSnippet, VideoStatusBody};

const MEGABYTE: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * MEGABYTE;
/// Chunk sizes that are not a multiple of this are rejected by the resumable protocol
/// for every chunk but the last.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;
pub const DEFAULT_TITLE_TEMPLATE: &str = "{title} [{n}/{total}]";

/// Server-assigned identifier of an uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        ResourceId(id)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId(id.to_string())
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Public,
    Unlisted,
    Private,
}

impl FromStr for Privacy {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "public" => Ok(Privacy::Public),
            "unlisted" => Ok(Privacy::Unlisted),
            "private" => Ok(Privacy::Private),
            other => Err(UploadError::configuration(format!(
                "invalid privacy status '{other}' (expected public, unlisted or private)"
            ))),
        }
    }
}

impl Display for Privacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Privacy::Public => write!(f, "public"),
            Privacy::Unlisted => write!(f, "unlisted"),
            Privacy::Private => write!(f, "private"),
        }
    }
}

/// Recording location, parsed from `latitude=VAL,longitude=VAL[,altitude=VAL]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl FromStr for Location {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            UploadError::configuration(format!("invalid location '{value}': {reason}"))
        };

        let (mut latitude, mut longitude, mut altitude) = (None, None, None);
        for pair in value.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| invalid("expected key=value pairs"))?;
            let number: f64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid(&format!("'{raw}' is not a number")))?;
            match key.trim() {
                "latitude" => latitude = Some(number),
                "longitude" => longitude = Some(number),
                "altitude" => altitude = Some(number),
                other => return Err(invalid(&format!("unknown key '{other}'"))),
            }
        }

        Ok(Location {
            latitude: latitude.ok_or_else(|| invalid("latitude is required"))?,
            longitude: longitude.ok_or_else(|| invalid("longitude is required"))?,
            altitude,
        })
    }
}

/// Descriptive metadata sent with the resumable session request.
#[derive(Debug, Clone, Default)]
pub struct VideoMetadata {
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    pub privacy: Privacy,
    pub publish_at: Option<DateTime<Utc>>,
    pub recording_date: Option<DateTime<Utc>>,
    pub location: Option<Location>,
    pub default_language: Option<String>,
    pub default_audio_language: Option<String>,
}

impl VideoMetadata {
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.title.trim().is_empty() {
            return Err(UploadError::configuration(
                "Some required option are missing: title",
            ));
        }
        Ok(())
    }

    /// Copy of this metadata with the title rendered for video `index` of `total`.
    pub fn for_video(&self, template: &str, index: usize, total: usize) -> Self {
        VideoMetadata {
            title: render_title(&self.title, template, index, total),
            ..self.clone()
        }
    }

    /// Scheduled videos must stay private until their publish date.
    pub fn effective_privacy(&self) -> Privacy {
        if self.publish_at.is_some() {
            Privacy::Private
        } else {
            self.privacy
        }
    }

    pub fn resource_body(&self) -> VideoResource {
        VideoResource {
            snippet: VideoSnippet {
                title: self.title.clone(),
                description: self.description.clone(),
                tags: self.tags.clone(),
                category_id: self.category_id.clone(),
                default_language: self.default_language.clone(),
                default_audio_language: self.default_audio_language.clone(),
            },
            status: VideoStatusBody {
                privacy_status: self.effective_privacy(),
                publish_at: self.publish_at,
            },
            recording_details: RecordingDetails {
                location: self.location,
                recording_date: self.recording_date,
            },
        }
    }
}

/// Renders the title of video `index` (zero based) in a run of `total` videos.
///
/// Only the template is expanded; placeholders inside `title` are kept as typed.
/// Unknown `{...}` tokens are copied through.
pub fn render_title(title: &str, template: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        return title.to_string();
    }

    let mut rendered = String::with_capacity(template.len() + title.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let token = &rest[start..];
        let end = token.find('}').map_or(0, |end| end + 1);
        let value = match &token[..end] {
            "{title}" => Some(title.to_string()),
            "{n}" => Some((index + 1).to_string()),
            "{total}" => Some(total.to_string()),
            _ => None,
        };
        match value {
            Some(value) => {
                rendered.push_str(&value);
                rest = &token[end..];
            }
            None => {
                rendered.push('{');
                rest = &token[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Splits `"tag1, tag2,..."` into trimmed, non-empty tags.
pub fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses an ISO 8601 / RFC 3339 timestamp given for option `option`.
pub fn parse_timestamp(option: &str, value: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|e| {
            UploadError::configuration(format!(
                "--{option} must be an ISO 8601 date (YYYY-MM-DDThh:mm:ss.sZ), got '{value}': {e}"
            ))
        })
}

pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("flv") => "video/x-flv",
        Some("wmv") => "video/x-ms-wmv",
        Some("mpg" | "mpeg") => "video/mpeg",
        Some("3gp") => "video/3gpp",
        _ => "application/octet-stream",
    }
}

/// One video to upload. The size is captured once, before the transfer starts.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub chunk_size: u64,
    pub metadata: VideoMetadata,
}

impl UploadRequest {
    pub fn new(
        path: impl Into<PathBuf>,
        metadata: VideoMetadata,
        chunk_size: u64,
    ) -> Result<Self, UploadError> {
        let path = path.into();
        if chunk_size == 0 {
            return Err(UploadError::configuration("chunk size must be greater than zero"));
        }
        if chunk_size % CHUNK_GRANULARITY != 0 {
            warn!(
                chunk_size,
                "chunk size is not a multiple of 256 KiB, the server may reject intermediate chunks"
            );
        }

        let file_metadata = std::fs::metadata(&path).map_err(|e| UploadError::io(&path, e))?;
        if !file_metadata.is_file() {
            return Err(UploadError::configuration(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let size = file_metadata.len();
        if size == 0 {
            return Err(UploadError::configuration(format!(
                "{} is empty",
                path.display()
            )));
        }

        Ok(UploadRequest {
            content_type: guess_content_type(&path).to_string(),
            path,
            size,
            chunk_size,
            metadata,
        })
    }

    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size)
    }
}
