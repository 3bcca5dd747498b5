use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{Location, Privacy};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResource {
    pub snippet: VideoSnippet,
    pub status: VideoStatusBody,
    #[serde(skip_serializing_if = "RecordingDetails::is_empty")]
    pub recording_details: RecordingDetails,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_audio_language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatusBody {
    pub privacy_status: Privacy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_date: Option<DateTime<Utc>>,
}

impl RecordingDetails {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.recording_date.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoInsertResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoListResponse {
    #[serde(default)]
    pub items: Vec<VideoStatusItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoStatusItem {
    pub id: String,
    pub status: Option<VideoStatusDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatusDetails {
    pub upload_status: String,
    pub rejection_reason: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistListResponse {
    #[serde(default)]
    pub items: Vec<PlaylistResource>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistResource {
    pub id: String,
    pub snippet: Option<PlaylistSnippet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistSnippet {
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistInsertRequest {
    pub snippet: PlaylistSnippet,
    pub status: PlaylistStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStatus {
    pub privacy_status: Privacy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistItemInsertRequest {
    pub snippet: PlaylistItemSnippet,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemSnippet {
    pub playlist_id: String,
    pub resource_id: PlaylistItemResourceId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemResourceId {
    pub kind: String,
    pub video_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptionInsertRequest {
    pub snippet: CaptionInsertSnippet,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionInsertSnippet {
    pub video_id: String,
    pub language: String,
    pub name: String,
    pub is_draft: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionResource {
    pub id: String,
    pub snippet: CaptionResourceSnippet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionResourceSnippet {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
}
