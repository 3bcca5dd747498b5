use std::path::Path;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::error::UploadError;
use crate::metadata::{ResourceId, UploadRequest};
use crate::orchestrator::{
    CaptionInfo, CaptionRequest, MediaApi, PlaylistTarget, thumbnail_content_type,
};
use crate::poller::{ProcessingState, StatusSource};
use crate::rest_types::{
    ApiErrorResponse, CaptionInsertRequest, CaptionInsertSnippet, CaptionResource,
    PlaylistInsertRequest, PlaylistItemInsertRequest, PlaylistItemResourceId,
    PlaylistItemSnippet, PlaylistListResponse, PlaylistResource, PlaylistSnippet, PlaylistStatus,
    VideoInsertResponse, VideoListResponse,
};
use crate::transport::{ChunkError, ChunkOutcome, SessionHandle, UploadTransport, classify_status};

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/";
pub const DEFAULT_UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/";

const VIDEOS_ROUTE: &str = "youtube/v3/videos";
const THUMBNAILS_ROUTE: &str = "youtube/v3/thumbnails/set";
const PLAYLISTS_ROUTE: &str = "youtube/v3/playlists";
const PLAYLIST_ITEMS_ROUTE: &str = "youtube/v3/playlistItems";
const CAPTIONS_ROUTE: &str = "youtube/v3/captions";

/// Status the resumable protocol uses for "keep sending".
const RESUME_INCOMPLETE: u16 = 308;
const PLAYLIST_PAGE_SIZE: &str = "50";

struct Endpoints {
    videos: Url,
    video_upload: Url,
    thumbnails: Url,
    playlists: Url,
    playlist_items: Url,
    captions: Url,
}

impl Endpoints {
    fn new(api_base_url: &Url, upload_base_url: &Url) -> Result<Self, UploadError> {
        let join = |base: &Url, route: &str| {
            base.join(route).map_err(|e| {
                UploadError::configuration(format!("invalid base URL '{base}': {e}"))
            })
        };
        Ok(Self {
            videos: join(api_base_url, VIDEOS_ROUTE)?,
            video_upload: join(upload_base_url, VIDEOS_ROUTE)?,
            thumbnails: join(upload_base_url, THUMBNAILS_ROUTE)?,
            playlists: join(api_base_url, PLAYLISTS_ROUTE)?,
            playlist_items: join(api_base_url, PLAYLIST_ITEMS_ROUTE)?,
            captions: join(upload_base_url, CAPTIONS_ROUTE)?,
        })
    }
}

/// Authenticated client of the YouTube Data API.
pub struct YoutubeClient {
    client: Client,
    endpoints: Endpoints,
    access_token: String,
}

impl YoutubeClient {
    pub fn new(
        api_base_url: Url,
        upload_base_url: Url,
        access_token: String,
    ) -> Result<Self, UploadError> {
        // 308 is part of the upload protocol, not a redirect.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("ytup/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoints: Endpoints::new(&api_base_url, &upload_base_url)?,
            access_token,
        })
    }

    async fn find_playlist(&self, title: &str) -> Result<Option<String>, UploadError> {
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.endpoints.playlists.clone())
                .bearer_auth(&self.access_token)
                .query(&[
                    ("part", "snippet"),
                    ("mine", "true"),
                    ("maxResults", PLAYLIST_PAGE_SIZE),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: PlaylistListResponse = json_response(request.send().await?).await?;
            let found = page.items.into_iter().find(|playlist| {
                playlist
                    .snippet
                    .as_ref()
                    .is_some_and(|snippet| snippet.title == title)
            });
            if let Some(playlist) = found {
                return Ok(Some(playlist.id));
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(None),
            }
        }
    }

    async fn create_playlist(&self, target: &PlaylistTarget) -> Result<String, UploadError> {
        let body = PlaylistInsertRequest {
            snippet: PlaylistSnippet {
                title: target.title.clone(),
            },
            status: PlaylistStatus {
                privacy_status: target.privacy,
            },
        };
        let response = self
            .client
            .post(self.endpoints.playlists.clone())
            .bearer_auth(&self.access_token)
            .query(&[("part", "snippet,status")])
            .json(&body)
            .send()
            .await?;
        let playlist: PlaylistResource = json_response(response).await?;
        info!(playlist_id = %playlist.id, "Created playlist '{}'", target.title);
        Ok(playlist.id)
    }
}

#[async_trait]
impl UploadTransport for YoutubeClient {
    async fn start_session(&self, request: &UploadRequest) -> Result<SessionHandle, ChunkError> {
        debug!(
            path = %request.path.display(),
            size = request.size,
            content_type = %request.content_type,
            "Starting resumable upload session"
        );
        let response = self
            .client
            .post(self.endpoints.video_upload.clone())
            .bearer_auth(&self.access_token)
            .query(&[
                ("uploadType", "resumable"),
                ("part", "snippet,status,recordingDetails"),
            ])
            .header("X-Upload-Content-Length", request.size)
            .header("X-Upload-Content-Type", &request.content_type)
            .json(&request.metadata.resource_body())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), error_message(response).await));
        }

        response
            .headers()
            .get(header::LOCATION)
            .and_then(|location| location.to_str().ok())
            .map(SessionHandle::new)
            .ok_or_else(|| ChunkError::Permanent {
                status: status.as_u16(),
                message: "upload session response has no Location header".to_string(),
            })
    }

    async fn send_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        total: u64,
        data: Vec<u8>,
    ) -> Result<ChunkOutcome, ChunkError> {
        let end = offset + (data.len() as u64).saturating_sub(1);
        debug!(offset, end, total, "Sending chunk");
        let response = self
            .client
            .put(session.as_str())
            .bearer_auth(&self.access_token)
            .header(header::CONTENT_RANGE, format!("bytes {offset}-{end}/{total}"))
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;
        upload_outcome(response).await
    }

    async fn query_offset(
        &self,
        session: &SessionHandle,
        total: u64,
    ) -> Result<ChunkOutcome, ChunkError> {
        debug!(total, "Querying upload offset");
        let response = self
            .client
            .put(session.as_str())
            .bearer_auth(&self.access_token)
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(transport_error)?;
        upload_outcome(response).await
    }
}

#[async_trait]
impl StatusSource for YoutubeClient {
    async fn processing_state(&self, id: &ResourceId) -> Result<ProcessingState, UploadError> {
        let response = self
            .client
            .get(self.endpoints.videos.clone())
            .bearer_auth(&self.access_token)
            .query(&[("part", "status"), ("id", id.as_str())])
            .send()
            .await?;
        let list: VideoListResponse = json_response(response).await?;

        let status = list
            .items
            .into_iter()
            .next()
            .and_then(|item| item.status)
            .ok_or_else(|| UploadError::Request {
                status: None,
                message: format!("no status returned for video {id}"),
            })?;
        if let Some(reason) = status.rejection_reason.as_ref().or(status.failure_reason.as_ref()) {
            debug!(video_id = %id, %reason, "Processing did not succeed");
        }
        Ok(ProcessingState::from(status.upload_status.as_str()))
    }
}

#[async_trait]
impl MediaApi for YoutubeClient {
    async fn set_thumbnail(&self, id: &ResourceId, image: &Path) -> Result<(), UploadError> {
        let content_type = thumbnail_content_type(image)?;
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| UploadError::io(image, e))?;

        let response = self
            .client
            .post(self.endpoints.thumbnails.clone())
            .bearer_auth(&self.access_token)
            .query(&[("videoId", id.as_str())])
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        check_status(response).await?;
        info!(video_id = %id, "Thumbnail set from {}", image.display());
        Ok(())
    }

    async fn add_to_playlist(
        &self,
        id: &ResourceId,
        playlist: &PlaylistTarget,
    ) -> Result<String, UploadError> {
        let playlist_id = match self.find_playlist(&playlist.title).await? {
            Some(existing) => existing,
            None => self.create_playlist(playlist).await?,
        };

        let body = PlaylistItemInsertRequest {
            snippet: PlaylistItemSnippet {
                playlist_id: playlist_id.clone(),
                resource_id: PlaylistItemResourceId {
                    kind: "youtube#video".to_string(),
                    video_id: id.to_string(),
                },
            },
        };
        let response = self
            .client
            .post(self.endpoints.playlist_items.clone())
            .bearer_auth(&self.access_token)
            .query(&[("part", "snippet")])
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(playlist_id)
    }

    async fn insert_caption(
        &self,
        id: &ResourceId,
        caption: &CaptionRequest,
        caption_file: &Path,
    ) -> Result<CaptionInfo, UploadError> {
        let track = tokio::fs::read(caption_file)
            .await
            .map_err(|e| UploadError::io(caption_file, e))?;
        let snippet = CaptionInsertRequest {
            snippet: CaptionInsertSnippet {
                video_id: id.to_string(),
                language: caption.language.clone(),
                name: caption.name.clone(),
                is_draft: caption.draft,
            },
        };
        let snippet = serde_json::to_vec(&snippet).map_err(|e| UploadError::Request {
            status: None,
            message: format!("unable to encode caption metadata: {e}"),
        })?;

        let boundary = format!("ytup-{}", Uuid::new_v4().simple());
        let response = self
            .client
            .post(self.endpoints.captions.clone())
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart"), ("part", "snippet")])
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(multipart_related(&boundary, &snippet, &track))
            .send()
            .await?;

        let resource: CaptionResource = json_response(response).await?;
        Ok(CaptionInfo {
            id: resource.id,
            name: resource.snippet.name,
            language: resource.snippet.language,
            status: resource.snippet.status,
        })
    }
}

/// Builds a two-part `multipart/related` body: JSON metadata, then the media.
fn multipart_related(boundary: &str, metadata: &[u8], media: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + media.len() + 4 * boundary.len() + 128);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(
        format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Parses the `Range: bytes=0-N` header of a 308 response into the number of
/// bytes the server holds.
pub fn parse_range_header(value: &str) -> Option<u64> {
    let (start, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    if start.trim() != "0" {
        return None;
    }
    end.trim().parse::<u64>().ok().map(|last| last + 1)
}

async fn upload_outcome(response: Response) -> Result<ChunkOutcome, ChunkError> {
    match response.status().as_u16() {
        200 | 201 => {
            let video: VideoInsertResponse = response.json().await.map_err(transport_error)?;
            Ok(ChunkOutcome::Complete(ResourceId::from(video.id)))
        }
        RESUME_INCOMPLETE => {
            let confirmed = match response.headers().get(header::RANGE) {
                None => 0,
                Some(range) => range
                    .to_str()
                    .ok()
                    .and_then(parse_range_header)
                    .ok_or_else(|| ChunkError::Permanent {
                        status: RESUME_INCOMPLETE,
                        message: format!("malformed Range header {range:?}"),
                    })?,
            };
            Ok(ChunkOutcome::Incomplete { confirmed })
        }
        status => Err(classify_status(status, error_message(response).await)),
    }
}

fn transport_error(error: reqwest::Error) -> ChunkError {
    if error.is_builder() {
        ChunkError::Permanent {
            status: error.status().map_or(0, |status| status.as_u16()),
            message: error.to_string(),
        }
    } else {
        ChunkError::Transient(error.to_string())
    }
}

/// Human readable message of a failed response, from the API error body when present.
async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&body) {
        return api_error.error.message;
    }
    match body.trim() {
        "" => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        text => text.to_string(),
    }
}

async fn check_status(response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = error_message(response).await;
    if status == StatusCode::UNAUTHORIZED {
        Err(UploadError::Authentication(message))
    } else {
        Err(UploadError::Request {
            status: Some(status.as_u16()),
            message,
        })
    }
}

async fn json_response<T: DeserializeOwned>(response: Response) -> Result<T, UploadError> {
    Ok(check_status(response).await?.json().await?)
}
