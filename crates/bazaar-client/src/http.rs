//! REST implementations of the chat collaborator traits.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bazaar_chat::{ChatBackend, LocalAsset, MediaUploader, ProfileResolver};
use bazaar_shared::constants::MAX_IMAGE_SIZE;
use bazaar_shared::{
    BlockRequest, ChatError, Message, MessageReport, Profile, Result, RetractRequest, SeenRequest,
    SendRequest, UserId, UserReport,
};

use crate::config::ClientConfig;

/// Thin wrapper over a shared `reqwest` client and the API base URL.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    max_upload_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    path: String,
}

#[derive(Debug, Serialize)]
struct PresenceUpdate {
    online: bool,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ChatError::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            max_upload_bytes: MAX_IMAGE_SIZE,
        })
    }

    /// Size the server is expected to accept, reported back on a 413.
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let request = self.client.get(self.url(path));
        let response = execute(request).await?;
        decode(response).await
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self.client.post(self.url(path)).json(body);
        let response = execute(request).await?;
        decode(response).await
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let request = self.client.post(self.url(path)).json(body);
        execute(request).await?;
        Ok(())
    }

    pub(crate) async fn put_presence(&self, user: UserId, online: bool) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!("presence/{user}")))
            .json(&PresenceUpdate { online });
        execute(request).await?;
        Ok(())
    }
}

/// Send the request and turn non-2xx answers into errors.
async fn execute(request: RequestBuilder) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| ChatError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(%status, %body, "request rejected");
    Err(status_error(status, &body))
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ChatError::Network(e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Error for a non-2xx answer from a JSON endpoint.
pub fn status_error(status: StatusCode, body: &str) -> ChatError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => ChatError::Validation(detail),
        _ => ChatError::Network(detail),
    }
}

/// Error for a failed upload. 413 is reported apart from everything else.
pub fn upload_error(status: StatusCode, size: u64, max: u64) -> ChatError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ChatError::PayloadTooLarge { size, max }
    } else {
        ChatError::UploadFailed(status.to_string())
    }
}

fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn send(&self, request: &SendRequest) -> Result<Message> {
        self.post_json("chat/messages", request).await
    }

    async fn mark_seen(&self, request: &SeenRequest) -> Result<()> {
        self.post_unit(&format!("chat/rooms/{}/seen", request.room_id), request)
            .await
    }

    async fn retract(&self, request: &RetractRequest) -> Result<()> {
        let path = format!(
            "chat/rooms/{}/messages/{}/retract",
            request.room_id, request.message_id
        );
        self.post_unit(&path, request).await
    }

    async fn report_message(&self, report: &MessageReport) -> Result<()> {
        self.post_unit("reports/messages", report).await
    }

    async fn report_user(&self, report: &UserReport) -> Result<()> {
        self.post_unit("reports/users", report).await
    }

    async fn block_user(&self, request: &BlockRequest) -> Result<()> {
        self.post_unit("blocks", request).await
    }
}

#[async_trait]
impl MediaUploader for HttpBackend {
    async fn upload(&self, asset: &LocalAsset) -> Result<String> {
        let bytes = tokio::fs::read(local_path(&asset.uri))
            .await
            .map_err(|e| ChatError::UploadFailed(format!("cannot read {}: {e}", asset.uri)))?;
        let size = bytes.len() as u64;
        let name = asset.uri.rsplit('/').next().unwrap_or("image");

        let response = self
            .client
            .post(self.url("uploads"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-File-Name", name)
            .body(bytes)
            .send()
            .await
            .map_err(|e| ChatError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let err = upload_error(status, size, self.max_upload_bytes);
            warn!(uri = %asset.uri, error = %err, "upload rejected");
            return Err(err);
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| ChatError::UploadFailed(e.to_string()))?;
        debug!(path = %uploaded.path, size, "upload stored");
        Ok(uploaded.path)
    }
}

#[async_trait]
impl ProfileResolver for HttpBackend {
    async fn resolve(&self, user: UserId) -> Result<Profile> {
        self.get_json(&format!("users/{user}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        let config = ClientConfig {
            api_base_url: base.to_string(),
            ..ClientConfig::default()
        };
        HttpBackend::new(&config).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let http = backend("https://api.bazaar.example/v1/");
        assert_eq!(http.url("users/42"), "https://api.bazaar.example/v1/users/42");
        assert_eq!(http.url("/blocks"), "https://api.bazaar.example/v1/blocks");
    }

    #[test]
    fn test_upload_413_is_payload_too_large() {
        let err = upload_error(StatusCode::PAYLOAD_TOO_LARGE, 20, 10);
        assert_eq!(err, ChatError::PayloadTooLarge { size: 20, max: 10 });

        let err = upload_error(StatusCode::BAD_GATEWAY, 20, 10);
        assert!(matches!(err, ChatError::UploadFailed(_)));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "message is empty"),
            ChatError::Validation(_)
        ));
        match status_error(StatusCode::SERVICE_UNAVAILABLE, "") {
            ChatError::Network(detail) => assert!(detail.contains("503")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///tmp/a.jpg"), "/tmp/a.jpg");
        assert_eq!(local_path("/tmp/a.jpg"), "/tmp/a.jpg");
    }

    #[tokio::test]
    async fn test_unreadable_asset_fails_upload() {
        let http = backend("http://127.0.0.1:9");
        let asset = LocalAsset {
            uri: "file:///definitely/not/here.jpg".into(),
            size_bytes: 10,
            width: 1,
            height: 1,
        };
        let err = http.upload(&asset).await.unwrap_err();
        assert!(matches!(err, ChatError::UploadFailed(_)));
    }
}
