use crate::model::DownloadStatus;
use reqwest::{header::CONTENT_TYPE, Client, Method, Request, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// REST client for the backend's `downloads/` collection.
#[derive(Clone, Debug)]
pub struct DownloadsClient {
    http: Client,
    downloads_url: Url,
}

#[derive(Clone, Debug)]
pub struct DownloadsClientBuilder {
    api_base_url: String,
    timeout: Duration,
}

impl DownloadsClientBuilder {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<DownloadsClient, ApiError> {
        let mut parsed =
            Url::parse(self.api_base_url.trim()).map_err(|err| ApiError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }
        let downloads_url = parsed
            .join("downloads/")
            .map_err(|err| ApiError::Url(err.to_string()))?;

        let http = Client::builder().timeout(self.timeout).build()?;
        Ok(DownloadsClient {
            http,
            downloads_url,
        })
    }
}

impl DownloadsClient {
    pub fn builder(api_base_url: impl Into<String>) -> DownloadsClientBuilder {
        DownloadsClientBuilder::new(api_base_url)
    }

    pub fn new(api_base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::builder(api_base_url).build()
    }

    pub async fn create_download(
        &self,
        url: &str,
        quality: Option<&str>,
    ) -> Result<DownloadTask, ApiError> {
        let req = self.build_create_request(&CreateDownloadRequest {
            url: url.to_string(),
            quality: quality.map(str::to_string),
        })?;
        let (status, body) = self.execute(req).await?;
        parse_create_response(status, &body)
    }

    pub async fn get_download(&self, task_id: &str) -> Result<Option<DownloadTask>, ApiError> {
        let req = self.build_task_request(Method::GET, task_id)?;
        let (status, body) = self.execute(req).await?;
        parse_get_response(status, &body)
    }

    /// `false` when the backend no longer knows the task or it already finished.
    pub async fn cancel_download(&self, task_id: &str) -> Result<bool, ApiError> {
        let req = self.build_task_request(Method::DELETE, task_id)?;
        let (status, body) = self.execute(req).await?;
        parse_cancel_response(status, &body)
    }

    pub fn file_url(&self, task_id: &str) -> Result<Url, ApiError> {
        self.task_url(&format!("{}/file", checked_task_id(task_id)?))
    }

    /// The `ws`/`wss` twin of the downloads collection, without a trailing slash.
    pub fn channel_base_url(&self) -> Result<String, ApiError> {
        let mut url = self.downloads_url.clone();
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ApiError::Url(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::Url(format!("cannot switch {url} to {scheme}")))?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    pub fn build_create_request(
        &self,
        request: &CreateDownloadRequest,
    ) -> Result<Request, ApiError> {
        let body = serde_json::to_vec(request)?;
        let req = self
            .http
            .request(Method::POST, self.downloads_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()?;
        Ok(req)
    }

    pub fn build_task_request(&self, method: Method, task_id: &str) -> Result<Request, ApiError> {
        let url = self.task_url(checked_task_id(task_id)?)?;
        Ok(self.http.request(method, url).build()?)
    }

    fn task_url(&self, path: &str) -> Result<Url, ApiError> {
        self.downloads_url
            .join(path)
            .map_err(|err| ApiError::Url(err.to_string()))
    }

    async fn execute(&self, req: Request) -> Result<(StatusCode, String), ApiError> {
        tracing::debug!(method = %req.method(), url = %req.url(), "downloads api request");
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        Ok((status, body))
    }
}

fn checked_task_id(task_id: &str) -> Result<&str, ApiError> {
    let trimmed = task_id.trim();
    if trimmed.is_empty() || trimmed.contains(&['/', '?', '#'][..]) {
        return Err(ApiError::InvalidTaskId(task_id.to_string()));
    }
    Ok(trimmed)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("url error: {0}")]
    Url(String),
    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api error {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDownloadRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    pub status: DownloadStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

pub fn parse_create_response(status: StatusCode, body: &str) -> Result<DownloadTask, ApiError> {
    if !(status == StatusCode::OK || status == StatusCode::CREATED) {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    Ok(serde_json::from_str(body)?)
}

pub fn parse_get_response(
    status: StatusCode,
    body: &str,
) -> Result<Option<DownloadTask>, ApiError> {
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    Ok(Some(serde_json::from_str(body)?))
}

pub fn parse_cancel_response(status: StatusCode, body: &str) -> Result<bool, ApiError> {
    if status == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::Value;

    fn client() -> DownloadsClient {
        DownloadsClient::builder("http://backend.test:8000/api/v1")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    const TASK_JSON: &str = r#"{
        "id": "9b2f",
        "task_id": "9b2f",
        "url": "https://www.youtube.com/playlist?list=PL1",
        "title": "Road Trip",
        "author": "Various",
        "status": "downloading",
        "progress": 37.5,
        "error": null,
        "created_at": "2024-05-01T10:00:00",
        "updated_at": "2024-05-01T10:01:00",
        "quality": "320k",
        "output_path": null
    }"#;

    #[test]
    fn create_request_posts_json_to_collection() {
        let req = client()
            .build_create_request(&CreateDownloadRequest {
                url: "https://open.spotify.com/playlist/abc".to_string(),
                quality: Some("192k".to_string()),
            })
            .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(
            req.url().as_str(),
            "http://backend.test:8000/api/v1/downloads/"
        );
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/json")
        );
        let body = req.body().unwrap().as_bytes().unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["url"], "https://open.spotify.com/playlist/abc");
        assert_eq!(json["quality"], "192k");
    }

    #[test]
    fn create_request_omits_missing_quality() {
        let req = client()
            .build_create_request(&CreateDownloadRequest {
                url: "https://youtu.be/x".to_string(),
                quality: None,
            })
            .unwrap();
        let body = req.body().unwrap().as_bytes().unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert!(json.get("quality").is_none());
    }

    #[test]
    fn task_requests_address_the_task() {
        let client = client();
        let get = client.build_task_request(Method::GET, "9b2f").unwrap();
        assert_eq!(get.url().as_str(), "http://backend.test:8000/api/v1/downloads/9b2f");
        let delete = client.build_task_request(Method::DELETE, "9b2f").unwrap();
        assert_eq!(delete.method(), Method::DELETE);
        assert_eq!(
            client.file_url("9b2f").unwrap().as_str(),
            "http://backend.test:8000/api/v1/downloads/9b2f/file"
        );
    }

    #[test]
    fn task_ids_with_path_characters_are_rejected() {
        let client = client();
        for bad in ["", "  ", "a/b", "x?y", "frag#1"] {
            assert!(
                matches!(
                    client.build_task_request(Method::GET, bad),
                    Err(ApiError::InvalidTaskId(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn channel_base_switches_to_websocket_scheme() {
        assert_eq!(
            client().channel_base_url().unwrap(),
            "ws://backend.test:8000/api/v1/downloads"
        );
        let secure = DownloadsClient::new("https://api.example.test/api/v1/").unwrap();
        assert_eq!(
            secure.channel_base_url().unwrap(),
            "wss://api.example.test/api/v1/downloads"
        );
    }

    #[test]
    fn parse_create_reads_task_and_ignores_legacy_field() {
        let task = parse_create_response(StatusCode::OK, TASK_JSON).unwrap();
        assert_eq!(task.id, "9b2f");
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(task.progress, 37.5);
        assert_eq!(task.quality.as_deref(), Some("320k"));
    }

    #[test]
    fn parse_create_surfaces_backend_rejection() {
        let err = parse_create_response(StatusCode::BAD_REQUEST, r#"{"detail":"bad url"}"#)
            .unwrap_err();
        match err {
            ApiError::Api { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("bad url"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn parse_get_maps_404_to_none() {
        assert!(parse_get_response(StatusCode::NOT_FOUND, r#"{"detail":"Task not found"}"#)
            .unwrap()
            .is_none());
        assert!(parse_get_response(StatusCode::OK, TASK_JSON).unwrap().is_some());
        assert!(matches!(
            parse_get_response(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            Err(ApiError::Api { .. })
        ));
    }

    #[test]
    fn parse_cancel_distinguishes_unknown_tasks() {
        assert!(parse_cancel_response(StatusCode::OK, r#"{"message":"ok"}"#).unwrap());
        assert!(!parse_cancel_response(StatusCode::NOT_FOUND, "").unwrap());
        assert!(parse_cancel_response(StatusCode::BAD_GATEWAY, "").is_err());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            DownloadsClient::new("not a url"),
            Err(ApiError::Url(_))
        ));
    }
}
