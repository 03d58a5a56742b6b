use crate::models::{Note, NoteDraft, NotePatch, Partition};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the sync engine.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// No connectivity or the request timed out.
    #[error("network error: {0}")]
    Network(String),

    /// Credential rejected (401). Ends the session.
    #[error("unauthorized")]
    Auth,

    #[error("request failed ({status}): {message}")]
    Api { status: u16, message: String },

    /// Payload rejected client-side before any request was sent.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("local storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub(crate) fn timeout(ms: u128) -> Self {
        SyncError::Network(format!("request timed out after {ms}ms"))
    }

    fn http(status: StatusCode, body: String) -> Self {
        // Prefer the server-supplied `{ "error": ... }` message when present.
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body);
        SyncError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

pub type ApiResult<T> = Result<T, SyncError>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub archived: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub pinned_ids: Vec<String>,
    pub other_ids: Vec<String>,
}

/// Remote note endpoints. One method per route; implementations never retry.
#[async_trait(?Send)]
pub trait NotesApi {
    async fn list_notes(&self, partition: Partition) -> ApiResult<Vec<Note>>;
    async fn get_note(&self, id: &str) -> ApiResult<Note>;
    async fn create_note(&self, draft: &NoteDraft) -> ApiResult<Note>;
    async fn update_note(&self, note: &Note) -> ApiResult<Note>;
    async fn patch_note(&self, id: &str, patch: &NotePatch) -> ApiResult<Note>;
    async fn delete_note(&self, id: &str) -> ApiResult<()>;
    async fn restore_note(&self, id: &str) -> ApiResult<()>;
    async fn delete_note_permanent(&self, id: &str) -> ApiResult<()>;
    async fn empty_trash(&self) -> ApiResult<()>;
    async fn archive_note(&self, id: &str, archived: bool) -> ApiResult<()>;
    async fn reorder_notes(&self, req: &ReorderRequest) -> ApiResult<()>;
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn clear_token(&mut self) {
        self.token = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub(crate) fn get_auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL for the server-push stream. `EventSource` cannot set headers, so the
    /// credential travels as a query parameter.
    pub fn push_url(&self, path: &str) -> String {
        match &self.token {
            Some(t) => format!("{}?token={}", self.url(path), urlencoding::encode(t)),
            None => self.url(path),
        }
    }

    fn note_path(id: &str, suffix: &str) -> String {
        format!("/notes/{}{suffix}", urlencoding::encode(id))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> ApiResult<reqwest::Response> {
        let mut req = self.http.request(method, self.url(path));
        if let Some(auth) = self.get_auth_header() {
            req = req.header("Authorization", auth);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let res = req
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = res.status();
        if status.is_success() {
            Ok(res)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(SyncError::Auth)
        } else {
            let body = res.text().await.unwrap_or_default();
            Err(SyncError::http(status, body))
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> ApiResult<T> {
        let res = self.send(method, path, body).await?;
        res.json()
            .await
            .map_err(|e| SyncError::Parse(e.to_string()))
    }

    /// For endpoints whose response body carries nothing the cache needs.
    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> ApiResult<()> {
        self.send(method, path, body).await.map(|_| ())
    }
}

const NO_BODY: Option<&()> = None;

#[async_trait(?Send)]
impl NotesApi for ApiClient {
    async fn list_notes(&self, partition: Partition) -> ApiResult<Vec<Note>> {
        self.request_json(Method::GET, partition.path(), NO_BODY)
            .await
    }

    async fn get_note(&self, id: &str) -> ApiResult<Note> {
        self.request_json(Method::GET, &Self::note_path(id, ""), NO_BODY)
            .await
    }

    async fn create_note(&self, draft: &NoteDraft) -> ApiResult<Note> {
        self.request_json(Method::POST, "/notes", Some(draft)).await
    }

    async fn update_note(&self, note: &Note) -> ApiResult<Note> {
        self.request_json(Method::PUT, &Self::note_path(&note.id, ""), Some(note))
            .await
    }

    async fn patch_note(&self, id: &str, patch: &NotePatch) -> ApiResult<Note> {
        self.request_json(Method::PATCH, &Self::note_path(id, ""), Some(patch))
            .await
    }

    async fn delete_note(&self, id: &str) -> ApiResult<()> {
        self.request_empty(Method::DELETE, &Self::note_path(id, ""), NO_BODY)
            .await
    }

    async fn restore_note(&self, id: &str) -> ApiResult<()> {
        self.request_empty(Method::POST, &Self::note_path(id, "/restore"), NO_BODY)
            .await
    }

    async fn delete_note_permanent(&self, id: &str) -> ApiResult<()> {
        self.request_empty(Method::DELETE, &Self::note_path(id, "/permanent"), NO_BODY)
            .await
    }

    async fn empty_trash(&self) -> ApiResult<()> {
        self.request_empty(Method::DELETE, "/notes/trash", NO_BODY)
            .await
    }

    async fn archive_note(&self, id: &str, archived: bool) -> ApiResult<()> {
        self.request_empty(
            Method::POST,
            &Self::note_path(id, "/archive"),
            Some(&ArchiveRequest { archived }),
        )
        .await
    }

    async fn reorder_notes(&self, req: &ReorderRequest) -> ApiResult<()> {
        self.request_empty(Method::POST, "/notes/reorder", Some(req))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_client_new_trims_trailing_slash() {
        let client = ApiClient::new("http://localhost:6689/".to_string());
        assert_eq!(client.base_url, "http://localhost:6689");
        assert_eq!(client.url("/notes"), "http://localhost:6689/notes");
        assert!(client.token.is_none());
    }

    #[test]
    fn test_api_client_auth_header() {
        let client = ApiClient::new("http://localhost:6689".to_string());
        assert!(client.get_auth_header().is_none());
        assert!(!client.is_authenticated());

        let client = client.with_token("my-jwt-token");
        assert_eq!(
            client.get_auth_header().as_deref(),
            Some("Bearer my-jwt-token")
        );
        assert!(client.is_authenticated());
    }

    #[test]
    fn test_push_url_carries_token() {
        let client = ApiClient::new("http://localhost:6689".to_string());
        assert_eq!(client.push_url("/notes/events"), "http://localhost:6689/notes/events");
        let client = client.with_token("a b");
        assert_eq!(
            client.push_url("/notes/events"),
            "http://localhost:6689/notes/events?token=a%20b"
        );
    }

    #[test]
    fn test_note_path_encodes_id() {
        assert_eq!(ApiClient::note_path("a/b", "/restore"), "/notes/a%2Fb/restore");
        assert_eq!(ApiClient::note_path("n1", ""), "/notes/n1");
    }

    #[test]
    fn test_reorder_request_contract() {
        let req = ReorderRequest {
            pinned_ids: vec!["p2".to_string(), "p1".to_string()],
            other_ids: vec!["o1".to_string()],
        };
        let v = serde_json::to_value(req).expect("should serialize");
        assert_eq!(
            v,
            serde_json::json!({"pinnedIds": ["p2", "p1"], "otherIds": ["o1"]})
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Network("offline".to_string()).is_retryable());
        assert!(SyncError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Api {
            status: 422,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Auth.is_retryable());
        assert!(!SyncError::Validation("x".to_string()).is_retryable());
        assert!(!SyncError::Parse("x".to_string()).is_retryable());
    }

    #[test]
    fn test_http_error_prefers_server_message() {
        let e = SyncError::http(
            StatusCode::BAD_REQUEST,
            r#"{"error":"title too long"}"#.to_string(),
        );
        assert_eq!(
            e,
            SyncError::Api {
                status: 400,
                message: "title too long".to_string()
            }
        );

        let e = SyncError::http(StatusCode::BAD_GATEWAY, "upstream down".to_string());
        assert_eq!(e.to_string(), "request failed (502): upstream down");
    }
}
