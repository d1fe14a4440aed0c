//! HTTP client for the remote task service.
//!
//! Endpoints, relative to the base URL:
//!
//! - `GET /tasks?since=<cursor>` returns `{"tasks": [...], "cursor": "..."}`.
//! - `POST /tasks` with a task body returns `{"version": n}`.
//! - `PUT /tasks/{id}` with a task body plus `expectedVersion` returns
//!   `{"version": n}`, or `409` with the server's copy of the task.

use crate::error::{Error, Result};
use crate::sync::remote::{RemoteChanges, RemoteError, RemoteTaskService};
use crate::tasks::models::Task;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const BODY_PREVIEW_LIMIT: usize = 256;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest<'a> {
    #[serde(flatten)]
    task: &'a Task,
    expected_version: u64,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: u64,
}

/// [`RemoteTaskService`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    token: Option<String>,
    url_tasks: String,
}

impl HttpRemote {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Remote(format!("could not build HTTP client: {e}")))?;
        let url_tasks = format!("{}/tasks", base_url.trim_end_matches('/'));
        Ok(Self { http, token: None, url_tasks })
    }

    /// Send `token` as a bearer token on every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) if !token.trim().is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<String, RemoteError> {
        let response = self.auth(request).send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        debug!(%status, bytes = body.len(), "remote responded");

        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::CONFLICT {
            let remote = serde_json::from_str::<Task>(&body).map_err(|e| {
                RemoteError::Rejected(format!("unreadable conflict body: {e}: {}", preview(&body)))
            })?;
            return Err(RemoteError::Conflict { remote });
        }

        let message = format!("{status}: {}", preview(&body));
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(RemoteError::Transient(message))
        } else {
            Err(RemoteError::Rejected(message))
        }
    }

    async fn send_for_version(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<u64, RemoteError> {
        let body = self.send(request).await?;
        serde_json::from_str::<VersionResponse>(&body)
            .map(|r| r.version)
            .map_err(|e| RemoteError::Rejected(format!("unreadable version response: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Rejected(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut out: String = trimmed.chars().take(BODY_PREVIEW_LIMIT).collect();
    if trimmed.chars().count() > BODY_PREVIEW_LIMIT {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl RemoteTaskService for HttpRemote {
    async fn fetch_since(
        &self,
        cursor: Option<&str>,
    ) -> std::result::Result<RemoteChanges, RemoteError> {
        let mut request = self.http.get(&self.url_tasks);
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor)]);
        }
        let body = self.send(request).await?;
        serde_json::from_str(&body).map_err(|e| {
            RemoteError::Rejected(format!("unreadable task list: {e}: {}", preview(&body)))
        })
    }

    async fn create(&self, task: &Task) -> std::result::Result<u64, RemoteError> {
        self.send_for_version(self.http.post(&self.url_tasks).json(task)).await
    }

    async fn update(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> std::result::Result<u64, RemoteError> {
        let url = format!("{}/{}", self.url_tasks, task.id);
        let body = UpdateRequest { task, expected_version };
        self.send_for_version(self.http.put(url).json(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use mockito::{Matcher, Server};

    fn task() -> Task {
        let at = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(19_000);
        Task {
            id: "abc".to_string(),
            text: "Buy milk".to_string(),
            completed: false,
            created_at: at,
            updated_at: at,
            completed_at: None,
            deleted_at: None,
            version: 2,
        }
    }

    fn client(server: &Server) -> HttpRemote {
        HttpRemote::new(&server.url(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("  "), "<empty body>");
        let long = "x".repeat(BODY_PREVIEW_LIMIT + 1);
        assert!(preview(&long).ends_with("..."));
    }

    #[tokio::test]
    async fn test_fetch_since_sends_cursor() {
        let mut server = Server::new_async().await;
        let changes = RemoteChanges { tasks: vec![task()], cursor: Some("9".to_string()) };
        let body = serde_json::to_string(&changes).unwrap();
        let mock = server
            .mock("GET", "/tasks")
            .match_query(Matcher::UrlEncoded("since".into(), "4".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let changes = client(&server).fetch_since(Some("4")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(changes.tasks, vec![task()]);
        assert_eq!(changes.cursor.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_create_returns_version() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/tasks")
            .match_body(Matcher::PartialJson(serde_json::json!({"id": "abc", "text": "Buy milk"})))
            .with_status(201)
            .with_body(r#"{"version":1}"#)
            .create_async()
            .await;

        assert_eq!(client(&server).create(&task()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_sends_expected_version() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("PUT", "/tasks/abc")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "id": "abc",
                "expectedVersion": 2
            })))
            .with_status(200)
            .with_body(r#"{"version":3}"#)
            .create_async()
            .await;

        assert_eq!(client(&server).update(&task(), 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_update_conflict_carries_remote_copy() {
        let mut server = Server::new_async().await;
        let remote = Task { text: "Buy oat milk".to_string(), version: 3, ..task() };
        let _m = server
            .mock("PUT", "/tasks/abc")
            .with_status(409)
            .with_body(serde_json::to_string(&remote).unwrap())
            .create_async()
            .await;

        let err = client(&server).update(&task(), 2).await.unwrap_err();
        assert_eq!(err, RemoteError::Conflict { remote });
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let mut server = Server::new_async().await;
        let _m =
            server.mock("POST", "/tasks").with_status(503).with_body("down").create_async().await;

        let err = client(&server).create(&task()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_client_errors_are_rejected() {
        let mut server = Server::new_async().await;
        let _m =
            server.mock("PUT", "/tasks/abc").with_status(422).with_body("bad").create_async().await;

        let err = client(&server).update(&task(), 2).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/tasks")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(r#"{"tasks":[]}"#)
            .create_async()
            .await;

        let remote = client(&server).with_token("secret");
        assert!(remote.fetch_since(None).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let remote = HttpRemote::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(remote.fetch_since(None).await, Err(RemoteError::Transient(_))));
    }
}
