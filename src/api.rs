//! REST client for the Colab Track API.
//!
//! Requests carry the bearer token from the shared [`CredentialStore`].
//! Idempotent verbs (GET, PUT, DELETE) are retried on transport failures,
//! 5xx and 429 responses; POST and PATCH are sent once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::credentials::CredentialStore;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const API_BASE_URL: &str = "https://api.colabtrack.io/api";
pub const LOCAL_API_BASE_URL: &str = "http://localhost:3000/api";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_millis(400);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ApiDefaults::MAX_ATTEMPTS,
                initial_backoff: ApiDefaults::BACKOFF,
                max_backoff: ApiDefaults::MAX_BACKOFF,
                jitter: ApiDefaults::JITTER,
            },
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    credentials: Arc<dyn CredentialStore>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    local: bool,
    base_url_override: Option<String>,
}

impl ApiClient {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        Self::with_options(credentials, ApiClientOptions::default())
    }

    pub fn with_options(
        credentials: Arc<dyn CredentialStore>,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            credentials,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            local: false,
            base_url_override: None,
        })
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL. The override takes precedence over local
    /// mode.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url_override = Some(base_url.trim_end().trim_end_matches('/').to_string());
        self
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::PATCH, path, &[], Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::DELETE, path, &[], None).await
    }

    /// Logs in and stores the returned token in the credential store.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let body = serde_json::to_value(&request).map_err(|err| ApiError::Parse(err.to_string()))?;
        self.authenticate("/auth/login", &body).await
    }

    /// Creates an account from `user` and stores the returned token.
    pub async fn register(&self, user: &Value) -> Result<AuthSession, ApiError> {
        self.authenticate("/auth/register", user).await
    }

    /// Notifies the server and clears the stored token even if the call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.post("/auth/logout", &json!({})).await;
        self.credentials.clear();
        if let Err(err) = &result {
            warn!(event = "logout_request_failed", error = %err);
        }
        result.map(|_| ())
    }

    pub async fn profile(&self) -> Result<Value, ApiError> {
        self.get("/users/me", &[]).await
    }

    pub async fn notifications(&self) -> Result<Value, ApiError> {
        self.get("/notifications", &[]).await
    }

    pub async fn unread_notifications(&self) -> Result<Value, ApiError> {
        self.get("/notifications/unread", &[]).await
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<Value, ApiError> {
        self.patch(&format!("/notifications/{notification_id}/read"), &json!({}))
            .await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<Value, ApiError> {
        self.post("/notifications/read-all", &json!({})).await
    }

    pub async fn tasks(&self, project_id: &str) -> Result<Value, ApiError> {
        self.get(&format!("/projects/{project_id}/tasks"), &[]).await
    }

    pub async fn task(&self, project_id: &str, task_id: &str) -> Result<Value, ApiError> {
        self.get(&format!("/projects/{project_id}/tasks/{task_id}"), &[])
            .await
    }

    pub async fn update_task_status(
        &self,
        project_id: &str,
        task_id: &str,
        status: &str,
    ) -> Result<Value, ApiError> {
        self.patch(
            &format!("/projects/{project_id}/tasks/{task_id}/status"),
            &json!({ "status": status }),
        )
        .await
    }

    pub async fn comments(&self, project_id: &str, task_id: &str) -> Result<Value, ApiError> {
        self.get(
            &format!("/projects/{project_id}/tasks/{task_id}/comments"),
            &[],
        )
        .await
    }

    pub async fn add_comment(
        &self,
        project_id: &str,
        task_id: &str,
        comment: &str,
    ) -> Result<Value, ApiError> {
        self.post(
            &format!("/projects/{project_id}/tasks/{task_id}/comments"),
            &json!({ "comment": comment }),
        )
        .await
    }

    pub async fn projects(&self, workspace_id: &str) -> Result<Value, ApiError> {
        self.get(&format!("/workspaces/{workspace_id}/projects"), &[])
            .await
    }

    pub async fn project(&self, workspace_id: &str, project_id: &str) -> Result<Value, ApiError> {
        self.get(
            &format!("/workspaces/{workspace_id}/projects/{project_id}"),
            &[],
        )
        .await
    }

    async fn authenticate(&self, path: &str, body: &Value) -> Result<AuthSession, ApiError> {
        let data = self.post(path, body).await?;
        let response: LoginResponse =
            serde_json::from_value(data).map_err(|err| ApiError::Parse(err.to_string()))?;

        self.credentials.set_token(SecretString::new(response.token));
        Ok(AuthSession {
            user: response.user,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let endpoint = self.endpoint(path);
        let policy = if is_idempotent(&method) {
            self.retry_policy.clone()
        } else {
            RetryPolicy::single_attempt()
        };

        retry_async(
            &policy,
            |_| {
                let method = method.clone();
                let endpoint = endpoint.clone();
                async move { self.send_attempt(method, &endpoint, query, body).await }
            },
            ApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(base_url) = self.base_url_override.as_deref() {
            return base_url;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }

    async fn send_attempt(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .header(ACCEPT, "application/json");

        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(token) = self.credentials.token() {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let body = response.text().await.map_err(ApiError::Transport)?;

        parse_api_response(status, is_json, &body)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url())
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// User returned by a successful login or registration. The token itself goes
/// to the credential store.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSession {
    pub user: Value,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    user: Value,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {message}")]
    HttpStatus { status: StatusCode, message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::PUT || *method == Method::DELETE
}

fn parse_api_response(status: StatusCode, is_json: bool, body: &str) -> Result<Value, ApiError> {
    if !is_json {
        if status.is_success() {
            return Ok(Value::String(body.to_string()));
        }
        return Err(ApiError::HttpStatus {
            status,
            message: summarize_error_body(body),
        });
    }

    let data: Value = match serde_json::from_str(body) {
        Ok(data) => data,
        Err(_) if !status.is_success() => {
            return Err(ApiError::HttpStatus {
                status,
                message: summarize_error_body(body),
            });
        }
        Err(err) => return Err(ApiError::Parse(err.to_string())),
    };

    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            status,
            message: summarize_error_body(body),
        });
    }

    Ok(data)
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
