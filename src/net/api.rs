//! REST collaborator calls: login, logout, and group message history.
//!
//! SYSTEM CONTEXT
//! ==============
//! The realtime socket only carries live traffic; everything else rides
//! over HTTP. History is fetched once per conversation before the
//! handshake, newest-first from the server and reversed here so the
//! cache can prepend it in chronological order.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use wire::ChatMessage;

/// Default page size for the history fetch.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Error raised by the REST collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unauthorized; credentials are no longer valid")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("server returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("missing expected field `{0}` in response")]
    MissingField(&'static str),
}

/// Successful login payload the session store persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginOutcome {
    pub token: String,
    pub user_id: String,
    pub nickname: String,
}

/// One record of the group history endpoint, newest first on the wire.
#[derive(Clone, Debug, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub group_id: i64,
    pub sender_id: i64,
    pub sender: String,
    pub text: String,
    pub created_at: String,
}

/// Thin client over the backend REST endpoints.
#[derive(Clone, Debug)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client for the given HTTP base URL.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// Exchange login name and password for a token and user identity.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] on rejected credentials and
    /// [`ApiError::MissingField`] when the response lacks a token.
    pub async fn login(&self, login: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .json(&serde_json::json!({ "login": login, "password": password }))
            .send()
            .await?;

        let status = response.status();
        let value = response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| Value::Null);

        if status.as_u16() == 401 {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: error_message(&value),
            });
        }

        extract_login_outcome(&value)
    }

    /// Invalidate the server-side session. Callers clear the local
    /// session store regardless of the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Server`] on a non-success status.
    pub async fn logout(&self, bearer: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/api/logout", self.base_url))
            .header(AUTHORIZATION, bearer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: "logout failed".to_owned(),
            });
        }
        Ok(())
    }

    /// Fetch the most recent messages for a group, returned in
    /// chronological order ready for the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] on 401 (a fatal auth signal),
    /// [`ApiError::Forbidden`] on 403, and [`ApiError::Server`] for
    /// other failure statuses.
    pub async fn group_history(
        &self,
        bearer: &str,
        group_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let url = format!(
            "{}/api/groups/messages?group_id={group_id}&limit={limit}",
            self.base_url
        );
        let response = self.http.get(url).header(AUTHORIZATION, bearer).send().await?;

        let status = response.status();
        match status.as_u16() {
            401 => return Err(ApiError::Unauthorized),
            403 => return Err(ApiError::Forbidden("not a member of this group".to_owned())),
            _ if !status.is_success() => {
                return Err(ApiError::Server {
                    status: status.as_u16(),
                    message: "failed to fetch messages".to_owned(),
                });
            }
            _ => {}
        }

        let records = response.json::<Vec<HistoryRecord>>().await?;
        Ok(history_to_messages(records))
    }
}

/// Reverse a newest-first history page into chronological messages.
fn history_to_messages(records: Vec<HistoryRecord>) -> Vec<ChatMessage> {
    records
        .into_iter()
        .rev()
        .map(|record| ChatMessage {
            sender: record.sender,
            content: record.text,
            timestamp: record.created_at,
            group_id: Some(record.group_id),
        })
        .collect()
}

/// Pull token and user identity out of the login response, tolerating
/// both plain and SQL-null-wrapped nickname shapes.
fn extract_login_outcome(value: &Value) -> Result<LoginOutcome, ApiError> {
    let token = value
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingField("token"))?
        .to_owned();

    let user = value.get("user").unwrap_or(&Value::Null);
    let user_id = user
        .get("id")
        .map(|id| match id {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => String::new(),
        })
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingField("user.id"))?;

    let nickname = user
        .get("nickname")
        .and_then(|n| {
            n.as_str()
                .or_else(|| n.get("String").and_then(Value::as_str))
        })
        .unwrap_or("")
        .to_owned();

    Ok(LoginOutcome { token, user_id, nickname })
}

fn error_message(value: &Value) -> String {
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_owned()
}
