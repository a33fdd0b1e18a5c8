use crate::poll::{
    CheckOutcome, PollError, PollReport, PollSession, excerpt, ready_unless_body_contains,
    server_error,
};
use crate::retry::{RetryError, RetryPolicy, retry_if};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

const USER_AGENT: &str = "deploy-harness";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {}", excerpt(.body))]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("field `{field}` missing from response of {url}")]
    MissingField { url: String, field: String },
}

impl HttpError {
    /// Whether repeating the same read could plausibly succeed. The retrying
    /// fetches stop at the first error for which this is false.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Request { .. } | HttpError::Json { .. } => true,
            HttpError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            HttpError::Client(_) | HttpError::MissingField { .. } => false,
        }
    }
}

pub fn client(timeout: Duration) -> Result<Client, HttpError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(HttpError::Client)
}

/// GETs `url` and reports its status and body. Any status is an `Ok`
/// outcome; only transport failures are errors.
pub async fn check(client: &Client, url: &str, token: Option<&str>) -> Result<CheckOutcome, HttpError> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|source| HttpError::Request {
        url: url.to_string(),
        source,
    })?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|source| HttpError::Request {
        url: url.to_string(),
        source,
    })?;
    trace!(url, status, bytes = body.len(), "checked");
    Ok(CheckOutcome { status, body })
}

pub async fn fetch_json(client: &Client, url: &str, token: Option<&str>) -> Result<Value, HttpError> {
    let outcome = check(client, url, token).await?;
    if !(200..300).contains(&outcome.status) {
        return Err(HttpError::Status {
            url: url.to_string(),
            status: outcome.status,
            body: outcome.body,
        });
    }
    serde_json::from_str(&outcome.body).map_err(|source| HttpError::Json {
        url: url.to_string(),
        source,
    })
}

pub async fn fetch_json_with_retry(
    client: &Client,
    url: &str,
    token: Option<&str>,
    policy: &RetryPolicy,
) -> Result<Value, RetryError<HttpError>> {
    retry_if(policy, |_| fetch_json(client, url, token), HttpError::is_transient).await
}

/// Fetches `url` and extracts `field` as a string. `field` is either a
/// top-level key or a JSON pointer such as `/data/token`.
pub async fn fetch_token_with_retry(
    client: &Client,
    url: &str,
    field: &str,
    policy: &RetryPolicy,
) -> Result<String, RetryError<HttpError>> {
    retry_if(
        policy,
        |_| async move {
            let value = fetch_json(client, url, None).await?;
            extract_field(&value, field).ok_or_else(|| HttpError::MissingField {
                url: url.to_string(),
                field: field.to_string(),
            })
        },
        HttpError::is_transient,
    )
    .await
}

/// Polls a deployment URL until it serves a 200 without `sentinel` in the
/// body. A server error ends the wait immediately.
pub async fn wait_for_deployment(
    client: &Client,
    url: &str,
    token: Option<&str>,
    sentinel: &str,
    interval: Duration,
    deadline: Duration,
) -> Result<PollReport, PollError> {
    let session = PollSession::new(interval, deadline)
        .ready_when(ready_unless_body_contains(sentinel))
        .fail_fast_when(server_error);
    session.run(|| check(client, url, token)).await
}

pub fn extract_field(value: &Value, field: &str) -> Option<String> {
    let found = if field.starts_with('/') {
        value.pointer(field)
    } else {
        value.get(field)
    }?;
    match found {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
