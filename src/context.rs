//! Per-scenario state: resolved settings, an HTTP client and the API token.
//!
//! Every scenario builds its own `ScenarioContext`, so scenarios running in
//! parallel never share a token or a client.

use crate::config::{Config, ConfigError, HarnessSettings};
use crate::http::{self, HttpError};
use crate::poll::{PollError, PollReport, PollSession};
use crate::process::{ManagedProcess, ProcessError, SpawnOptions};
use crate::retry::{RetryError, RetryPolicy};
use reqwest::Client;
use serde_json::Value;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Retry(#[from] RetryError<HttpError>),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("api.base_url is not configured")]
    MissingBaseUrl,
}

#[derive(Debug, Clone)]
pub struct ScenarioContext {
    settings: HarnessSettings,
    client: Client,
    token: Option<String>,
}

impl ScenarioContext {
    pub fn new(settings: HarnessSettings) -> Result<Self, ContextError> {
        let client = http::client(REQUEST_TIMEOUT)?;
        let token = settings.token.clone();
        Ok(Self {
            settings,
            client,
            token,
        })
    }

    /// Loads layered config relative to `project_dir` and builds a context
    /// from it.
    pub fn load(project_dir: Option<&Path>) -> Result<Self, ContextError> {
        let config = Config::load(project_dir)?;
        Self::new(HarnessSettings::from_config(&config)?)
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    /// Spawns the configured CLI binary with its default arguments followed
    /// by `args`.
    pub fn spawn_cli<I, S>(&self, args: I, options: SpawnOptions) -> Result<ManagedProcess, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = self
            .settings
            .default_args
            .iter()
            .map(OsString::from)
            .chain(args.into_iter().map(|arg| arg.as_ref().to_os_string()))
            .collect();
        debug!(binary = %self.settings.binary.display(), ?args, "spawning cli");
        ManagedProcess::spawn(&self.settings.binary, args, options)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry_policy()
    }

    pub fn poll_session(&self) -> PollSession {
        PollSession::new(self.settings.poll_interval, self.settings.poll_deadline)
    }

    pub fn api_url(&self, path: &str) -> Result<String, ContextError> {
        let base = self
            .settings
            .api_base_url
            .as_deref()
            .ok_or(ContextError::MissingBaseUrl)?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')))
    }

    /// GETs an API path with the scenario token, retrying per the
    /// configured policy.
    pub async fn fetch_json(&self, path: &str) -> Result<Value, ContextError> {
        let url = self.api_url(path)?;
        let policy = self.retry_policy();
        Ok(http::fetch_json_with_retry(&self.client, &url, self.token(), &policy).await?)
    }

    /// Reads a token from `path` and keeps it for later API calls.
    pub async fn acquire_token(&mut self, path: &str, field: &str) -> Result<&str, ContextError> {
        let url = self.api_url(path)?;
        let policy = self.retry_policy();
        let token = http::fetch_token_with_retry(&self.client, &url, field, &policy).await?;
        Ok(self.token.insert(token).as_str())
    }

    /// Polls a deployment URL until it is served without the building
    /// sentinel.
    pub async fn wait_for_deployment(&self, url: &str) -> Result<PollReport, ContextError> {
        Ok(http::wait_for_deployment(
            &self.client,
            url,
            self.token(),
            &self.settings.building_sentinel,
            self.settings.poll_interval,
            self.settings.poll_deadline,
        )
        .await?)
    }
}
