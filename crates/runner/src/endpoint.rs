// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The backend's view of its instance: pull the next task, push responses.
//!
//! Real backends speak HTTP to the runner; [`HttpTaskClient`] is the same
//! conversation from Rust, using the urls a backend finds in its
//! environment. [`LocalEndpoint`] skips the network and talks to a
//! [`Runner`] directly.

use std::time::Duration;

use async_trait::async_trait;
use model_runtime::{RESPONSE_URL_ENV, TASK_URL_ENV};
use protocol::{WorkerTask, WorkerTaskResponse};
use reqwest::StatusCode;
use thiserror::Error;

use crate::error::PushError;
use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Rejected(#[from] PushError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("runner answered with status {0}")]
    Status(u16),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

#[async_trait]
pub trait TaskEndpoint: Send + Sync {
    /// The next task for this instance, or `None` if none arrived in time.
    async fn pull(&self) -> Result<Option<WorkerTask>, EndpointError>;

    async fn push(&self, response: WorkerTaskResponse) -> Result<(), EndpointError>;
}

/// In-process endpoint bound to one instance of a [`Runner`].
#[derive(Clone)]
pub struct LocalEndpoint {
    runner: Runner,
    instance_id: String,
    wait: Duration,
}

impl LocalEndpoint {
    pub fn new(runner: Runner, instance_id: impl Into<String>) -> Self {
        let wait = runner.settings().pull_wait;
        Self {
            runner,
            instance_id: instance_id.into(),
            wait,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl TaskEndpoint for LocalEndpoint {
    async fn pull(&self) -> Result<Option<WorkerTask>, EndpointError> {
        Ok(self.runner.pull_task(&self.instance_id, self.wait).await?)
    }

    async fn push(&self, response: WorkerTaskResponse) -> Result<(), EndpointError> {
        Ok(self
            .runner
            .push_response(&self.instance_id, response)
            .await?)
    }
}

/// HTTP client for the runner's worker api.
#[derive(Debug, Clone)]
pub struct HttpTaskClient {
    client: reqwest::Client,
    task_url: String,
    response_url: String,
}

impl HttpTaskClient {
    pub fn new(task_url: impl Into<String>, response_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            task_url: task_url.into(),
            response_url: response_url.into(),
        }
    }

    /// Build a client from the variables a backend is launched with.
    pub fn from_env() -> Result<Self, EndpointError> {
        let task_url =
            std::env::var(TASK_URL_ENV).map_err(|_| EndpointError::MissingEnv(TASK_URL_ENV))?;
        let response_url = std::env::var(RESPONSE_URL_ENV)
            .map_err(|_| EndpointError::MissingEnv(RESPONSE_URL_ENV))?;
        Ok(Self::new(task_url, response_url))
    }
}

#[async_trait]
impl TaskEndpoint for HttpTaskClient {
    async fn pull(&self) -> Result<Option<WorkerTask>, EndpointError> {
        let resp = self.client.get(&self.task_url).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NO_CONTENT => Ok(None),
            other => Err(EndpointError::Status(other.as_u16())),
        }
    }

    async fn push(&self, response: WorkerTaskResponse) -> Result<(), EndpointError> {
        let resp = self
            .client
            .post(&self.response_url)
            .json(&response)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EndpointError::Status(resp.status().as_u16()))
        }
    }
}
