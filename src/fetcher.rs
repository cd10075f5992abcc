//! Rate-limited, retrying page fetcher.
//!
//! A [`Transport`] performs exactly one request. The [`Fetcher`] wraps it with
//! the per-task policy: spacing between requests, a per-request deadline,
//! and a bounded number of attempts with exponential backoff in between.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::{sleep, sleep_until, Instant};

use crate::{
    config::{FetchOptions, SourceOptions},
    error::FetchError,
    manager::registry::TaskEntry,
    params::TaskParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Form-encoded body, sent with `Method::Post` only.
    pub form: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub page: u32,
    pub status: u16,
    pub body: String,
}

/// One attempt at one request, nothing more.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError>;
}

/// Opens the per-run transport session. The session is released when the
/// returned transport is dropped at the end of the run.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &TaskParams) -> Result<Arc<dyn Transport>, FetchError>;
}

/// Hands the same transport to every run. Used for in-process sources.
#[derive(Clone)]
pub struct SharedConnector(pub Arc<dyn Transport>);

impl Connector for SharedConnector {
    fn connect(&self, _params: &TaskParams) -> Result<Arc<dyn Transport>, FetchError> {
        Ok(self.0.clone())
    }
}

/// Builds a fresh `reqwest` client for every run.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    source: SourceOptions,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(source: SourceOptions, timeout: Duration) -> Self {
        Self { source, timeout }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, params: &TaskParams) -> Result<Arc<dyn Transport>, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.source.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| FetchError::Session(format!("header '{}': {}", name, err)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| FetchError::Session(format!("header '{}': {}", name, err)))?;
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .user_agent(self.source.user_agent.as_str())
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .map_err(|err| FetchError::Session(err.to_string()))?;
        tracing::debug!(
            platform = %params.platform,
            target_id = params.target_id,
            "opened http session"
        );
        Ok(Arc::new(HttpTransport {
            client,
            timeout: self.timeout,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).form(&request.form),
        };
        let response = builder
            .query(&request.query)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Status(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Rejected(status.as_u16()));
        }
        let body = response.text().await.map_err(|err| self.classify(err))?;
        Ok(RawPage {
            page: request.page,
            status: status.as_u16(),
            body,
        })
    }
}

impl HttpTransport {
    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Per-task request executor. Owned by exactly one spider, so pages of one
/// task are always fetched one after the other.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    options: FetchOptions,
    last_request: Option<Instant>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, options: FetchOptions) -> Self {
        Self {
            transport,
            options,
            last_request: None,
        }
    }

    /// Fetches one page, spending at most `retry_times` attempts on it. Every
    /// attempt is counted in the task's metrics. A stopped task gets no
    /// further attempts.
    pub async fn fetch(
        &mut self,
        request: &PageRequest,
        task: &TaskEntry,
    ) -> Result<RawPage, FetchError> {
        let mut attempt = 0;
        loop {
            if task.stop_requested() {
                tracing::debug!(task_id = task.id(), page = request.page, "fetch cancelled");
                return Err(FetchError::Cancelled);
            }
            attempt += 1;
            self.throttle().await;

            let result =
                match tokio::time::timeout(self.options.timeout, self.transport.send(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(self.options.timeout)),
                };
            task.record_request(result.is_ok()).await;

            let err = match result {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };
            if !err.is_retryable() {
                tracing::warn!(
                    task_id = task.id(),
                    page = request.page,
                    "request failed permanently: {}",
                    err
                );
                return Err(err);
            }
            if attempt >= self.options.retry_times {
                tracing::warn!(
                    task_id = task.id(),
                    page = request.page,
                    attempts = attempt,
                    "request failed: {}",
                    err
                );
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.options.backoff(attempt);
            tracing::debug!(
                task_id = task.id(),
                page = request.page,
                attempt,
                ?backoff,
                "retrying after error: {}",
                err
            );
            sleep(backoff).await;
        }
    }

    async fn throttle(&mut self) {
        if let Some(last) = self.last_request {
            let next = last + self.options.request_delay;
            if next > Instant::now() {
                sleep_until(next).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}
