//! Error types for task control, fetching and parsing.
//!
//! Request-level failures (`FetchError`, `ParseError`) are absorbed by the
//! spider where possible. Only `TaskError` reaches callers of the manager, and
//! `FatalTaskError` is what ends up recorded on a task that aborted.

use std::time::Duration;

use crate::manager::state::TaskStatus;

/// A create request was rejected before any task was registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}': {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new<S: Into<String>>(field: &'static str, reason: S) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by the task manager and the result sink.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid task parameters: {0}")]
    Validation(#[from] ValidationError),

    /// The global ceiling of simultaneously running tasks is reached.
    /// Callers are expected to retry later.
    #[error("concurrency limit reached: {limit} task(s) already running")]
    ConcurrencyLimit { limit: usize },

    #[error("cannot {action} task '{task_id}' while it is {status}")]
    IllegalTransition {
        task_id: String,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("feedback store failed: {0}")]
    Store(#[from] StoreError),

    #[error("task run for '{task_id}' did not finish: {reason}")]
    Aborted { task_id: String, reason: String },
}

/// Failure of a single page fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// Retryable HTTP status (5xx, 429).
    #[error("server answered with status {0}")]
    Status(u16),

    /// Non-retryable HTTP status (other 4xx).
    #[error("request rejected with status {0}")]
    Rejected(u16),

    #[error("could not open a request session: {0}")]
    Session(String),

    #[error("giving up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    /// The task was stopped before the request could be (re)tried.
    #[error("request cancelled, task stopped")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt at the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Transport(_) | FetchError::Status(_)
        )
    }

    /// Whether the failure should abort the whole task rather than one page.
    pub fn is_fatal(&self) -> bool {
        match self {
            FetchError::Rejected(_) | FetchError::Session(_) => true,
            FetchError::Exhausted { last, .. } => last.is_fatal(),
            _ => false,
        }
    }
}

/// Failure to turn a raw page into items.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("malformed page: {0}")]
    Malformed(String),

    #[error("source answered with code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("source credentials expired, re-authentication required")]
    AuthExpired,
}

impl ParseError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::AuthExpired)
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

/// Anything that aborts a run. Its message is recorded on the task.
#[derive(Debug, thiserror::Error)]
pub enum FatalTaskError {
    #[error("page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },

    #[error("page {page}: {source}")]
    Parse {
        page: u32,
        #[source]
        source: ParseError,
    },

    #[error("{count} consecutive pages failed, last: {last}")]
    ConsecutiveFailures { count: u32, last: String },
}

/// Failure of the downstream feedback store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
