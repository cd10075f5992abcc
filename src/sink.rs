//! Hand-off of collected items: previews for a caller to inspect and imports
//! into a feedback store.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::{
    error::{StoreError, TaskError, ValidationError},
    item::NormalizedItem,
    manager::{state::TaskStatus, TaskManager},
    params::TaskParams,
};

pub const DEFAULT_PREVIEW_LIMIT: usize = 10;
pub const MAX_PREVIEW_LIMIT: usize = 100;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Preview {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_count: usize,
    pub preview_count: usize,
    pub preview_data: Vec<NormalizedItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ImportReceipt {
    pub imported_count: usize,
}

/// Everything a feedback store receives for one import.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportBatch {
    pub task_id: String,
    pub params: TaskParams,
    pub imported_at: DateTime<Utc>,
    pub items: Vec<NormalizedItem>,
}

/// Persistent home of imported items.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Persists the batch and returns how many items were stored.
    async fn persist(&self, batch: &ImportBatch) -> Result<usize, StoreError>;
}

/// Starts downstream analysis of an imported batch. Failures are logged and
/// never reach the importer.
#[async_trait]
pub trait AnalysisTrigger: Send + Sync {
    async fn trigger(&self, task_id: &str, item_count: usize) -> Result<(), StoreError>;
}

pub struct ResultSink {
    manager: TaskManager,
    store: Arc<dyn FeedbackStore>,
    analysis: Option<Arc<dyn AnalysisTrigger>>,
}

impl ResultSink {
    pub fn new(manager: TaskManager, store: Arc<dyn FeedbackStore>) -> Self {
        Self {
            manager,
            store,
            analysis: None,
        }
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisTrigger>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// First `limit` buffered items, in collection order. Works in any state,
    /// so partial results of a running task can be inspected.
    pub async fn preview(&self, task_id: &str, limit: usize) -> Result<Preview, TaskError> {
        if !(1..=MAX_PREVIEW_LIMIT).contains(&limit) {
            return Err(ValidationError::new(
                "limit",
                format!("must be between 1 and {}, got {}", MAX_PREVIEW_LIMIT, limit),
            )
            .into());
        }
        let entry = self.manager.entry(task_id).await?;
        let state = entry.lock().await;
        let preview_data: Vec<_> = state.buffer.iter().take(limit).cloned().collect();
        Ok(Preview {
            task_id: task_id.to_string(),
            status: state.status,
            total_count: state.buffer.len(),
            preview_count: preview_data.len(),
            preview_data,
        })
    }

    /// Hands a copy of the buffer of a finished task to the feedback store.
    /// Each call imports again; the buffer itself is left untouched.
    pub async fn import(
        &self,
        task_id: &str,
        enable_downstream_analysis: bool,
    ) -> Result<ImportReceipt, TaskError> {
        let entry = self.manager.entry(task_id).await?;
        let items = {
            let state = entry.lock().await;
            if !state.status.is_terminal() {
                return Err(TaskError::IllegalTransition {
                    task_id: task_id.to_string(),
                    action: "import",
                    status: state.status,
                });
            }
            state.buffer.clone()
        };
        if items.is_empty() {
            tracing::info!(task_id, "nothing to import");
            return Ok(ImportReceipt { imported_count: 0 });
        }

        let batch = ImportBatch {
            task_id: task_id.to_string(),
            params: entry.params().clone(),
            imported_at: Utc::now(),
            items,
        };
        let imported_count = self.store.persist(&batch).await?;
        tracing::info!(task_id, imported_count, "imported items");

        if enable_downstream_analysis {
            if let Some(analysis) = &self.analysis {
                let analysis = analysis.clone();
                let task_id = task_id.to_string();
                tokio::spawn(async move {
                    if let Err(err) = analysis.trigger(&task_id, imported_count).await {
                        tracing::warn!(task_id, "downstream analysis not started: {}", err);
                    }
                });
            } else {
                tracing::debug!(task_id, "no analysis trigger configured");
            }
        }
        Ok(ImportReceipt { imported_count })
    }
}

/// Appends every imported item as one JSON line to a file.
#[derive(Debug)]
pub struct JsonlFeedbackStore {
    path: PathBuf,
    // serializes appends from concurrent imports
    lock: Mutex<()>,
}

impl JsonlFeedbackStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_lines(path: &Path, lines: &str) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    file.write_all(lines.as_bytes()).map_err(io_error)
}

#[async_trait]
impl FeedbackStore for JsonlFeedbackStore {
    async fn persist(&self, batch: &ImportBatch) -> Result<usize, StoreError> {
        let mut lines = String::new();
        for item in &batch.items {
            lines.push_str(&serde_json::to_string(item)?);
            lines.push('\n');
        }

        let _guard = self.lock.lock().await;
        tracing::debug!(
            task_id = batch.task_id,
            "feedback store: appending to '{}'",
            self.path.display()
        );
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_lines(&path, &lines))
            .await
            .map_err(|err| StoreError::Other(format!("feedback store writer: {}", err)))??;
        Ok(batch.items.len())
    }
}

/// Keeps imported batches in memory.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackStore {
    batches: Mutex<Vec<ImportBatch>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<ImportBatch> {
        self.batches.lock().await.clone()
    }

    pub async fn items(&self) -> Vec<NormalizedItem> {
        self.batches
            .lock()
            .await
            .iter()
            .flat_map(|batch| batch.items.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn persist(&self, batch: &ImportBatch) -> Result<usize, StoreError> {
        self.batches.lock().await.push(batch.clone());
        Ok(batch.items.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub task_id: String,
    pub item_count: usize,
}

/// Forwards analysis requests to whoever holds the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelAnalysisTrigger {
    tx: mpsc::UnboundedSender<AnalysisRequest>,
}

impl ChannelAnalysisTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AnalysisRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AnalysisTrigger for ChannelAnalysisTrigger {
    async fn trigger(&self, task_id: &str, item_count: usize) -> Result<(), StoreError> {
        self.tx
            .send(AnalysisRequest {
                task_id: task_id.to_string(),
                item_count,
            })
            .map_err(|_| StoreError::Other("analysis receiver is gone".into()))
    }
}
