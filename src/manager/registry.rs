use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard, OwnedSemaphorePermit, RwLock};

use super::state::{Outcome, TaskSnapshot, TaskState, TaskStatus};
use crate::{error::TaskError, item::NormalizedItem, params::TaskParams, spider::Control};

/// One registered task: immutable identity and parameters, the lock-guarded
/// mutable state, and the control flag its spider polls.
#[derive(Debug)]
pub struct TaskEntry {
    id: String,
    params: TaskParams,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    control: watch::Sender<Control>,
}

impl TaskEntry {
    fn new(id: String, params: TaskParams) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Self {
            id,
            params,
            created_at: Utc::now(),
            state: Mutex::new(TaskState::default()),
            control,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().await;
        TaskSnapshot::new(&self.id, &self.params, self.created_at, &state)
    }

    pub async fn status(&self) -> TaskStatus {
        self.state.lock().await.status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.control.borrow() == Control::Stop
    }

    pub(crate) async fn start(&self, slot: OwnedSemaphorePermit) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state
            .start(slot)
            .map_err(|status| self.illegal("run", status))?;
        self.control.send_replace(Control::Run);
        tracing::info!(task_id = self.id, "task started");
        Ok(())
    }

    pub(crate) async fn pause(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state
            .pause()
            .map_err(|status| self.illegal("pause", status))?;
        self.control.send_replace(Control::Pause);
        tracing::info!(task_id = self.id, "task paused");
        Ok(())
    }

    pub(crate) async fn resume(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state
            .resume()
            .map_err(|status| self.illegal("resume", status))?;
        self.control.send_replace(Control::Run);
        tracing::info!(task_id = self.id, "task resumed");
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        state.stop().map_err(|status| self.illegal("stop", status))?;
        self.control.send_replace(Control::Stop);
        tracing::info!(task_id = self.id, "task stopped");
        Ok(())
    }

    pub(crate) async fn finish(&self, outcome: Outcome) -> TaskStatus {
        let mut state = self.state.lock().await;
        let status = state.finish(outcome);
        state.metrics.write_to_log(&self.id);
        status
    }

    pub(crate) async fn record_request(&self, ok: bool) {
        self.state.lock().await.record_request(ok);
    }

    pub(crate) async fn append_page(&self, items: Vec<NormalizedItem>, seen: u64) -> bool {
        self.state.lock().await.append_page(items, seen)
    }

    pub(crate) async fn skip_page(&self) {
        self.state.lock().await.skip_page();
    }

    /// Copy of the buffered items.
    pub async fn items(&self) -> Vec<NormalizedItem> {
        self.state.lock().await.buffer.clone()
    }

    fn illegal(&self, action: &'static str, status: TaskStatus) -> TaskError {
        TaskError::IllegalTransition {
            task_id: self.id.clone(),
            action,
            status,
        }
    }
}

/// Map of task ids to their records. Control operations look tasks up here
/// and act on the entry, never on the spider.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, params: TaskParams) -> Arc<TaskEntry> {
        let mut tasks = self.tasks.write().await;
        let id = loop {
            let candidate = format!(
                "{}_{}_{}",
                params.platform,
                params.target_id,
                uuid::Uuid::new_v4().simple()
            );
            if !tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        let entry = Arc::new(TaskEntry::new(id.clone(), params));
        tasks.insert(id, entry.clone());
        entry
    }

    pub async fn get(&self, task_id: &str) -> Result<Arc<TaskEntry>, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Vec<Arc<TaskEntry>> {
        let mut entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Removes terminal tasks that completed before `cutoff`. Active and idle
    /// tasks are never touched.
    pub async fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut expired = Vec::new();
        for (id, entry) in tasks.iter() {
            let state = entry.state.lock().await;
            let old_enough = state.completed_at.map_or(false, |at| at < cutoff);
            if state.status.is_terminal() && old_enough {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            tasks.remove(id);
            tracing::debug!(task_id = id, "evicted task");
        }
        expired.len()
    }

    #[cfg(test)]
    pub(crate) async fn backdate_completion(&self, task_id: &str, completed_at: DateTime<Utc>) {
        if let Some(entry) = self.tasks.read().await.get(task_id) {
            entry.state.lock().await.completed_at = Some(completed_at);
        }
    }
}
