use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedSemaphorePermit;

use super::statistics::{Metrics, MetricsCollector};
use crate::{item::NormalizedItem, params::TaskParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Stopped
        )
    }

    /// Running and paused tasks both hold a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SourceExhausted,
    PageCap,
    LookbackReached,
    Stopped,
    Failed,
}

/// How a run ended, as decided by the spider.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(StopReason),
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RunSummary {
    pub data_count: usize,
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    /// Number of buffered items per star rating.
    pub rating_breakdown: BTreeMap<u8, usize>,
    pub stop_reason: Option<StopReason>,
}

/// Mutable part of a task record. Always accessed under the task's lock.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) status: TaskStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) metrics: MetricsCollector,
    pub(crate) buffer: Vec<NormalizedItem>,
    pub(crate) error: Option<String>,
    pub(crate) summary: Option<RunSummary>,
    slot: Option<OwnedSemaphorePermit>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Idle,
            started_at: None,
            completed_at: None,
            metrics: MetricsCollector::default(),
            buffer: Vec::new(),
            error: None,
            summary: None,
            slot: None,
        }
    }
}

impl TaskState {
    pub(crate) fn start(&mut self, slot: OwnedSemaphorePermit) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Idle {
            return Err(self.status);
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.metrics.start();
        self.slot = Some(slot);
        Ok(())
    }

    pub(crate) fn pause(&mut self) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Running {
            return Err(self.status);
        }
        self.status = TaskStatus::Paused;
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Paused {
            return Err(self.status);
        }
        self.status = TaskStatus::Running;
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<(), TaskStatus> {
        if !self.status.is_active() {
            return Err(self.status);
        }
        self.terminate(TaskStatus::Stopped);
        self.summary_mut().stop_reason = Some(StopReason::Stopped);
        Ok(())
    }

    /// Applies the spider's verdict. Only a running task can complete or
    /// fail; a task that was stopped in the meantime keeps its status.
    ///
    /// Called once the spider has left its page loop, so this is where the
    /// concurrency slot is given back.
    pub(crate) fn finish(&mut self, outcome: Outcome) -> TaskStatus {
        self.slot = None;
        if self.status.is_terminal() {
            return self.status;
        }
        match outcome {
            Outcome::Completed(reason) => {
                self.terminate(TaskStatus::Completed);
                self.summary_mut().stop_reason = Some(reason);
            }
            Outcome::Stopped => {
                self.terminate(TaskStatus::Stopped);
                self.summary_mut().stop_reason = Some(StopReason::Stopped);
            }
            Outcome::Failed(message) => {
                self.terminate(TaskStatus::Error);
                self.error = Some(message);
                self.summary_mut().stop_reason = Some(StopReason::Failed);
            }
        }
        self.status
    }

    /// Appends one page worth of items. Refused once the task is terminal so
    /// the buffer stays frozen.
    pub(crate) fn append_page(&mut self, items: Vec<NormalizedItem>, seen: u64) -> bool {
        if !self.status.is_active() {
            return false;
        }
        let summary = self.summary_mut();
        summary.pages_fetched += 1;
        for item in &items {
            if let Some(rating) = item.rating {
                *summary.rating_breakdown.entry(rating).or_insert(0) += 1;
            }
        }
        self.metrics.record_items(seen, items.len() as u64);
        self.buffer.extend(items);
        self.summary_mut().data_count = self.buffer.len();
        true
    }

    pub(crate) fn skip_page(&mut self) {
        if self.status.is_active() {
            self.summary_mut().pages_skipped += 1;
        }
    }

    /// Ignored once the task is terminal so its metrics stay frozen.
    pub(crate) fn record_request(&mut self, ok: bool) {
        if self.status.is_active() {
            self.metrics.record_request(ok);
        }
    }

    fn terminate(&mut self, status: TaskStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.metrics.finish();
        self.summary_mut().data_count = self.buffer.len();
    }

    fn summary_mut(&mut self) -> &mut RunSummary {
        self.summary.get_or_insert_with(RunSummary::default)
    }
}

/// Read-only view of a task handed to collaborators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub params: TaskParams,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion, or until now while active.
    pub duration: f64,
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSnapshot {
    pub(crate) fn new(
        task_id: &str,
        params: &TaskParams,
        created_at: DateTime<Utc>,
        state: &TaskState,
    ) -> Self {
        let duration = match (state.started_at, state.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default().as_secs_f64(),
            (Some(start), None) => (Utc::now() - start)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            _ => 0.0,
        };
        Self {
            task_id: task_id.to_string(),
            status: state.status,
            params: params.clone(),
            created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            duration,
            metrics: state.metrics.snapshot(),
            result_summary: state.summary.clone(),
            error: state.error.clone(),
        }
    }

    pub fn data_count(&self) -> usize {
        self.result_summary
            .as_ref()
            .map(|summary| summary.data_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    use super::*;

    fn slot() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut state = TaskState::default();
        assert_eq!(state.pause(), Err(TaskStatus::Idle));
        assert_eq!(state.stop(), Err(TaskStatus::Idle));

        state.start(slot()).unwrap();
        state.pause().unwrap();
        assert_eq!(state.pause(), Err(TaskStatus::Paused));
        state.resume().unwrap();
        state.stop().unwrap();

        assert_eq!(state.status, TaskStatus::Stopped);
        assert_eq!(state.resume(), Err(TaskStatus::Stopped));
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn finish_after_stop_keeps_stopped() {
        let mut state = TaskState::default();
        state.start(slot()).unwrap();
        state.stop().unwrap();
        let status = state.finish(Outcome::Completed(StopReason::SourceExhausted));
        assert_eq!(status, TaskStatus::Stopped);
        assert!(state.error.is_none());
    }

    #[test]
    fn terminal_state_releases_the_slot() {
        let semaphore = Arc::new(Semaphore::new(1));
        let mut state = TaskState::default();
        state
            .start(semaphore.clone().try_acquire_owned().unwrap())
            .unwrap();
        assert_eq!(semaphore.available_permits(), 0);
        state.finish(Outcome::Failed("boom".into()));
        assert_eq!(semaphore.available_permits(), 1);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[test]
    fn stopped_task_holds_its_slot_until_the_spider_finishes() {
        let semaphore = Arc::new(Semaphore::new(1));
        let mut state = TaskState::default();
        state
            .start(semaphore.clone().try_acquire_owned().unwrap())
            .unwrap();
        state.stop().unwrap();
        assert_eq!(state.status, TaskStatus::Stopped);
        assert_eq!(semaphore.available_permits(), 0);

        assert_eq!(
            state.finish(Outcome::Completed(StopReason::SourceExhausted)),
            TaskStatus::Stopped
        );
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn requests_after_stop_are_not_counted() {
        let mut state = TaskState::default();
        state.start(slot()).unwrap();
        state.record_request(false);
        state.stop().unwrap();
        state.record_request(true);
        state.record_request(false);

        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_requests, 0);
    }

    #[test]
    fn buffer_is_frozen_once_terminal() {
        let mut state = TaskState::default();
        state.start(slot()).unwrap();
        assert!(state.append_page(Vec::new(), 0));
        state.finish(Outcome::Completed(StopReason::PageCap));
        assert!(!state.append_page(Vec::new(), 3));
        assert_eq!(state.metrics.snapshot().total_items, 0);
    }
}
