//! The page loop of one task.
//!
//! Pause and stop are cooperative: the spider reads its control flag at the
//! top of every page iteration and nowhere else. A request that is already in
//! flight always completes first. On pause its items are kept and the loop
//! waits before the next page; on stop the task is already terminal and the
//! late page is discarded.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    config::FetchOptions,
    error::{FatalTaskError, FetchError},
    fetcher::{Connector, Fetcher},
    item::NormalizedItem,
    manager::{
        registry::TaskEntry,
        state::{Outcome, RunSummary, StopReason, TaskStatus},
    },
    source::{SourceParser, Window},
};

/// Control flag set by the manager and polled by the spider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub items: Vec<NormalizedItem>,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Spider {
    task: Arc<TaskEntry>,
    connector: Arc<dyn Connector>,
    parser: Arc<dyn SourceParser>,
    fetch: FetchOptions,
    max_consecutive_failures: u32,
}

/// Loop bookkeeping between pages.
#[derive(Debug, Default)]
struct Progress {
    consecutive_failures: u32,
    reached_source: bool,
}

impl Spider {
    pub fn new(
        task: Arc<TaskEntry>,
        connector: Arc<dyn Connector>,
        parser: Arc<dyn SourceParser>,
        fetch: FetchOptions,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            task,
            connector,
            parser,
            fetch,
            max_consecutive_failures,
        }
    }

    /// Harvests pages until the task ends and applies the verdict to the
    /// task record. The task must already be running.
    pub async fn run(self) -> RunResult {
        tracing::info!(
            task_id = self.task.id(),
            platform = %self.parser.platform(),
            "running spider"
        );
        let outcome = self.harvest().await;
        let status = self.task.finish(outcome).await;

        let state = self.task.lock().await;
        tracing::info!(
            task_id = self.task.id(),
            %status,
            items = state.buffer.len(),
            "spider finished"
        );
        RunResult {
            task_id: self.task.id().to_string(),
            status,
            items: state.buffer.clone(),
            summary: state.summary.clone().unwrap_or_default(),
            error: state.error.clone(),
        }
    }

    async fn harvest(&self) -> Outcome {
        let params = self.task.params();
        // dropped on every return path below, which closes the session
        let transport = match self.connector.connect(params) {
            Ok(transport) => transport,
            Err(err) => {
                return Outcome::Failed(FatalTaskError::Fetch { page: 1, source: err }.to_string())
            }
        };
        let mut fetcher = Fetcher::new(transport, self.fetch.clone());
        let mut control = self.task.subscribe();
        let window = Window::lookback(params.lookback_days);
        let mut progress = Progress::default();
        let mut verdict = None;
        let mut page = 1;

        loop {
            if checkpoint(&mut control).await == Control::Stop {
                tracing::info!(task_id = self.task.id(), page, "stop requested");
                return Outcome::Stopped;
            }
            if let Some(outcome) = verdict.take() {
                return outcome;
            }
            if page > params.max_pages {
                return Outcome::Completed(StopReason::PageCap);
            }
            verdict = self
                .harvest_page(&mut fetcher, page, &window, &mut progress)
                .await;
            page += 1;
        }
    }

    /// Fetches and parses one page. Returns the run's outcome once it is
    /// decided; the loop applies it only after the next control check.
    async fn harvest_page(
        &self,
        fetcher: &mut Fetcher,
        page: u32,
        window: &Window,
        progress: &mut Progress,
    ) -> Option<Outcome> {
        let request = self.parser.request(page, window);
        tracing::debug!(task_id = self.task.id(), page, "fetching page");

        let raw = match fetcher.fetch(&request, &self.task).await {
            Ok(raw) => raw,
            Err(FetchError::Cancelled) => return Some(Outcome::Stopped),
            Err(err) if err.is_fatal() || !progress.reached_source => {
                let err = FatalTaskError::Fetch { page, source: err };
                return Some(Outcome::Failed(err.to_string()));
            }
            Err(err) => return self.page_failed(page, err.to_string(), progress).await,
        };
        progress.reached_source = true;

        let parsed = match self.parser.parse(&raw) {
            Ok(parsed) => parsed,
            Err(err) if err.is_fatal() => {
                let err = FatalTaskError::Parse { page, source: err };
                return Some(Outcome::Failed(err.to_string()));
            }
            Err(err) => return self.page_failed(page, err.to_string(), progress).await,
        };
        progress.consecutive_failures = 0;

        let oldest = parsed.items.iter().filter_map(|item| item.published_at).min();
        let has_more = parsed.has_more;
        let kept: Vec<_> = parsed
            .items
            .into_iter()
            .filter(|item| window.admits(item.published_at))
            .collect();
        tracing::debug!(
            task_id = self.task.id(),
            page,
            seen = parsed.seen,
            kept = kept.len(),
            "page harvested"
        );
        if !self.task.append_page(kept, parsed.seen).await {
            return Some(Outcome::Stopped);
        }

        if !window.admits(oldest) {
            tracing::info!(task_id = self.task.id(), page, "lookback window reached");
            return Some(Outcome::Completed(StopReason::LookbackReached));
        }
        if !has_more {
            return Some(Outcome::Completed(StopReason::SourceExhausted));
        }
        None
    }

    async fn page_failed(
        &self,
        page: u32,
        message: String,
        progress: &mut Progress,
    ) -> Option<Outcome> {
        progress.consecutive_failures += 1;
        self.task.skip_page().await;
        if progress.consecutive_failures >= self.max_consecutive_failures {
            let err = FatalTaskError::ConsecutiveFailures {
                count: progress.consecutive_failures,
                last: message,
            };
            return Some(Outcome::Failed(err.to_string()));
        }
        tracing::warn!(
            task_id = self.task.id(),
            page,
            "skipping page: {}",
            message
        );
        None
    }
}

/// Waits while the task is paused and returns the flag that let it through.
async fn checkpoint(control: &mut watch::Receiver<Control>) -> Control {
    loop {
        let current = *control.borrow_and_update();
        if current != Control::Pause {
            return current;
        }
        if control.changed().await.is_err() {
            return Control::Stop;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_waits_out_a_pause() {
        let (tx, mut rx) = watch::channel(Control::Pause);
        let waiter = tokio::spawn(async move { checkpoint(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send_replace(Control::Run);
        assert_eq!(waiter.await.unwrap(), Control::Run);
    }

    #[tokio::test]
    async fn stop_supersedes_pause() {
        let (tx, mut rx) = watch::channel(Control::Pause);
        let waiter = tokio::spawn(async move { checkpoint(&mut rx).await });
        tx.send_replace(Control::Stop);
        assert_eq!(waiter.await.unwrap(), Control::Stop);
    }
}
