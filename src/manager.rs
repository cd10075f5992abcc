use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::EngineConfig,
    error::TaskError,
    fetcher::{Connector, HttpConnector},
    params::{CreateTask, Platform},
    source::Source,
    spider::{RunResult, Spider},
};

pub mod registry;
pub mod state;
pub mod statistics;

use registry::{TaskEntry, TaskRegistry};
use state::{TaskSnapshot, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Return as soon as the run is scheduled; poll `status` for progress.
    Background,
    /// Return once the run reached a terminal state.
    Blocking,
}

#[derive(Debug)]
pub enum RunOutcome {
    Scheduled,
    Finished(RunResult),
}

/// Manager-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ManagerStatistics {
    pub total_tasks: usize,
    pub idle_tasks: usize,
    pub running_tasks: usize,
    pub paused_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub stopped_tasks: usize,
    pub total_created: usize,
    pub total_completed: usize,
    pub total_failed: usize,
    pub max_concurrent: usize,
    pub platforms: Vec<Platform>,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn record(&self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            TaskStatus::Error => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// Public control surface over the task registry.
///
/// Cloning is cheap and every clone controls the same set of tasks.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    registry: TaskRegistry,
    slots: Arc<Semaphore>,
    connector: Arc<dyn Connector>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl TaskManager {
    /// Manager that talks HTTP to the configured review aggregator.
    pub fn new(config: EngineConfig) -> Result<Self, TaskError> {
        let connector = Arc::new(HttpConnector::new(
            config.source.clone(),
            config.fetch.timeout,
        ));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TaskError> {
        config.validate()?;
        tracing::info!(
            max_concurrent = config.max_concurrent,
            base_url = config.source.base_url,
            "task manager ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                registry: TaskRegistry::new(),
                connector,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                counters: Arc::new(Counters::default()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validates the request and registers an idle task.
    pub async fn create(&self, request: CreateTask) -> Result<String, TaskError> {
        let params = request.validate()?;
        let entry = self.inner.registry.register(params).await;
        self.inner.counters.created.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            task_id = entry.id(),
            platform = %entry.params().platform,
            target_id = entry.params().target_id,
            "task created"
        );
        Ok(entry.id().to_string())
    }

    /// Starts an idle task. Fails with `ConcurrencyLimit` when every slot is
    /// taken; the caller decides whether to retry or queue.
    pub async fn run(&self, task_id: &str, mode: RunMode) -> Result<RunOutcome, TaskError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TaskError::Aborted {
                task_id: task_id.to_string(),
                reason: "manager is shutting down".into(),
            });
        }
        let entry = self.inner.registry.get(task_id).await?;
        let status = entry.status().await;
        if status != TaskStatus::Idle {
            return Err(TaskError::IllegalTransition {
                task_id: task_id.to_string(),
                action: "run",
                status,
            });
        }
        let slot = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| TaskError::ConcurrencyLimit {
                limit: self.inner.config.max_concurrent,
            })?;
        // a concurrent run of the same task loses here and drops its slot
        entry.start(slot).await?;

        let spider = self.spider(entry);
        let counters = self.inner.counters.clone();
        let handle = self.inner.tracker.spawn(async move {
            let result = spider.run().await;
            counters.record(result.status);
            result
        });

        match mode {
            RunMode::Background => Ok(RunOutcome::Scheduled),
            RunMode::Blocking => {
                handle
                    .await
                    .map(RunOutcome::Finished)
                    .map_err(|err| TaskError::Aborted {
                        task_id: task_id.to_string(),
                        reason: err.to_string(),
                    })
            }
        }
    }

    /// Runs several tasks to completion side by side.
    pub async fn run_many(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<Result<RunResult, TaskError>>, TaskError> {
        let limit = self.inner.config.max_concurrent;
        if task_ids.len() > limit {
            return Err(TaskError::ConcurrencyLimit { limit });
        }
        tracing::info!(tasks = task_ids.len(), "running tasks in parallel");
        let runs = task_ids.iter().map(|id| async move {
            match self.run(id, RunMode::Blocking).await? {
                RunOutcome::Finished(result) => Ok(result),
                RunOutcome::Scheduled => Err(TaskError::Aborted {
                    task_id: id.clone(),
                    reason: "run did not block".into(),
                }),
            }
        });
        Ok(futures::future::join_all(runs).await)
    }

    pub async fn pause(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.registry.get(task_id).await?.pause().await
    }

    pub async fn resume(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.registry.get(task_id).await?.resume().await
    }

    pub async fn stop(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.registry.get(task_id).await?.stop().await
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        Ok(self.inner.registry.get(task_id).await?.snapshot().await)
    }

    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.inner.registry.entries().await {
            snapshots.push(entry.snapshot().await);
        }
        snapshots
    }

    /// Tasks currently holding a concurrency slot, paused ones included.
    pub async fn list_running(&self) -> Vec<TaskSnapshot> {
        self.list()
            .await
            .into_iter()
            .filter(|snapshot| snapshot.status.is_active())
            .collect()
    }

    /// Removes terminal tasks that completed longer than `retention` ago
    /// (the configured window when `None`). Returns how many were removed.
    pub async fn cleanup(&self, retention: Option<Duration>) -> usize {
        let retention = retention.unwrap_or(self.inner.config.retention);
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return 0;
        };
        let removed = self.inner.registry.evict_terminal_before(cutoff).await;
        tracing::info!(removed, ?retention, "cleaned up expired tasks");
        removed
    }

    pub async fn statistics(&self) -> ManagerStatistics {
        let snapshots = self.list().await;
        let count = |status: TaskStatus| snapshots.iter().filter(|s| s.status == status).count();
        let counters = &self.inner.counters;
        ManagerStatistics {
            total_tasks: snapshots.len(),
            idle_tasks: count(TaskStatus::Idle),
            running_tasks: count(TaskStatus::Running),
            paused_tasks: count(TaskStatus::Paused),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Error),
            stopped_tasks: count(TaskStatus::Stopped),
            total_created: counters.created.load(Ordering::SeqCst),
            total_completed: counters.completed.load(Ordering::SeqCst),
            total_failed: counters.failed.load(Ordering::SeqCst),
            max_concurrent: self.inner.config.max_concurrent,
            platforms: Platform::ALL.to_vec(),
        }
    }

    /// Stops every active task and waits for all runs to wind down. Runs
    /// requested afterwards are rejected.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.registry.entries().await {
            if entry.status().await.is_active() {
                if let Err(err) = entry.stop().await {
                    tracing::debug!(task_id = entry.id(), "not stopped on shutdown: {}", err);
                }
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("task manager: all runs finished");
    }

    pub(crate) async fn entry(&self, task_id: &str) -> Result<Arc<TaskEntry>, TaskError> {
        self.inner.registry.get(task_id).await
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    fn spider(&self, entry: Arc<TaskEntry>) -> Spider {
        let config = &self.inner.config;
        let source = Source::for_task(entry.params(), &config.source);
        Spider::new(
            entry,
            self.inner.connector.clone(),
            Arc::new(source),
            config.fetch.clone(),
            config.max_consecutive_failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::FetchError,
        fetcher::{PageRequest, RawPage, SharedConnector, Transport},
        manager::state::StopReason,
    };

    /// Serves `pages` pages of two reviews each in aggregator format.
    struct Pages(u32);

    #[async_trait]
    impl Transport for Pages {
        async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
            let body = serde_json::json!({
                "code": 10000,
                "maxPage": self.0,
                "appComments": [
                    {"id": request.page * 10, "rating": 5, "comment": {"body": "good"}},
                    {"id": request.page * 10 + 1, "rating": 1, "comment": {"body": "bad"}},
                ],
            });
            Ok(RawPage {
                page: request.page,
                status: 200,
                body: body.to_string(),
            })
        }
    }

    fn manager(pages: u32) -> TaskManager {
        let mut config = EngineConfig::default();
        config.fetch.request_delay = Duration::ZERO;
        TaskManager::with_connector(config, Arc::new(SharedConnector(Arc::new(Pages(pages)))))
            .unwrap()
    }

    #[tokio::test]
    async fn blocking_run_collects_every_page() {
        let manager = manager(3);
        let id = manager
            .create(CreateTask::ios("123456", "cn").max_pages(10))
            .await
            .unwrap();

        let RunOutcome::Finished(result) = manager.run(&id, RunMode::Blocking).await.unwrap()
        else {
            panic!("blocking run returned early");
        };
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.items.len(), 6);
        assert_eq!(result.summary.stop_reason, Some(StopReason::SourceExhausted));
        assert_eq!(result.summary.rating_breakdown.get(&5), Some(&3));

        let snapshot = manager.status(&id).await.unwrap();
        assert_eq!(snapshot.metrics.total_requests, 3);
        assert_eq!(snapshot.data_count(), 6);
    }

    #[tokio::test]
    async fn page_cap_bounds_requests() {
        let manager = manager(50);
        let id = manager
            .create(CreateTask::ios("123456", "cn").max_pages(4))
            .await
            .unwrap();
        manager.run(&id, RunMode::Blocking).await.unwrap();

        let snapshot = manager.status(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.metrics.total_requests <= 4);
        assert_eq!(
            snapshot.result_summary.unwrap().stop_reason,
            Some(StopReason::PageCap)
        );
    }

    #[tokio::test]
    async fn rerunning_a_finished_task_is_rejected() {
        let manager = manager(1);
        let id = manager
            .create(CreateTask::ios("123456", "cn"))
            .await
            .unwrap();
        manager.run(&id, RunMode::Blocking).await.unwrap();

        let err = manager.run(&id, RunMode::Blocking).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::IllegalTransition {
                status: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cleanup_respects_retention() {
        let manager = manager(1);
        let old = manager.create(CreateTask::ios("1", "cn")).await.unwrap();
        let fresh = manager.create(CreateTask::ios("2", "cn")).await.unwrap();
        let idle = manager.create(CreateTask::ios("3", "cn")).await.unwrap();
        manager.run(&old, RunMode::Blocking).await.unwrap();
        manager.run(&fresh, RunMode::Blocking).await.unwrap();
        manager
            .registry()
            .backdate_completion(&old, Utc::now() - chrono::Duration::days(8))
            .await;

        assert_eq!(manager.cleanup(None).await, 1);
        assert!(matches!(
            manager.status(&old).await,
            Err(TaskError::NotFound(_))
        ));
        assert!(manager.status(&fresh).await.is_ok());
        assert!(manager.status(&idle).await.is_ok());

        assert_eq!(manager.cleanup(Some(Duration::ZERO)).await, 1);
        assert!(manager.status(&idle).await.is_ok());
    }

    #[tokio::test]
    async fn statistics_count_outcomes() {
        let manager = manager(1);
        let done = manager.create(CreateTask::ios("1", "cn")).await.unwrap();
        manager.create(CreateTask::ios("2", "cn")).await.unwrap();
        manager.run(&done, RunMode::Blocking).await.unwrap();

        let stats = manager.statistics().await;
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.idle_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.platforms, vec![Platform::Ios, Platform::Android]);
    }

    #[tokio::test]
    async fn run_many_rejects_more_tasks_than_slots() {
        let mut config = EngineConfig::default();
        config.max_concurrent = 2;
        config.fetch.request_delay = Duration::ZERO;
        let manager =
            TaskManager::with_connector(config, Arc::new(SharedConnector(Arc::new(Pages(1)))))
                .unwrap();
        let mut ids = Vec::new();
        for target in ["1", "2", "3"] {
            ids.push(manager.create(CreateTask::ios(target, "cn")).await.unwrap());
        }

        let err = manager.run_many(&ids).await.unwrap_err();
        assert!(matches!(err, TaskError::ConcurrencyLimit { limit: 2 }));

        let results = manager.run_many(&ids[..2]).await.unwrap();
        assert_eq!(results.len(), 2);
        for result in results {
            assert_eq!(result.unwrap().status, TaskStatus::Completed);
        }
    }
}
