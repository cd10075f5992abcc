#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reviewcrawler::{
    fetcher::{PageRequest, RawPage, SharedConnector, Transport},
    EngineConfig, FetchError, TaskManager, TaskSnapshot,
};
use tokio::sync::{mpsc, Semaphore};

/// Engine settings with every delay shrunk to keep tests fast.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fetch.request_delay = Duration::ZERO;
    config.fetch.retry_delay = Duration::from_millis(1);
    config.fetch.max_retry_delay = Duration::from_millis(5);
    config
}

pub fn manager_with(config: EngineConfig, transport: Arc<dyn Transport>) -> TaskManager {
    TaskManager::with_connector(config, Arc::new(SharedConnector(transport))).unwrap()
}

/// An iOS answer with two undated reviews per page.
pub fn ios_page(page: u32, max_page: u32) -> RawPage {
    let body = serde_json::json!({
        "code": 10000,
        "maxPage": max_page,
        "appComments": [
            {"id": page * 10, "rating": 5, "comment": {"title": "Nice", "body": format!("page {} first", page)}},
            {"id": page * 10 + 1, "rating": 2, "comment": {"body": format!("page {} second", page)}},
        ],
    });
    RawPage {
        page,
        status: 200,
        body: body.to_string(),
    }
}

/// Serves `pages` pages without delay.
pub struct Pages(pub u32);

#[async_trait]
impl Transport for Pages {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        Ok(ios_page(request.page, self.0))
    }
}

/// Serves `pages` pages, answering the `broken` ones with an HTML error page.
pub struct Broken {
    pages: u32,
    broken: Vec<u32>,
}

impl Broken {
    pub fn new(pages: u32, broken: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pages,
            broken: broken.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Transport for Broken {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        if self.broken.contains(&request.page) {
            return Ok(RawPage {
                page: request.page,
                status: 200,
                body: "<html>maintenance</html>".into(),
            });
        }
        Ok(ios_page(request.page, self.pages))
    }
}

/// Never reaches the source.
pub struct Down;

#[async_trait]
impl Transport for Down {
    async fn send(&self, _request: &PageRequest) -> Result<RawPage, FetchError> {
        Err(FetchError::Transport("connection refused".into()))
    }
}

/// Fails every other attempt with a 503.
pub struct Alternating {
    pages: u32,
    calls: AtomicU32,
}

impl Alternating {
    pub fn new(pages: u32) -> Self {
        Self {
            pages,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Transport for Alternating {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(FetchError::Status(503));
        }
        Ok(ios_page(request.page, self.pages))
    }
}

/// Announces every request and holds it until the test releases a permit.
pub struct Gated {
    pages: u32,
    calls: mpsc::UnboundedSender<u32>,
    permits: Arc<Semaphore>,
}

impl Gated {
    pub fn new(pages: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<u32>, Arc<Semaphore>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        let gate = Arc::new(Self {
            pages,
            calls,
            permits: permits.clone(),
        });
        (gate, rx, permits)
    }
}

#[async_trait]
impl Transport for Gated {
    async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
        let _ = self.calls.send(request.page);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("gate closed".into()))?;
        permit.forget();
        Ok(ios_page(request.page, self.pages))
    }
}

/// Polls the task until `done` holds, for at most five seconds.
pub async fn wait_until<F>(manager: &TaskManager, task_id: &str, done: F) -> TaskSnapshot
where
    F: Fn(&TaskSnapshot) -> bool,
{
    let poll = async {
        loop {
            let snapshot = manager.status(task_id).await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("task did not reach the expected state in time")
}
