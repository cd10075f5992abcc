use std::{sync::Arc, time::Duration};

use reviewcrawler::{
    fetcher::SharedConnector, sink::DEFAULT_PREVIEW_LIMIT, CreateTask, EngineConfig,
    InMemoryFeedbackStore, ResultSink, RunMode, RunOutcome, TaskManager,
};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("starting review-demo");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("debug"))
                .expect("telemetry: Creating EnvFilter"),
        )
        .init();

    let config = EngineConfig::from_json_str(
        r#"{"max_concurrent": 2, "fetch": {"request_delay": 0.2, "retry_delay": 0.5}}"#,
    )?;
    let source = Arc::new(fake_source::FakeReviews::new(4));
    let manager = TaskManager::with_connector(config, Arc::new(SharedConnector(source)))?;

    // a blocking run on iOS
    let ios = manager
        .create(CreateTask::ios("123456", "cn").lookback_days(30).max_pages(5))
        .await?;
    if let RunOutcome::Finished(result) = manager.run(&ios, RunMode::Blocking).await? {
        println!(
            "{}: {} with {} items ({:?})",
            result.task_id,
            result.status,
            result.items.len(),
            result.summary.stop_reason
        );
    }

    // a background run on Huawei, paused and resumed along the way
    let android = manager
        .create(CreateTask::android("6007162", "6").label("huawei demo"))
        .await?;
    manager.run(&android, RunMode::Background).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.pause(&android).await?;
    let paused = manager.status(&android).await?;
    println!("paused after {} items", paused.data_count());
    tokio::time::sleep(Duration::from_millis(500)).await;
    manager.resume(&android).await?;

    while manager.status(&android).await?.status.is_active() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let store = Arc::new(InMemoryFeedbackStore::new());
    let sink = ResultSink::new(manager.clone(), store.clone());
    let preview = sink.preview(&android, DEFAULT_PREVIEW_LIMIT).await?;
    for item in &preview.preview_data {
        println!(
            "[{}] {:?} {:?}: {}",
            item.platform, item.rating, item.sentiment, item.content
        );
    }
    for task_id in [&ios, &android] {
        let receipt = sink.import(task_id, false).await?;
        println!("imported {} items from {}", receipt.imported_count, task_id);
    }

    let stats = manager.statistics().await;
    println!(
        "tasks: {} total, {} completed, {} failed",
        stats.total_tasks, stats.completed_tasks, stats.failed_tasks
    );
    manager.shutdown().await;
    Ok(())
}

pub mod fake_source {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use reviewcrawler::{
        fetcher::{PageRequest, RawPage, Transport},
        FetchError,
    };
    use serde_json::json;

    /// Answers like the review aggregator, with three reviews per page and
    /// `pages` pages in total.
    #[derive(Debug)]
    pub struct FakeReviews {
        pages: u32,
    }

    impl FakeReviews {
        pub fn new(pages: u32) -> Self {
            Self { pages }
        }
    }

    #[async_trait]
    impl Transport for FakeReviews {
        async fn send(&self, request: &PageRequest) -> Result<RawPage, FetchError> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let page = request.page;
            let date = |offset: u32| {
                (Utc::now() - Duration::days(i64::from(page * 3 + offset)))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            };
            let body = if request.url.ends_with("/app/comment") {
                json!({
                    "code": 10000,
                    "maxPage": self.pages,
                    "appComments": (0..3).map(|n| json!({
                        "id": page * 100 + n,
                        "rating": n + 3,
                        "date": date(n),
                        "comment": {"name": format!("user{}", n), "title": "Review", "body": format!("Page {} review {}", page, n)},
                    })).collect::<Vec<_>>(),
                })
            } else {
                json!({
                    "code": 10000,
                    "max_page": self.pages,
                    "result": (0..3).map(|n| json!({
                        "account_id": format!("acc-{}-{}", page, n),
                        "stars": n + 1,
                        "comment_info": format!("Market review {} on page {}", n, page),
                        "nick_name": format!("fan{}", n),
                        "comment_time": date(n),
                    })).collect::<Vec<_>>(),
                })
            };
            Ok(RawPage {
                page,
                status: 200,
                body: body.to_string(),
            })
        }
    }
}
