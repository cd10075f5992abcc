//! A task engine for crawling app-store reviews.
//!
//! Tasks are created and controlled through [`TaskManager`]; each run drives a
//! [`Spider`] over one review source page by page. Collected items are
//! previewed and imported through a [`ResultSink`].

pub mod config;
pub mod error;
pub mod fetcher;
pub mod item;
pub mod manager;
pub mod params;
pub mod sink;
pub mod source;
pub mod spider;

pub use config::{EngineConfig, FetchOptions, SourceOptions};
pub use error::{FetchError, ParseError, StoreError, TaskError, ValidationError};
pub use item::NormalizedItem;
pub use manager::{
    state::{StopReason, TaskSnapshot, TaskStatus},
    ManagerStatistics, RunMode, RunOutcome, TaskManager,
};
pub use params::{CreateTask, Market, Platform, TaskParams};
pub use sink::{FeedbackStore, InMemoryFeedbackStore, JsonlFeedbackStore, ResultSink};
pub use spider::{RunResult, Spider};
