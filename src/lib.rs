//! crawlqueue: a fair, throttle-aware document queue scheduler for
//! incremental crawlers.
//!
//! Documents of many jobs wait in a shared persistent queue. Each one is
//! tagged with throttling bins (typically its host), and its priority is
//! derived from how deep its bins already are relative to their fetch-rate
//! limits, so hot hosts are drained at their allowed pace while cold ones
//! are not starved. Several processes may share one store; claims carry the
//! owning process id so the work of a dead process can be recovered.

pub mod config;
pub mod connectors;
pub mod error;
pub mod jobs;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use error::{SchedulerError, SchedulerResult};
pub use jobs::QueueManager;
pub use runtime::Crawler;
