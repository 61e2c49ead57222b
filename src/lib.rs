// === Public Modules (The Canonical Paths) ===
pub mod breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod idempotency;
pub mod lake;
pub mod metrics;
pub mod parse;
pub mod pipeline;
pub mod retry;
pub mod sched;
pub mod schema;
pub mod validate;
pub mod warehouse;

// === Facades (Re-exporting the working surface) ===
pub use crate::error::{MandiError, MandiResult};
pub use crate::fetch::{FetchOutcome, FetchParams, Fetcher, HttpFetcher, Source};
pub use crate::pipeline::{PipelineKernel, PipelineKind, PipelineRun, RunContext, RunStatus};
