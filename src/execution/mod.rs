//! Workflow Execution Module
//!
//! Runs workflow graphs: dependency-driven scheduling of every scope,
//! call execution through a pluggable task backend, and the run-level
//! concerns around it (input downloads, call caching, retries, resource
//! reservations, cancellation).
//!
//! # Architecture
//!
//! - [`engine`]: Run driver, from inputs to outputs or an aggregated failure
//! - [`scheduler`]: Per-scope dispatch loop and section recursion
//! - [`nodes`]: Declarations, assertions, gathers and output evaluation
//! - [`call`]: Call execution, retries and time limits
//! - [`backend`]: The [`TaskBackend`] boundary
//! - [`local`]: Local process (and container CLI) backend
//! - [`cache`]: Call cache keyed by callee and inputs
//! - [`download`]: URI input materialization
//! - [`resources`]: CPU/memory reservations

pub mod backend;
pub mod cache;
pub mod call;
pub mod download;
pub mod engine;
pub mod local;
pub mod nodes;
pub mod resources;
pub mod scheduler;

pub use backend::{BackendError, Runtime, TaskBackend, TaskRequest};
pub use cache::CallCache;
pub use download::{Downloader, FetchError, FileFetcher, LocalFetcher};
pub use engine::{Engine, RunOutcome};
pub use local::LocalBackend;
pub use nodes::SectionOutcome;
pub use resources::{Reservation, ResourceManager};
pub use scheduler::{run_scope, Frame, RunContext};
