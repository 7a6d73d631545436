//! WdlRunner - Workflow Graph Execution Engine
//!
//! Executes validated WDL workflow graphs on the local machine: every
//! declaration, assertion and call runs as soon as the values it reads
//! are available, scatters fan out over their collections, and
//! conditionals gate their bodies.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Node graph model, dependency analysis, document loading
//! - [`expr`]: Expression language and standard library
//! - [`value`]: Types, values and their JSON form
//! - [`env`]: Immutable name bindings
//! - [`execution`]: Engine, scheduler and task backends
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use wdlrunner::{load_document, values_from_json, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow document
//!     let document = load_document("pipeline.yaml")?;
//!     let target = document.target(None)?;
//!
//!     // Read its inputs
//!     let json = serde_json::json!({ "pipeline.samples": ["a.fq", "b.fq"] });
//!     let inputs = values_from_json(
//!         &json,
//!         &target.available_inputs(),
//!         Some(&target.required_inputs()),
//!         target.name(),
//!     )?;
//!
//!     // Execute it
//!     let outcome = Engine::new().run(&target, inputs).await?;
//!     println!("run directory: {}", outcome.run_dir.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod execution;
pub mod expr;
pub mod monitoring;
pub mod value;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use env::Bindings;
pub use error::{Error, Result, RunFailed};
pub use execution::{Engine, RunOutcome, TaskBackend};
pub use value::{values_from_json, values_to_json, Type, Value};
pub use workflow::{load_document, parse_document, Document, Target, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "WdlRunner";
