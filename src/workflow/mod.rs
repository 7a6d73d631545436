//! Workflow Definition Module
//!
//! In-memory node graph of a workflow document and the static analyses
//! the scheduler relies on.
//!
//! # Structure
//!
//! - [`model`]: Task, Workflow and the workflow body nodes
//! - [`dependencies`]: per-scope dependency graphs
//! - [`parser`]: YAML/JSON document loading
//! - [`state`]: per-run node status record

pub mod dependencies;
pub mod model;
pub mod parser;
pub mod state;

pub use dependencies::{DependencyGraph, Scope};
pub use model::{
    Assertion, Call, Callee, Conditional, Decl, Gather, Scatter, Target, Task, Workflow,
    WorkflowNode, WorkflowSection,
};
pub use parser::{load_document, parse_document, Document};
pub use state::{NodeRecord, NodeStatus, RunState};
