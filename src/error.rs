//! Error Types
//!
//! Error taxonomy for workflow execution:
//!
//! - [`EvalError`]: faults raised while evaluating an expression
//! - [`Error`]: everything the engine raises, from a single failed node up to
//!   the run-level [`RunFailed`] aggregate
//!
//! Syntax and validation errors belong to the document toolchain upstream;
//! the only validation-like errors raised here come from loading a
//! serialized document ([`Error::Validation`]) or from marshaling JSON inputs
//! ([`Error::Input`]).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Location of a node or expression in its source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Filename or URI of the document
    #[serde(default)]
    pub uri: String,
    /// 1-based line number
    pub line: u32,
    /// 1-based column number
    pub column: u32,
}

impl SourcePosition {
    pub fn new(uri: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            uri: uri.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uri = if self.uri.is_empty() {
            "<document>"
        } else {
            self.uri.as_str()
        };
        write!(f, "{}:{}:{}", uri, self.line, self.column)
    }
}

/// Faults raised while evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("array index {index} out of range (length {len})")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("map key not found: {0}")]
    KeyNotFound(String),

    #[error("null value: {0}")]
    NullValue(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{function}: expected {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("{function}: {message}")]
    Function { function: String, message: String },
}

impl EvalError {
    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub(crate) fn function(function: &str, message: impl Into<String>) -> Self {
        Self::Function {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An expression failed to evaluate.
    #[error("{pos}: {source}")]
    Runtime {
        pos: SourcePosition,
        #[source]
        source: EvalError,
    },

    /// An `assert` evaluated to false.
    #[error("{pos}: assertion failed: {expr}")]
    AssertionFailed { pos: SourcePosition, expr: String },

    /// The task backend reported a permanent failure.
    #[error("call {call} failed: {message}")]
    CallFailed {
        call: String,
        exit_status: Option<i32>,
        stderr: String,
        message: String,
    },

    /// An input file could not be materialized.
    #[error("download failed: {uri}: {message}")]
    DownloadFailed { uri: String, message: String },

    /// Input or output JSON did not match the available declarations.
    #[error("input error: {0}")]
    Input(String),

    /// A serialized document could not be turned into a workflow graph.
    #[error("invalid document: {0}")]
    Validation(String),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled by an external signal.
    #[error("run cancelled")]
    Cancelled,

    /// An engine invariant was violated (e.g. a dependency cycle).
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Run-level aggregate of node failures.
    #[error(transparent)]
    RunFailed(Box<RunFailed>),
}

impl Error {
    pub(crate) fn runtime(pos: &SourcePosition, source: EvalError) -> Self {
        Self::Runtime {
            pos: pos.clone(),
            source,
        }
    }

    /// True for the RuntimeError family (evaluation faults and failed assertions).
    pub fn is_runtime_error(&self) -> bool {
        matches!(self, Self::Runtime { .. } | Self::AssertionFailed { .. })
    }

    /// Follows [`Error::RunFailed`] wrappers down to the underlying error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::RunFailed(run) => run.root_cause(),
            other => other,
        }
    }
}

/// One node's failure, identified by its path within the run.
#[derive(Debug)]
pub struct NodeFailure {
    /// Path id of the failed node, e.g. `scatter-L3C5/2/call-align`
    pub node: String,
    /// Source position of the failed node
    pub pos: SourcePosition,
    pub error: Error,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.node, self.pos, self.error)
    }
}

/// A failed run: the first failure by completion order, plus any failures
/// observed while in-flight work drained.
#[derive(Debug)]
pub struct RunFailed {
    pub run_dir: PathBuf,
    pub failure: NodeFailure,
    pub secondary: Vec<NodeFailure>,
}

impl RunFailed {
    pub fn root_cause(&self) -> &Error {
        self.failure.error.root_cause()
    }
}

impl fmt::Display for RunFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run failed at {}; run directory: {}",
            self.failure,
            self.run_dir.display()
        )?;
        if !self.secondary.is_empty() {
            write!(f, " ({} further failure(s))", self.secondary.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure.error)
    }
}

impl From<RunFailed> for Error {
    fn from(run: RunFailed) -> Self {
        Self::RunFailed(Box::new(run))
    }
}
