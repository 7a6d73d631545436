//! Task Backend Interface
//!
//! The engine hands each live task invocation to a [`TaskBackend`]. A
//! backend runs the task's command with the resolved inputs inside the
//! call directory and returns the task's output bindings, or one of two
//! failure signals:
//!
//! - [`BackendError::Transient`]: infrastructure trouble; the call is retried
//! - [`BackendError::Permanent`]: the task itself failed; the call fails

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::env::Bindings;
use crate::error::{Error, EvalError, Result};
use crate::expr::StdLib;
use crate::value::Value;
use crate::workflow::Task;

/// Evaluated runtime attributes of one task invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Runtime {
    /// Container image (`docker` or `container`)
    pub image: Option<String>,
    pub cpu: u64,
    pub memory_bytes: u64,
    /// Transient-failure retries requested by the task (`maxRetries`)
    pub max_retries: Option<u32>,
    /// Wall-clock limit requested by the task (`timeout`, seconds)
    pub timeout: Option<Duration>,
}

impl Runtime {
    /// Evaluates the task's runtime section against its input bindings.
    pub fn evaluate(task: &Task, env: &Bindings<Value>) -> Result<Self> {
        let stdlib = StdLib::new();
        let mut runtime = Runtime {
            cpu: 1,
            ..Runtime::default()
        };
        for (key, expr) in &task.runtime {
            let value = expr
                .eval(env, &stdlib)
                .map_err(|e| Error::runtime(&task.pos, e))?;
            let attribute = |e: EvalError| {
                Error::runtime(
                    &task.pos,
                    EvalError::function("runtime", format!("{}: {}", key, e)),
                )
            };
            match key.as_str() {
                "docker" | "container" => {
                    runtime.image = Some(value.as_str().map_err(attribute)?.to_string())
                }
                "cpu" => runtime.cpu = value.as_int().map_err(attribute)?.max(1) as u64,
                "memory" => {
                    runtime.memory_bytes = match &value {
                        Value::Int(bytes) => (*bytes).max(0) as u64,
                        other => parse_memory(other.as_str().map_err(attribute)?).ok_or_else(|| {
                            attribute(EvalError::function("memory", format!("bad size {:?}", other.to_string())))
                        })?,
                    }
                }
                "maxRetries" => {
                    runtime.max_retries = Some(value.as_int().map_err(attribute)?.max(0) as u32)
                }
                "timeout" => {
                    runtime.timeout = Some(Duration::from_secs(
                        value.as_int().map_err(attribute)?.max(0) as u64,
                    ))
                }
                _ => {}
            }
        }
        Ok(runtime)
    }
}

/// Parses `"4 GiB"`, `"512M"`, `"100"` style sizes into bytes.
pub fn parse_memory(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "ki" | "kib" => 1024.0,
        "mi" | "mib" => 1024.0 * 1024.0,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "ti" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * factor) as u64)
}

/// One live task invocation.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Path id of the call within the run, for diagnostics
    pub call: String,
    pub task: Arc<Task>,
    /// Task inputs and post-input declarations
    pub inputs: Bindings<Value>,
    pub runtime: Runtime,
    /// Call directory; the backend owns its contents
    pub dir: PathBuf,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{message}")]
    Permanent {
        exit_status: Option<i32>,
        stderr: String,
        message: String,
    },
}

impl BackendError {
    pub fn permanent(message: impl Into<String>) -> Self {
        BackendError::Permanent {
            exit_status: None,
            stderr: String::new(),
            message: message.into(),
        }
    }
}

/// Pluggable executor of task commands.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Execution-environment details that change the outputs a request
    /// would produce. Part of the call cache key.
    fn fingerprint(&self, request: &TaskRequest) -> String {
        request.runtime.image.clone().unwrap_or_default()
    }

    /// Runs the task. `abort` is cancelled when the call's time limit
    /// elapses; the backend should then stop the running command.
    async fn execute(
        &self,
        request: &TaskRequest,
        abort: CancellationToken,
    ) -> std::result::Result<Bindings<Value>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("100"), Some(100));
        assert_eq!(parse_memory("4 GiB"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512M"), Some(512_000_000));
        assert_eq!(parse_memory("1.5 KiB"), Some(1536));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory("3 parsecs"), None);
    }

    #[test]
    fn test_runtime_evaluate() {
        let task = Task::new("t", "true")
            .with_runtime("docker", "\"ubuntu:~{version}\"".parse::<Expr>().unwrap())
            .with_runtime("cpu", Expr::Int(4))
            .with_runtime("memory", Expr::string("2 GiB"))
            .with_runtime("maxRetries", Expr::Int(3))
            .with_runtime("timeout", Expr::Int(60));
        let env = Bindings::new().bind("version", Value::string("22.04"));

        let runtime = Runtime::evaluate(&task, &env).unwrap();
        assert_eq!(runtime.image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(runtime.cpu, 4);
        assert_eq!(runtime.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(runtime.max_retries, Some(3));
        assert_eq!(runtime.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_runtime_defaults_and_errors() {
        let runtime = Runtime::evaluate(&Task::new("t", "true"), &Bindings::new()).unwrap();
        assert_eq!(runtime.cpu, 1);
        assert!(runtime.image.is_none());

        let task = Task::new("t", "true").with_runtime("cpu", Expr::string("many"));
        assert!(Runtime::evaluate(&task, &Bindings::new()).unwrap_err().is_runtime_error());
    }
}
