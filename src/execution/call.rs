//! Call Executor
//!
//! Runs one call node:
//!
//! 1. Resolve the callee's inputs: the call's own input expressions, then
//!    run-input overrides (`call.input`), then the callee's defaults.
//! 2. Consult the call cache.
//! 3. Task callees: claim resources and a concurrency slot, then hand the
//!    invocation to the backend, retrying transient failures with backoff
//!    and enforcing the call's time limit.
//!    Workflow callees: schedule the callee's body as a fresh scope nested
//!    in the call directory.
//! 4. Record outputs (`outputs.json`, cache entry) and bind them under the
//!    call's name.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, Runtime, TaskRequest};
use super::cache::CallCache;
use super::nodes;
use super::scheduler::{run_scope, Frame, RunContext};
use crate::env::Bindings;
use crate::error::{Error, Result};
use crate::expr::StdLib;
use crate::value::{values_to_json, Value};
use crate::workflow::{Call, Callee, Task, Workflow};

/// Executes `call` and returns its outputs namespaced under the call name.
pub async fn run_call(
    ctx: Arc<RunContext>,
    call: Arc<Call>,
    env: Bindings<Value>,
    frame: Frame,
    path: String,
) -> Result<Bindings<Value>> {
    let dir = frame.dir.join(call.id());
    let inputs = resolve_inputs(&call, &env, &frame.inputs)?;
    fs::create_dir_all(&dir).await?;
    write_json(&dir.join("inputs.json"), &inputs).await?;

    let outputs = match &call.callee {
        Callee::Task(task) => run_task(&ctx, &call, task, inputs, &dir, &path).await?,
        Callee::Workflow(workflow) => run_workflow(&ctx, &call, workflow, inputs, &dir, &path).await?,
    };

    write_json(&dir.join("outputs.json"), &outputs).await?;
    info!("{}: call completed", path);
    Ok(outputs.wrap_namespace(&call.name))
}

/// Resolves the callee's input bindings for this call site.
///
/// Task inputs are fully resolved here, with defaults evaluated against
/// the inputs resolved before them. Sub-workflow inputs left unbound are
/// omitted; the sub-workflow's own declarations supply their defaults.
pub fn resolve_inputs(
    call: &Call,
    env: &Bindings<Value>,
    overrides: &Bindings<Value>,
) -> Result<Bindings<Value>> {
    let stdlib = StdLib::new();
    let mut resolved = Bindings::new();
    for decl in call.callee.inputs() {
        let supplied = match call.inputs.get(&decl.name) {
            Some(expr) => Some(expr.eval(env, &stdlib).map_err(|e| Error::runtime(&call.pos, e))?),
            None => overrides.get(&format!("{}.{}", call.name, decl.name)).cloned(),
        };
        let value = match (supplied, &call.callee) {
            (Some(value), _) => value.coerce(&decl.ty).map_err(|e| Error::runtime(&call.pos, e))?,
            (None, Callee::Workflow(_)) => continue,
            (None, Callee::Task(_)) => nodes::evaluate_decl(decl, &resolved, &Bindings::new())
                .map_err(|e| match e {
                    Error::Input(_) => Error::Input(format!(
                        "call {} is missing required input {}",
                        call.name, decl.name
                    )),
                    other => other,
                })?,
        };
        resolved = resolved.bind(decl.name.clone(), value);
    }
    Ok(resolved)
}

async fn run_task(
    ctx: &Arc<RunContext>,
    call: &Call,
    task: &Arc<Task>,
    inputs: Bindings<Value>,
    dir: &Path,
    path: &str,
) -> Result<Bindings<Value>> {
    let mut env = inputs.clone();
    for decl in &task.postinputs {
        let value = nodes::evaluate_decl(decl, &env, &Bindings::new())?;
        env = env.bind(decl.name.clone(), value);
    }
    for assertion in &task.assertions {
        nodes::check_assertion(assertion, &env)?;
    }
    let runtime = Runtime::evaluate(task, &env)?;

    let request = TaskRequest {
        call: path.to_string(),
        task: Arc::clone(task),
        inputs: env,
        runtime,
        dir: dir.to_path_buf(),
    };

    let key = match &ctx.cache {
        Some(_) => Some(CallCache::key(
            &call.callee,
            &inputs,
            &ctx.backend.fingerprint(&request),
        )?),
        None => None,
    };
    if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
        if let Some(outputs) = cache.get(key, &task.output_types()).await {
            info!("{}: reusing cached outputs of {}", path, task.name);
            return Ok(outputs);
        }
    }

    let _reservation = ctx
        .reserve(request.runtime.cpu, request.runtime.memory_bytes)
        .await?;
    let _permit = ctx.permit().await?;
    ctx.started(path);
    info!("{}: starting task {}", path, task.name);
    let outputs = execute_with_retry(ctx, &request).await?;

    if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
        if let Err(e) = cache.put(key, &task.name, &outputs).await {
            warn!("{}: failed to store call cache entry: {}", path, e);
        }
    }
    Ok(outputs)
}

/// Time limit for one attempt: the tightest of the configured per-call
/// timeout, the task's own `timeout` and the time left in the run.
fn time_limit(ctx: &RunContext, request: &TaskRequest) -> Option<Duration> {
    [ctx.config.task_timeout(), request.runtime.timeout, ctx.remaining()]
        .into_iter()
        .flatten()
        .min()
}

async fn execute_with_retry(ctx: &RunContext, request: &TaskRequest) -> Result<Bindings<Value>> {
    let retry = &ctx.config.retry;
    let max_retries = retry
        .max_retries
        .max(request.runtime.max_retries.unwrap_or(0));
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let abort = CancellationToken::new();
        let mut execution = ctx.backend.execute(request, abort.clone());
        let limit = time_limit(ctx, request);

        let result = match limit {
            Some(limit) => {
                let finished = tokio::select! {
                    result = &mut execution => Some(result),
                    _ = tokio::time::sleep(limit) => None,
                };
                match finished {
                    Some(result) => result,
                    None => {
                        warn!("{}: timed out after {:?}, terminating", request.call, limit);
                        abort.cancel();
                        let _ = execution.await;
                        return Err(Error::CallFailed {
                            call: request.call.clone(),
                            exit_status: None,
                            stderr: String::new(),
                            message: format!("timed out after {:?}", limit),
                        });
                    }
                }
            }
            None => execution.await,
        };

        match result {
            Ok(outputs) => return Ok(outputs),
            Err(BackendError::Transient(message)) if attempt <= max_retries => {
                let delay = retry.backoff(attempt);
                warn!(
                    "{}: {} (attempt {}/{}), retrying in {:?}",
                    request.call,
                    message,
                    attempt,
                    max_retries + 1,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = ctx.stopped() => {
                        info!("{}: run stopped, not retrying", request.call);
                        return Err(Error::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(BackendError::Transient(message)) => {
                return Err(Error::CallFailed {
                    call: request.call.clone(),
                    exit_status: None,
                    stderr: String::new(),
                    message: format!("{} (gave up after {} attempt(s))", message, attempt),
                });
            }
            Err(BackendError::Permanent {
                exit_status,
                stderr,
                message,
            }) => {
                return Err(Error::CallFailed {
                    call: request.call.clone(),
                    exit_status,
                    stderr,
                    message,
                });
            }
        }
    }
}

async fn run_workflow(
    ctx: &Arc<RunContext>,
    call: &Call,
    workflow: &Arc<Workflow>,
    inputs: Bindings<Value>,
    dir: &Path,
    path: &str,
) -> Result<Bindings<Value>> {
    let key = match &ctx.cache {
        Some(_) => Some(CallCache::key(&call.callee, &inputs, ctx.backend.name())?),
        None => None,
    };
    if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
        if let Some(outputs) = cache.get(key, &workflow.output_types()).await {
            info!("{}: reusing cached outputs of {}", path, workflow.name);
            return Ok(outputs);
        }
    }

    ctx.started(path);
    info!("{}: starting workflow {}", path, workflow.name);
    let frame = Frame {
        path: format!("{}/", path),
        dir: dir.to_path_buf(),
        inputs,
    };
    let produced = run_scope(
        Arc::clone(ctx),
        workflow.scope().clone(),
        Bindings::new(),
        frame,
    )
    .await?;
    let outputs = nodes::workflow_outputs(workflow, &produced)?;

    if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
        if let Err(e) = cache.put(key, &workflow.name, &outputs).await {
            warn!("{}: failed to store call cache entry: {}", path, e);
        }
    }
    Ok(outputs)
}

async fn write_json(path: &Path, values: &Bindings<Value>) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(&values_to_json(values, ""))?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourcePosition;
    use crate::value::Type;
    use crate::workflow::Decl;

    fn task() -> Arc<Task> {
        Arc::new(
            Task::new("t", "true")
                .with_input(Decl::new("a", Type::Int))
                .with_input(Decl::new("b", Type::Int).with_expr("a + 1".parse().unwrap()))
                .with_input(Decl::new("c", "String?".parse().unwrap())),
        )
    }

    #[test]
    fn test_resolve_inputs_precedence() {
        let call = Call::new("t", Callee::Task(task())).with_input("a", "x * 2".parse().unwrap());
        let env = Bindings::new().bind("x", Value::Int(5));

        let inputs = resolve_inputs(&call, &env, &Bindings::new()).unwrap();
        assert_eq!(inputs.get("a"), Some(&Value::Int(10)));
        assert_eq!(inputs.get("b"), Some(&Value::Int(11)));
        assert_eq!(inputs.get("c"), Some(&Value::Null));

        let overrides = Bindings::new()
            .bind("t.b", Value::Int(100))
            .bind("t.a", Value::Int(-1));
        let inputs = resolve_inputs(&call, &env, &overrides).unwrap();
        assert_eq!(inputs.get("a"), Some(&Value::Int(10)));
        assert_eq!(inputs.get("b"), Some(&Value::Int(100)));
    }

    #[test]
    fn test_missing_required_input() {
        let call = Call::new("t", Callee::Task(task()));
        match resolve_inputs(&call, &Bindings::new(), &Bindings::new()) {
            Err(Error::Input(message)) => assert!(message.contains("missing required input a")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_input_evaluation_error_is_positioned() {
        let call = Call::new("t", Callee::Task(task()))
            .with_input("a", "missing + 1".parse().unwrap())
            .at(SourcePosition::new("w.yaml", 12, 5));
        let err = resolve_inputs(&call, &Bindings::new(), &Bindings::new()).unwrap_err();
        assert!(err.is_runtime_error());
        assert!(err.to_string().starts_with("w.yaml:12:5"));
    }

    #[test]
    fn test_sub_workflow_defaults_are_left_to_the_callee() {
        let workflow = Workflow::new(
            "sub",
            vec![Decl::new("n", Type::Int).with_expr("3".parse().unwrap())],
            Vec::new(),
            None,
        )
        .unwrap();
        let call = Call::new("sub", Callee::Workflow(Arc::new(workflow)));
        let inputs = resolve_inputs(&call, &Bindings::new(), &Bindings::new()).unwrap();
        assert!(inputs.is_empty());
    }
}
