//! Workflow Execution Engine
//!
//! The run driver. For one target (a workflow, or a task run as a
//! one-call workflow) it:
//! - Checks the inputs against the target's declarations
//! - Allocates the run directory and downloads URI inputs
//! - Schedules the top-level scope
//! - Evaluates the outputs, or aggregates node failures into [`RunFailed`]
//! - Leaves `inputs.json`, `outputs.json` / `error.json`, `state.json` and
//!   `timeline.txt` behind for inspection
//!
//! Run directory layout:
//!
//! ```text
//! <run_root>/20240101_120000_wf/
//!   inputs.json
//!   outputs.json
//!   state.json
//!   timeline.txt
//!   download/0/reads.fq
//!   call-prepare/
//!   scatter-L8C1/0/call-align/
//!   scatter-L8C1/1/call-align/
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use log::{debug, info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::backend::TaskBackend;
use super::download::{Downloader, FileFetcher};
use super::local::LocalBackend;
use super::nodes;
use super::scheduler::{run_scope, Frame, RunContext};
use crate::config::Config;
use crate::env::Bindings;
use crate::error::{Error, NodeFailure, Result, RunFailed, SourcePosition};
use crate::value::{values_to_json, Value};
use crate::workflow::{Call, Callee, RunState, Target, Task, Workflow};

/// Result of a successful run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_dir: PathBuf,
    /// The target's outputs, un-namespaced
    pub outputs: Bindings<Value>,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use wdlrunner::{load_document, Bindings, Config, Engine};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_document("pipeline.yaml")?;
///     let target = document.target(None)?;
///     let config = Config {
///         max_concurrency: 4,
///         ..Config::default()
///     };
///
///     let outcome = Engine::new()
///         .with_config(config)
///         .run(&target, Bindings::new())
///         .await?;
///     println!("outputs in {}", outcome.run_dir.display());
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: Config,
    backend: Option<Arc<dyn TaskBackend>>,
    fetchers: Vec<Arc<dyn FileFetcher>>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            fetchers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default local-process backend.
    pub fn with_backend(mut self, backend: Arc<dyn TaskBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn FileFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    /// Cancelling `token` stops the run: no new nodes start, running ones
    /// drain, and `run` returns [`Error::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn backend(&self) -> Arc<dyn TaskBackend> {
        match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => {
                let local = match &self.config.container_cli {
                    Some(cli) => LocalBackend::new().with_container_cli(cli.clone()),
                    None => LocalBackend::new(),
                };
                Arc::new(local)
            }
        }
    }

    /// Runs `target` with `inputs` (names as in the target's available
    /// inputs, e.g. `sample` or `align.threads`).
    pub async fn run(&self, target: &Target, inputs: Bindings<Value>) -> Result<RunOutcome> {
        let start_time = Instant::now();
        self.config.validate()?;
        check_inputs(target, &inputs)?;

        let run_dir = create_run_dir(&self.config.run_root, target.name())?;
        let run_id = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Starting run {} ({})", run_id, run_dir.display());
        fs::write(
            run_dir.join("inputs.json"),
            serde_json::to_vec_pretty(&values_to_json(&inputs, target.name()))?,
        )?;

        let downloader = self
            .fetchers
            .iter()
            .fold(Downloader::new(self.config.download.clone()), |d, f| {
                d.with_fetcher(Arc::clone(f))
            });
        let inputs = match downloader.materialize(inputs, &run_dir).await {
            Ok(inputs) => inputs,
            Err(e) => {
                let failure = NodeFailure {
                    node: "inputs".to_string(),
                    pos: SourcePosition::default(),
                    error: e,
                };
                return Err(failed_run(&run_dir, vec![failure]));
            }
        };

        let (workflow, frame_inputs) = match target {
            Target::Workflow(workflow) => (Arc::clone(workflow), inputs),
            Target::Task(task) => (Arc::new(task_workflow(task)?), inputs.wrap_namespace(&task.name)),
        };

        let ctx = Arc::new(RunContext::new(
            self.config.clone(),
            run_dir.clone(),
            self.backend(),
            RunState::new(run_id.clone(), target.name()),
            &self.cancel,
        ));
        info!(
            "Scheduling {} (max concurrency: {}, call cache: {})",
            target.name(),
            self.config.max_concurrency,
            if ctx.cache.is_some() { "on" } else { "off" }
        );

        let result = run_scope(
            Arc::clone(&ctx),
            workflow.scope().clone(),
            Bindings::new(),
            Frame::root(&run_dir, frame_inputs),
        )
        .await
        .and_then(|produced| match target {
            Target::Task(task) => Ok(produced.enter_namespace(&task.name)),
            Target::Workflow(workflow) => nodes::workflow_outputs(workflow, &produced).map_err(|e| {
                ctx.record_failure("output", workflow.pos.clone(), e);
                Error::Cancelled
            }),
        });

        ctx.flush().await;
        let timeline = ctx.timeline_snapshot();
        if let Err(e) = timeline.write_to(&run_dir.join("timeline.txt")) {
            warn!("Failed to write timeline: {}", e);
        }
        debug!("{}", timeline.gantt_chart());
        let counts = ctx.state_snapshot().counts();
        let summary: Vec<String> = counts
            .iter()
            .map(|(status, n)| format!("{} {:?}", n, status).to_lowercase())
            .collect();

        match result {
            Ok(outputs) => {
                fs::write(
                    run_dir.join("outputs.json"),
                    serde_json::to_vec_pretty(&values_to_json(&outputs, target.name()))?,
                )?;
                info!(
                    "Run {} completed in {:.2?} ({})",
                    run_id,
                    start_time.elapsed(),
                    summary.join(", ")
                );
                Ok(RunOutcome { run_dir, outputs })
            }
            Err(e) => {
                let mut failures = ctx.take_failures();
                if failures.is_empty() {
                    if matches!(e, Error::Cancelled) {
                        warn!("Run {} cancelled ({})", run_id, summary.join(", "));
                        write_error_file(&run_dir, &json!({ "error": e.to_string() }));
                        return Err(Error::Cancelled);
                    }
                    failures.push(NodeFailure {
                        node: workflow.name.clone(),
                        pos: workflow.pos.clone(),
                        error: e,
                    });
                }
                Err(failed_run(&run_dir, failures))
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects unknown inputs and missing required ones.
fn check_inputs(target: &Target, inputs: &Bindings<Value>) -> Result<()> {
    let available = target.available_inputs();
    if let Some(unknown) = inputs.iter().find(|b| !available.has_binding(b.name())) {
        return Err(Error::Input(format!("unknown input/output: {}", unknown.name())));
    }
    let missing = target.required_inputs().subtract(inputs);
    if !missing.is_empty() {
        return Err(Error::Input(format!(
            "missing required inputs/outputs: {}",
            missing.names().join(", ")
        )));
    }
    Ok(())
}

/// A task run on its own: one call whose inputs all come from the run
/// inputs (as `task.input`).
fn task_workflow(task: &Arc<Task>) -> Result<Workflow> {
    let call = Call::new(task.name.clone(), Callee::Task(Arc::clone(task))).at(task.pos.clone());
    Ok(Workflow::new(task.name.clone(), Vec::new(), vec![call.into()], None)?.at(task.pos.clone()))
}

/// Creates `<root>/<timestamp>_<name>`, adding `_2`, `_3`... if taken.
fn create_run_dir(root: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let base = format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), name);
    let mut dir = root.join(&base);
    let mut n = 1;
    loop {
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                n += 1;
                dir = root.join(format!("{}_{}", base, n));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn failed_run(run_dir: &Path, mut failures: Vec<NodeFailure>) -> Error {
    let failure = failures.remove(0);
    let run = RunFailed {
        run_dir: run_dir.to_path_buf(),
        failure,
        secondary: failures,
    };

    let mut report = json!({
        "node": run.failure.node,
        "pos": run.failure.pos.to_string(),
        "error": run.failure.error.to_string(),
        "run_dir": run_dir.to_string_lossy(),
        "secondary": run
            .secondary
            .iter()
            .map(|f| json!({ "node": f.node, "error": f.error.to_string() }))
            .collect::<Vec<_>>(),
    });
    if let Error::CallFailed {
        exit_status, stderr, ..
    } = run.root_cause()
    {
        report["exit_status"] = json!(exit_status);
        report["stderr"] = json!(stderr);
    }
    write_error_file(run_dir, &report);
    run.into()
}

fn write_error_file(run_dir: &Path, report: &serde_json::Value) {
    let written = serde_json::to_vec_pretty(report)
        .map_err(Error::from)
        .and_then(|bytes| fs::write(run_dir.join("error.json"), bytes).map_err(Error::from));
    if let Err(e) = written {
        warn!("Failed to write error.json: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BackendError, TaskRequest};
    use crate::expr::StdLib;
    use crate::workflow::{parse_document, NodeStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Evaluates task outputs in-process instead of running commands.
    #[derive(Default)]
    struct MockBackend {
        events: Mutex<Vec<String>>,
        /// Call paths in completion order
        finished: Mutex<Vec<String>>,
        invocations: AtomicUsize,
        transient_failures: AtomicUsize,
        /// Limits transient failures to one task
        flaky_task: Option<String>,
        failing_task: Option<String>,
        /// Delays keyed by task name or call path
        delays: Vec<(String, Duration)>,
    }

    impl MockBackend {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn finished(&self) -> Vec<String> {
            self.finished.lock().unwrap().clone()
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        async fn execute(
            &self,
            request: &TaskRequest,
            abort: CancellationToken,
        ) -> std::result::Result<Bindings<Value>, BackendError> {
            let name = request.task.name.clone();
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(format!("start:{}", name));

            let flaky = self.flaky_task.as_deref().map_or(true, |task| task == name);
            let pending = self.transient_failures.load(Ordering::SeqCst);
            if flaky && pending > 0 {
                self.transient_failures.store(pending - 1, Ordering::SeqCst);
                return Err(BackendError::Transient("node preempted".into()));
            }
            let delay = self
                .delays
                .iter()
                .find(|(key, _)| *key == name || *key == request.call)
                .map(|(_, delay)| *delay);
            if let Some(delay) = delay {
                tokio::select! {
                    _ = abort.cancelled() => return Err(BackendError::permanent("aborted")),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.failing_task.as_deref() == Some(name.as_str()) {
                return Err(BackendError::Permanent {
                    exit_status: Some(1),
                    stderr: "boom".into(),
                    message: "command exited with status 1".into(),
                });
            }

            let mut env = request.inputs.clone();
            let mut outputs = Bindings::new();
            for decl in &request.task.outputs {
                let value = decl
                    .expr
                    .as_ref()
                    .unwrap()
                    .eval(&env, &StdLib::new())
                    .and_then(|v| v.coerce(&decl.ty))
                    .map_err(|e| BackendError::permanent(e.to_string()))?;
                env = env.bind(decl.name.clone(), value.clone());
                outputs = outputs.bind(decl.name.clone(), value);
            }
            self.events.lock().unwrap().push(format!("end:{}", name));
            self.finished.lock().unwrap().push(request.call.clone());
            Ok(outputs)
        }
    }

    fn ints(values: &[i64]) -> Value {
        Value::Array(values.iter().map(|&i| Value::Int(i)).collect())
    }

    const TASKS: &str = r#"
tasks:
  - name: inc
    inputs: [{ name: n, type: Int }]
    command: "echo ~{n}"
    outputs: [{ name: out, type: Int, expr: "n + 1" }]
  - name: fail
    command: "exit 1"
    outputs: [{ name: out, type: Int, expr: "0" }]
  - name: slow
    command: "sleep 1"
    outputs: [{ name: out, type: Int, expr: "7" }]
"#;

    fn target(workflow: &str) -> Target {
        let source = format!("{}{}", TASKS, workflow);
        parse_document(&source, "test.yaml").unwrap().target(None).unwrap()
    }

    fn engine(dir: &TempDir, backend: Arc<MockBackend>) -> Engine {
        let config = Config {
            max_concurrency: 4,
            run_root: dir.path().to_path_buf(),
            retry: crate::config::RetryConfig {
                max_retries: 1,
                backoff_ms: 1,
                backoff_multiplier: 1.0,
            },
            ..Config::default()
        };
        Engine::new().with_config(config).with_backend(backend)
    }

    #[tokio::test]
    async fn test_scatter_gathers_in_order() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - scatter:
        variable: x
        expr: "[1, 2, 3]"
        body:
          - decl: { name: y, type: Int, expr: "x * 2" }
          - call: { callee: inc, inputs: { n: y } }
  outputs:
    - { name: ys, type: "Array[Int]", expr: y }
    - { name: incs, type: "Array[Int]", expr: inc.out }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let outcome = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap();

        assert_eq!(outcome.outputs.get("ys"), Some(&ints(&[2, 4, 6])));
        assert_eq!(outcome.outputs.get("incs"), Some(&ints(&[3, 5, 7])));
        assert_eq!(backend.invocations(), 3);

        let scatter_dir = outcome.run_dir.join("scatter-L9C1");
        assert!(scatter_dir.join("2/call-inc/inputs.json").exists());
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(outcome.run_dir.join("outputs.json")).unwrap()).unwrap();
        assert_eq!(written["wf.ys"], json!([2, 4, 6]));
        assert!(outcome.run_dir.join("timeline.txt").exists());

        let state = RunState::load(&outcome.run_dir).unwrap();
        assert_eq!(state.status("scatter-L9C1/1/call-inc"), Some(NodeStatus::Done));
    }

    #[tokio::test]
    async fn test_empty_scatter_runs_nothing() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  inputs: [{ name: xs, type: "Array[Int]" }]
  body:
    - scatter:
        variable: x
        expr: xs
        body:
          - call: { callee: inc, inputs: { n: x } }
  outputs:
    - { name: outs, type: "Array[Int]", expr: inc.out }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let inputs = Bindings::new().bind("xs", Value::Array(Vec::new()));
        let outcome = engine(&dir, backend.clone()).run(&wf, inputs).await.unwrap();
        assert_eq!(outcome.outputs.get("outs"), Some(&Value::Array(Vec::new())));
        assert_eq!(backend.invocations(), 0);
    }

    #[tokio::test]
    async fn test_conditional_gates_body() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  inputs: [{ name: flag, type: Boolean }]
  body:
    - if:
        expr: flag
        body:
          - call: { callee: inc, inputs: { n: "41" } }
  outputs:
    - { name: answer, type: "Int?", expr: inc.out }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let off = engine(&dir, backend.clone())
            .run(&wf, Bindings::new().bind("flag", Value::Boolean(false)))
            .await
            .unwrap();
        assert_eq!(off.outputs.get("answer"), Some(&Value::Null));
        assert_eq!(backend.invocations(), 0);

        let on = engine(&dir, backend.clone())
            .run(&wf, Bindings::new().bind("flag", Value::Boolean(true)))
            .await
            .unwrap();
        assert_eq!(on.outputs.get("answer"), Some(&Value::Int(42)));
        assert_eq!(backend.invocations(), 1);
        assert_ne!(off.run_dir, on.run_dir);
    }

    #[tokio::test]
    async fn test_call_cache_skips_second_execution() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  inputs: [{ name: n, type: Int }]
  body:
    - call: { callee: inc, inputs: { n: n } }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let mut config = engine(&dir, backend.clone()).config().clone();
        config.call_cache.enabled = true;
        config.call_cache.dir = Some(dir.path().join("cache"));
        let engine = Engine::new().with_config(config).with_backend(backend.clone());

        let inputs = Bindings::new().bind("n", Value::Int(1));
        let first = engine.run(&wf, inputs.clone()).await.unwrap();
        let second = engine.run(&wf, inputs).await.unwrap();
        assert_eq!(backend.invocations(), 1);
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(second.outputs.get("inc.out"), Some(&Value::Int(2)));

        engine
            .run(&wf, Bindings::new().bind("n", Value::Int(5)))
            .await
            .unwrap();
        assert_eq!(backend.invocations(), 2);
    }

    #[tokio::test]
    async fn test_failed_assertion_before_any_call() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  inputs:
    - { name: numerator, type: Int }
    - { name: denominator, type: Int }
  body:
    - assert: "denominator != 0"
    - decl: { name: quotient, type: Int, expr: "numerator / denominator" }
    - call: { callee: inc, inputs: { n: quotient } }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let inputs = Bindings::new()
            .bind("numerator", Value::Int(7))
            .bind("denominator", Value::Int(0));
        let err = engine(&dir, backend.clone()).run(&wf, inputs).await.unwrap_err();

        assert!(err.root_cause().is_runtime_error());
        assert_eq!(backend.invocations(), 0);
        match &err {
            Error::RunFailed(run) => {
                assert!(run.run_dir.join("error.json").exists());
                assert!(run.failure.node == "assert-L11C1" || run.failure.node == "decl-quotient");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: inc, inputs: { n: "1" } }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        backend.transient_failures.store(1, Ordering::SeqCst);
        let outcome = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap();
        assert_eq!(backend.invocations(), 2);
        assert_eq!(outcome.outputs.get("inc.out"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_dependent_call_waits_for_producer() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: inc, alias: b, inputs: { n: a.out } }
    - call: { callee: inc, alias: a, inputs: { n: "1" } }
  outputs:
    - { name: result, type: Int, expr: b.out }
"#,
        );
        let backend = Arc::new(MockBackend::default());
        let outcome = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap();
        assert_eq!(outcome.outputs.get("result"), Some(&Value::Int(3)));
        assert_eq!(backend.events(), vec!["start:inc", "end:inc", "start:inc", "end:inc"]);
        assert!(outcome.run_dir.join("call-a/outputs.json").exists());
        assert!(outcome.run_dir.join("call-b/outputs.json").exists());
    }

    #[tokio::test]
    async fn test_failure_stops_new_work_and_drains() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: fail }
    - call: { callee: slow }
    - call: { callee: inc, inputs: { n: slow.out } }
"#,
        );
        let backend = Arc::new(MockBackend {
            failing_task: Some("fail".into()),
            delays: vec![
                ("fail".into(), Duration::from_millis(100)),
                ("slow".into(), Duration::from_millis(400)),
            ],
            ..MockBackend::default()
        });
        let err = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap_err();

        let Error::RunFailed(run) = &err else {
            panic!("unexpected {:?}", err);
        };
        assert_eq!(run.failure.node, "call-fail");
        assert!(matches!(
            run.root_cause(),
            Error::CallFailed { exit_status: Some(1), .. }
        ));
        let events = backend.events();
        assert!(events.contains(&"end:slow".to_string()));
        assert!(!events.contains(&"start:inc".to_string()));

        let state = RunState::load(&run.run_dir).unwrap();
        assert_eq!(state.status("call-fail"), Some(NodeStatus::Failed));
        assert_eq!(state.status("call-slow"), Some(NodeStatus::Done));
        assert_eq!(state.status("call-inc"), Some(NodeStatus::Pending));
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run.run_dir.join("error.json")).unwrap()).unwrap();
        assert_eq!(report["node"], "call-fail");
        assert_eq!(report["stderr"], "boom");
    }

    #[tokio::test]
    async fn test_later_failures_are_secondary() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: fail, alias: f1 }
    - call: { callee: fail, alias: f2 }
"#,
        );
        let backend = Arc::new(MockBackend {
            failing_task: Some("fail".into()),
            delays: vec![
                ("call-f1".into(), Duration::from_millis(100)),
                ("call-f2".into(), Duration::from_millis(300)),
            ],
            ..MockBackend::default()
        });
        let err = engine(&dir, backend).run(&wf, Bindings::new()).await.unwrap_err();

        let Error::RunFailed(run) = &err else {
            panic!("unexpected {:?}", err);
        };
        assert_eq!(run.failure.node, "call-f1");
        let secondary: Vec<&str> = run.secondary.iter().map(|f| f.node.as_str()).collect();
        assert_eq!(secondary, vec!["call-f2"]);
        assert!(err.to_string().contains("1 further failure(s)"));

        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run.run_dir.join("error.json")).unwrap()).unwrap();
        assert_eq!(report["secondary"][0]["node"], "call-f2");
    }

    #[tokio::test]
    async fn test_call_time_limit() {
        let dir = tempdir().unwrap();
        let document = parse_document(
            r#"
tasks:
  - name: hang
    command: "sleep 60"
    outputs: [{ name: out, type: Int, expr: "1" }]
    runtime: { timeout: "1" }
workflow:
  name: wf
  body:
    - call: { callee: hang }
"#,
            "test.yaml",
        )
        .unwrap();
        let wf = document.target(None).unwrap();
        let backend = Arc::new(MockBackend {
            delays: vec![("hang".into(), Duration::from_secs(30))],
            ..MockBackend::default()
        });

        let started = Instant::now();
        let err = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err.root_cause() {
            Error::CallFailed {
                call,
                exit_status: None,
                message,
                ..
            } => {
                assert_eq!(call, "call-hang");
                assert!(message.contains("timed out after 1s"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(backend.invocations(), 1);
        assert!(backend.finished().is_empty());
    }

    #[tokio::test]
    async fn test_scatter_order_ignores_completion_order() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - scatter:
        variable: x
        expr: "[1, 2, 3]"
        body:
          - call: { callee: inc, inputs: { n: "x * 10" } }
  outputs:
    - { name: outs, type: "Array[Int]", expr: inc.out }
"#,
        );
        let backend = Arc::new(MockBackend {
            delays: vec![
                ("scatter-L9C1/0/call-inc".into(), Duration::from_millis(300)),
                ("scatter-L9C1/1/call-inc".into(), Duration::from_millis(150)),
            ],
            ..MockBackend::default()
        });
        let outcome = engine(&dir, backend.clone()).run(&wf, Bindings::new()).await.unwrap();

        assert_eq!(
            backend.finished(),
            vec![
                "scatter-L9C1/2/call-inc",
                "scatter-L9C1/1/call-inc",
                "scatter-L9C1/0/call-inc"
            ]
        );
        assert_eq!(outcome.outputs.get("outs"), Some(&ints(&[11, 21, 31])));
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_backoff() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: fail }
    - call: { callee: inc, inputs: { n: "1" } }
"#,
        );
        let backend = Arc::new(MockBackend {
            failing_task: Some("fail".into()),
            flaky_task: Some("inc".into()),
            delays: vec![("fail".into(), Duration::from_millis(100))],
            ..MockBackend::default()
        });
        backend.transient_failures.store(100, Ordering::SeqCst);
        let mut config = engine(&dir, backend.clone()).config().clone();
        config.retry.max_retries = 5;
        config.retry.backoff_ms = 30_000;
        let engine = Engine::new().with_config(config).with_backend(backend.clone());

        let started = Instant::now();
        let err = engine.run(&wf, Bindings::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(backend.invocations(), 2);

        let Error::RunFailed(run) = &err else {
            panic!("unexpected {:?}", err);
        };
        assert_eq!(run.failure.node, "call-fail");
        assert!(run.secondary.is_empty());
        let state = RunState::load(&run.run_dir).unwrap();
        assert_eq!(state.status("call-inc"), Some(NodeStatus::Failed));
    }

    #[tokio::test]
    async fn test_task_target() {
        let dir = tempdir().unwrap();
        let document = parse_document(TASKS, "test.yaml").unwrap();
        let task = document.target(Some("inc")).unwrap();
        let backend = Arc::new(MockBackend::default());

        let outcome = engine(&dir, backend)
            .run(&task, Bindings::new().bind("n", Value::Int(9)))
            .await
            .unwrap();
        assert_eq!(outcome.outputs.names(), vec!["out"]);
        assert_eq!(outcome.outputs.get("out"), Some(&Value::Int(10)));
        assert!(outcome.run_dir.join("call-inc/inputs.json").exists());
    }

    #[tokio::test]
    async fn test_sub_workflow_call() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("lib.yaml"),
            r#"
tasks:
  - { name: inc, command: "echo ~{n}", inputs: [{ name: n, type: Int }], outputs: [{ name: out, type: Int, expr: "n + 1" }] }
workflow:
  name: twice
  inputs: [{ name: n, type: Int, expr: "10" }]
  body:
    - call: { callee: inc, alias: first, inputs: { n: n } }
    - call: { callee: inc, alias: second, inputs: { n: first.out } }
  outputs: [{ name: out, type: Int, expr: second.out }]
"#,
        )
        .unwrap();
        let main = dir.path().join("main.yaml");
        fs::write(
            &main,
            r#"
imports:
  - { uri: lib.yaml }
workflow:
  name: main
  body:
    - call: { callee: lib.twice, alias: explicit, inputs: { n: "1" } }
    - call: { callee: lib.twice, alias: defaulted }
"#,
        )
        .unwrap();
        let target = crate::workflow::load_document(&main).unwrap().target(None).unwrap();
        let backend = Arc::new(MockBackend::default());

        let outcome = engine(&dir, backend.clone()).run(&target, Bindings::new()).await.unwrap();
        assert_eq!(outcome.outputs.get("explicit.out"), Some(&Value::Int(3)));
        assert_eq!(outcome.outputs.get("defaulted.out"), Some(&Value::Int(12)));
        assert_eq!(backend.invocations(), 4);
        assert!(outcome
            .run_dir
            .join("call-explicit/call-second/outputs.json")
            .exists());
    }

    #[tokio::test]
    async fn test_input_checks() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  inputs: [{ name: n, type: Int }]
  body:
    - call: { callee: inc, inputs: { n: n } }
"#,
        );
        let engine = engine(&dir, Arc::new(MockBackend::default()));
        let missing = engine.run(&wf, Bindings::new()).await.unwrap_err();
        assert!(missing.to_string().contains("missing required inputs/outputs: n"));

        let unknown = Bindings::new().bind("n", Value::Int(1)).bind("m", Value::Int(2));
        let unknown = engine.run(&wf, unknown).await.unwrap_err();
        assert!(unknown.to_string().contains("unknown input/output: m"));
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let dir = tempdir().unwrap();
        let wf = target(
            r#"
workflow:
  name: wf
  body:
    - call: { callee: inc, inputs: { n: "1" } }
"#,
        );
        let token = CancellationToken::new();
        token.cancel();
        let backend = Arc::new(MockBackend::default());
        let err = engine(&dir, backend.clone())
            .with_cancellation(token)
            .run(&wf, Bindings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(backend.invocations(), 0);
    }

    #[test]
    fn test_run_dir_names_are_unique() {
        let dir = tempdir().unwrap();
        let first = create_run_dir(dir.path(), "wf").unwrap();
        let second = create_run_dir(dir.path(), "wf").unwrap();
        assert_ne!(first, second);
        assert!(first.file_name().unwrap().to_string_lossy().ends_with("_wf"));
    }
}
