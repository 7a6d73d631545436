//! Graph Scheduler
//!
//! Drives one scope's dependency graph to completion. Every node whose
//! dependencies have finished is dispatched at once onto a `JoinSet`; each
//! completion is merged into the scope's bindings at a single point (the
//! loop below), which also records the node's status in the run state.
//!
//! Sections recurse: a scatter evaluates its collection once and schedules
//! one fresh instance of its body scope per element, a conditional
//! schedules its body at most once. Their gathers then collapse the body
//! results into the enclosing scope.
//!
//! On the first failure the run-wide stop token is cancelled. No scope
//! dispatches new nodes after that; nodes already running drain and their
//! results are discarded.
//!
//! Node path ids encode the nesting:
//!
//! ```text
//! decl-xs
//! scatter-L4C1
//! scatter-L4C1/0/call-align
//! scatter-L4C1/0/if-L6C3/decl-note
//! call-sub/call-inner
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::backend::TaskBackend;
use super::cache::CallCache;
use super::call::run_call;
use super::nodes::{self, SectionOutcome};
use super::resources::{Reservation, ResourceManager};
use crate::config::Config;
use crate::env::Bindings;
use crate::error::{Error, NodeFailure, Result, SourcePosition};
use crate::expr::StdLib;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::value::Value;
use crate::workflow::{
    Assertion, Conditional, Decl, NodeStatus, RunState, Scatter, Scope, WorkflowNode, WorkflowSection,
};

/// Everything shared by the scopes of one run.
pub struct RunContext {
    pub config: Config,
    pub run_dir: PathBuf,
    pub backend: Arc<dyn TaskBackend>,
    pub cache: Option<CallCache>,
    resources: Option<Arc<ResourceManager>>,
    slots: Arc<Semaphore>,
    stop: CancellationToken,
    deadline: Option<Instant>,
    failures: Mutex<Vec<NodeFailure>>,
    state: Arc<Mutex<RunState>>,
    state_dirty: Arc<Notify>,
    state_writer: Mutex<Option<JoinHandle<()>>>,
    writer_done: CancellationToken,
    timeline: Mutex<ExecutionTimeline>,
}

impl RunContext {
    /// `cancel` is the external cancellation signal; the run stops when it
    /// fires or when a node fails.
    ///
    /// Must be called within a Tokio runtime: it spawns the task that
    /// writes `state.json`.
    pub fn new(
        config: Config,
        run_dir: PathBuf,
        backend: Arc<dyn TaskBackend>,
        state: RunState,
        cancel: &CancellationToken,
    ) -> Self {
        let cache = CallCache::from_config(&config);
        let resources = ResourceManager::from_config(&config.resources);
        let deadline = config.run_timeout().map(|limit| Instant::now() + limit);
        let state = Arc::new(Mutex::new(state));
        let state_dirty = Arc::new(Notify::new());
        let writer_done = CancellationToken::new();
        let state_writer = tokio::spawn(write_state(
            Arc::clone(&state),
            Arc::clone(&state_dirty),
            run_dir.clone(),
            writer_done.clone(),
        ));
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            run_dir,
            backend,
            cache,
            resources,
            stop: cancel.child_token(),
            deadline,
            failures: Mutex::new(Vec::new()),
            state,
            state_dirty,
            state_writer: Mutex::new(Some(state_writer)),
            writer_done,
            timeline: Mutex::new(ExecutionTimeline::new()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the run stops.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Time left before the run deadline, if one is configured.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Waits for a global concurrency slot. Gives up once the run stops.
    pub async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| Error::Internal("concurrency limiter closed".into()))
            }
        }
    }

    /// Claims CPU/memory for a call when resource tracking is enabled.
    pub async fn reserve(&self, cpu: u64, memory: u64) -> Result<Option<Reservation>> {
        let Some(manager) = &self.resources else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Cancelled),
            reservation = manager.reserve(cpu, memory) => Ok(Some(reservation)),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timeline(&self) -> MutexGuard<'_, ExecutionTimeline> {
        self.timeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the nodes of a scope instance that is about to run.
    fn register(&self, paths: impl IntoIterator<Item = String>) {
        {
            let mut state = self.state();
            for path in paths {
                state.register(&path);
            }
        }
        self.persist();
    }

    fn mark_ready(&self, path: &str) {
        self.state().set_status(path, NodeStatus::Ready);
    }

    /// Marks a node as running once it holds what it needs to start.
    pub fn started(&self, path: &str) {
        debug!("{}: running", path);
        self.state().set_status(path, NodeStatus::Running);
        self.timeline().add_event(path, EventType::Started);
    }

    fn completed(&self, path: &str, outputs: &Bindings<Value>) {
        let recorded = self.state().mark_done(path, outputs);
        if recorded {
            self.timeline().add_event(path, EventType::Completed);
        }
        self.persist();
    }

    fn failed(&self, path: &str, pos: SourcePosition, error: Error) {
        error!("{} ({}) failed: {}", path, pos, error);
        self.state().mark_failed(path, error.to_string());
        self.timeline().add_event(path, EventType::Failed);
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(NodeFailure {
                node: path.to_string(),
                pos,
                error,
            });
        if !self.stop.is_cancelled() {
            warn!("Stopping run: no new work will be started");
            self.stop.cancel();
        }
        self.persist();
    }

    /// A node that gave up because the run stopped.
    fn abandoned(&self, path: &str) {
        let running = self.state().status(path) == Some(NodeStatus::Running);
        if running {
            self.state().mark_failed(path, "cancelled");
            self.timeline().add_event(path, EventType::Failed);
            self.persist();
        }
    }

    /// Records a failure raised outside any node (e.g. output evaluation).
    pub fn record_failure(&self, node: &str, pos: SourcePosition, error: Error) {
        self.failed(node, pos, error);
    }

    /// Failures in completion order.
    pub fn take_failures(&self) -> Vec<NodeFailure> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn state_snapshot(&self) -> RunState {
        self.state().clone()
    }

    pub fn timeline_snapshot(&self) -> ExecutionTimeline {
        self.timeline().clone()
    }

    /// Schedules a write of `state.json`.
    pub fn persist(&self) {
        self.state_dirty.notify_one();
    }

    /// Stops the state writer and writes the final `state.json`.
    pub async fn flush(&self) {
        self.writer_done.cancel();
        let writer = self
            .state_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("Run state writer failed: {}", e);
            }
        }
        save_snapshot(&self.state, &self.run_dir).await;
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        self.writer_done.cancel();
    }
}

/// Sole writer of `state.json`. Changes made while a write is in progress
/// are coalesced into the next write. Persistence is for inspection only,
/// so errors are logged and otherwise ignored.
async fn write_state(
    state: Arc<Mutex<RunState>>,
    dirty: Arc<Notify>,
    run_dir: PathBuf,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = dirty.notified() => {}
        }
        save_snapshot(&state, &run_dir).await;
    }
}

async fn save_snapshot(state: &Mutex<RunState>, run_dir: &Path) {
    let snapshot = state.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let run_dir = run_dir.to_path_buf();
    match tokio::task::spawn_blocking(move || snapshot.save(&run_dir)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to save run state: {}", e),
        Err(e) => warn!("Run state writer failed: {}", e),
    }
}

/// Where a scope instance lives within the run.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Path id prefix of the scope's nodes, empty or ending with `/`
    pub path: String,
    /// Directory for the scope's call directories
    pub dir: PathBuf,
    /// Caller-supplied values: workflow inputs by name, call input
    /// overrides as `call.input`
    pub inputs: Bindings<Value>,
}

impl Frame {
    pub fn root(dir: impl Into<PathBuf>, inputs: Bindings<Value>) -> Self {
        Self {
            path: String::new(),
            dir: dir.into(),
            inputs,
        }
    }

    pub fn node_path(&self, id: &str) -> String {
        format!("{}{}", self.path, id)
    }

    fn nested(&self, path: String, dir: PathBuf) -> Self {
        Self {
            path,
            dir,
            inputs: self.inputs.clone(),
        }
    }
}

/// Result of one dispatched node.
enum Outcome {
    Bound(Bindings<Value>),
    Section(SectionOutcome),
}

/// Runs every node of `scope` against the outer bindings `env`.
///
/// Returns the bindings produced by the scope's own nodes. A failure
/// inside the scope is recorded on the run context and surfaces here as
/// [`Error::Cancelled`] once in-flight nodes have drained.
pub fn run_scope(
    ctx: Arc<RunContext>,
    scope: Scope,
    env: Bindings<Value>,
    frame: Frame,
) -> BoxFuture<'static, Result<Bindings<Value>>> {
    async move {
        let nodes = scope.nodes();
        let graph = scope.graph();
        let total = nodes.len();

        let mut remaining: Vec<usize> = (0..total).map(|i| graph.dependency_count(i)).collect();
        let mut ready: VecDeque<usize> = (0..total).filter(|&i| remaining[i] == 0).collect();
        let mut sections: HashMap<String, Arc<SectionOutcome>> = HashMap::new();
        let mut running: JoinSet<(usize, Result<Outcome>)> = JoinSet::new();
        let mut env = env;
        let mut produced = Bindings::new();
        let mut finished = 0;
        let mut halted = false;

        debug!("{}scope: {} node(s)", frame.path, total);
        ctx.register(nodes.iter().map(|node| frame.node_path(&node.id())));

        loop {
            while !halted && !ctx.is_stopped() {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                let node = nodes[index].clone();
                let path = frame.node_path(&node.id());
                ctx.mark_ready(&path);

                let ctx = Arc::clone(&ctx);
                let env = env.clone();
                let frame = frame.clone();
                match node {
                    WorkflowNode::Decl(decl) => {
                        running.spawn(async move {
                            let result = run_decl(ctx, decl, env, frame, path).await;
                            (index, result.map(Outcome::Bound))
                        });
                    }
                    WorkflowNode::Assert(assertion) => {
                        running.spawn(async move {
                            let result = run_assertion(ctx, assertion, env, path).await;
                            (index, result.map(|()| Outcome::Bound(Bindings::new())))
                        });
                    }
                    WorkflowNode::Call(call) => {
                        running.spawn(async move {
                            let result = run_call(ctx, call, env, frame, path).await;
                            (index, result.map(Outcome::Bound))
                        });
                    }
                    WorkflowNode::Scatter(scatter) => {
                        running.spawn(async move {
                            let result = run_scatter(ctx, scatter, env, frame, path).await;
                            (index, result.map(Outcome::Section))
                        });
                    }
                    WorkflowNode::Conditional(conditional) => {
                        running.spawn(async move {
                            let result = run_conditional(ctx, conditional, env, frame, path).await;
                            (index, result.map(Outcome::Section))
                        });
                    }
                    WorkflowNode::Gather(gather) => {
                        let outcome = sections.get(&gather.section).cloned();
                        running.spawn(async move {
                            ctx.started(&path);
                            let result = match outcome {
                                Some(outcome) => Ok(Outcome::Bound(nodes::gather(&gather, &outcome))),
                                None => Err(Error::Internal(format!(
                                    "{} has no result for {}",
                                    gather.section, gather.name
                                ))),
                            };
                            (index, result)
                        });
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (index, result) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    halted = true;
                    ctx.failed(
                        &frame.node_path("scope"),
                        SourcePosition::default(),
                        Error::Internal(format!("node task aborted: {}", e)),
                    );
                    continue;
                }
            };

            let node = &nodes[index];
            let path = frame.node_path(&node.id());
            match result {
                Ok(Outcome::Bound(bindings)) => {
                    env = env.merge(&bindings);
                    produced = produced.merge(&bindings);
                    ctx.completed(&path, &bindings);
                }
                Ok(Outcome::Section(outcome)) => {
                    sections.insert(node.id(), Arc::new(outcome));
                    ctx.completed(&path, &Bindings::new());
                }
                Err(Error::Cancelled) => {
                    halted = true;
                    ctx.abandoned(&path);
                    continue;
                }
                Err(e) => {
                    halted = true;
                    ctx.failed(&path, node.pos(), e);
                    continue;
                }
            }

            finished += 1;
            for &dependent in graph.dependents_of(index) {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if halted {
            return Err(Error::Cancelled);
        }
        if finished < total {
            if ctx.is_stopped() {
                return Err(Error::Cancelled);
            }
            return Err(Error::Internal(format!(
                "{}scope stalled with {} of {} node(s) finished",
                frame.path, finished, total
            )));
        }
        Ok(produced)
    }
    .boxed()
}

async fn run_decl(
    ctx: Arc<RunContext>,
    decl: Arc<Decl>,
    env: Bindings<Value>,
    frame: Frame,
    path: String,
) -> Result<Bindings<Value>> {
    let _permit = ctx.permit().await?;
    ctx.started(&path);
    let value = nodes::evaluate_decl(&decl, &env, &frame.inputs)?;
    Ok(Bindings::new().bind(decl.name.clone(), value))
}

async fn run_assertion(
    ctx: Arc<RunContext>,
    assertion: Arc<Assertion>,
    env: Bindings<Value>,
    path: String,
) -> Result<()> {
    let _permit = ctx.permit().await?;
    ctx.started(&path);
    nodes::check_assertion(&assertion, &env)
}

/// Evaluates the collection once and runs one body instance per element.
async fn run_scatter(
    ctx: Arc<RunContext>,
    scatter: Arc<Scatter>,
    env: Bindings<Value>,
    frame: Frame,
    path: String,
) -> Result<SectionOutcome> {
    ctx.started(&path);
    let collection = scatter
        .expr
        .eval(&env, &StdLib::new())
        .map_err(|e| Error::runtime(&scatter.pos, e))?;
    let items = collection
        .as_array()
        .map_err(|e| Error::runtime(&scatter.pos, e))?
        .to_vec();
    info!("{}: scattering over {} element(s)", path, items.len());

    let id = scatter.id();
    let iterations = items.into_iter().enumerate().map(|(i, item)| {
        let frame = frame.nested(
            format!("{}/{}/", path, i),
            frame.dir.join(&id).join(i.to_string()),
        );
        let env = env.bind(scatter.variable.clone(), item);
        run_scope(Arc::clone(&ctx), scatter.scope().clone(), env, frame)
    });

    let mut results = Vec::new();
    for result in join_all(iterations).await {
        results.push(result?);
    }
    Ok(SectionOutcome::Scatter(results))
}

/// Evaluates the guard once and runs the body if it holds.
async fn run_conditional(
    ctx: Arc<RunContext>,
    conditional: Arc<Conditional>,
    env: Bindings<Value>,
    frame: Frame,
    path: String,
) -> Result<SectionOutcome> {
    ctx.started(&path);
    let guard = conditional
        .expr
        .eval(&env, &StdLib::new())
        .and_then(|value| value.as_bool())
        .map_err(|e| Error::runtime(&conditional.pos, e))?;
    if !guard {
        info!("{}: condition is false, skipping body", path);
        return Ok(SectionOutcome::Conditional(None));
    }

    let body_frame = frame.nested(format!("{}/", path), frame.dir.clone());
    let produced = run_scope(ctx, conditional.scope().clone(), env, body_frame).await?;
    Ok(SectionOutcome::Conditional(Some(produced)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::LocalBackend;
    use crate::value::Type;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path) -> Arc<RunContext> {
        let config = Config {
            max_concurrency: 2,
            ..Config::default()
        };
        Arc::new(RunContext::new(
            config,
            dir.to_path_buf(),
            Arc::new(LocalBackend::new()),
            RunState::new("test", "wf"),
            &CancellationToken::new(),
        ))
    }

    fn decl(name: &str, ty: Type, expr: &str) -> WorkflowNode {
        Decl::new(name, ty).with_expr(expr.parse().unwrap()).into()
    }

    #[tokio::test]
    async fn test_decl_chain() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let scope = Scope::build(&[
            decl("c", Type::Int, "b + 1"),
            decl("b", Type::Int, "a * 10"),
            decl("a", Type::Int, "1"),
        ])
        .unwrap();

        let produced = run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new()))
            .await
            .unwrap();
        assert_eq!(produced.get("c"), Some(&Value::Int(11)));
        assert_eq!(ctx.state_snapshot().status("decl-c"), Some(NodeStatus::Done));

        ctx.flush().await;
        let saved = RunState::load(dir.path()).unwrap();
        assert_eq!(saved.status("decl-a"), Some(NodeStatus::Done));
        assert_eq!(saved.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_state_writes_are_coalesced() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let body: Vec<WorkflowNode> = (0..200)
            .map(|i| decl(&format!("v{}", i), Type::Int, &i.to_string()))
            .collect();
        let scope = Scope::build(&body).unwrap();

        run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new()))
            .await
            .unwrap();
        ctx.flush().await;
        let saved = RunState::load(dir.path()).unwrap();
        assert_eq!(saved.counts().get(&NodeStatus::Done), Some(&200));

        ctx.persist();
        ctx.flush().await;
        assert!(!dir.path().join(".state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_nested_sections() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let pos = |line| SourcePosition::new("w.yaml", line, 1);
        let inner = Conditional::new(
            pos(3),
            "x > 1".parse().unwrap(),
            vec![decl("z", Type::Int, "x * 100")],
        )
        .unwrap();
        let scatter = Scatter::new(pos(2), "x", "[1, 2, 3]".parse().unwrap(), vec![inner.into()]).unwrap();
        let scope = Scope::build(&[scatter.into()]).unwrap();

        let produced = run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new()))
            .await
            .unwrap();
        assert_eq!(
            produced.get("z"),
            Some(&Value::Array(vec![Value::Null, Value::Int(200), Value::Int(300)]))
        );
        let state = ctx.state_snapshot();
        assert_eq!(state.status("scatter-L2C1/1/if-L3C1/decl-z"), Some(NodeStatus::Done));
        assert_eq!(state.status("scatter-L2C1/0/if-L3C1/decl-z"), None);
    }

    #[tokio::test]
    async fn test_failure_halts_scope() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let scope = Scope::build(&[
            decl("x", Type::Int, "0"),
            Assertion::new(SourcePosition::new("w.yaml", 2, 1), "x > 0".parse().unwrap()).into(),
            decl("y", Type::Int, "x + 1"),
        ])
        .unwrap();

        let result = run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new())).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        let failures = ctx.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node, "assert-L2C1");
        assert!(failures[0].error.is_runtime_error());
        assert!(ctx.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_run_dispatches_nothing() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let ctx = Arc::new(RunContext::new(
            Config::default(),
            dir.path().to_path_buf(),
            Arc::new(LocalBackend::new()),
            RunState::new("test", "wf"),
            &cancel,
        ));
        cancel.cancel();
        let scope = Scope::build(&[decl("a", Type::Int, "1")]).unwrap();
        let result = run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new())).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(ctx.state_snapshot().status("decl-a"), Some(NodeStatus::Pending));
        assert!(ctx.take_failures().is_empty());
    }

    #[tokio::test]
    async fn test_scatter_requires_array() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let scatter = Scatter::new(
            SourcePosition::new("w.yaml", 4, 1),
            "x",
            "5".parse().unwrap(),
            vec![decl("y", Type::Int, "x")],
        )
        .unwrap();
        let scope = Scope::build(&[scatter.into()]).unwrap();
        let result = run_scope(ctx.clone(), scope, Bindings::new(), Frame::root(dir.path(), Bindings::new())).await;
        assert!(result.is_err());
        let failures = ctx.take_failures();
        assert_eq!(failures[0].node, "scatter-L4C1");
        assert!(failures[0].error.is_runtime_error());
    }
}
