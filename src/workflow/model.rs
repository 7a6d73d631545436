//! Workflow Data Model
//!
//! In-memory node graph of a validated document: tasks, workflows and the
//! nodes of a workflow body.
//!
//! A workflow body is an ordered list of [`WorkflowNode`]s. Scatter and
//! conditional sections own nested bodies; each name declared inside a
//! section is exposed to the enclosing scope through a synthetic
//! [`Gather`] node with a promoted type:
//!
//! ```text
//! scatter (x in [1, 2, 3]) {      # scatter-L2C1
//!     Int y = x * 2               # decl-y      (inside: Int)
//! }                               # gather-y    (outside: Array[Int])
//! if (flag) {                     # if-L5C1
//!     call align                  # call-align  (inside: align.bam : File)
//! }                               # gather-align.bam (outside: File?)
//! ```
//!
//! Nodes are immutable once constructed; section constructors compute their
//! gathers and the dependency graph of their body up front.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::dependencies::Scope;
use crate::env::Bindings;
use crate::error::{Result, SourcePosition};
use crate::expr::Expr;
use crate::value::Type;

/// A declaration: `Type name = expr`.
///
/// Input declarations may omit the expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decl {
    #[serde(default)]
    pub pos: SourcePosition,
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
}

impl Decl {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            pos: SourcePosition::default(),
            name: name.into(),
            ty,
            expr: None,
        }
    }

    pub fn with_expr(mut self, expr: Expr) -> Self {
        self.expr = Some(expr);
        self
    }

    pub fn at(mut self, pos: SourcePosition) -> Self {
        self.pos = pos;
        self
    }

    pub fn id(&self) -> String {
        format!("decl-{}", self.name)
    }

    /// An input that must be supplied by the caller.
    pub fn is_required_input(&self) -> bool {
        self.expr.is_none() && !self.ty.is_optional()
    }
}

/// A boolean precondition: `assert expr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(default)]
    pub pos: SourcePosition,
    pub expr: Expr,
}

impl Assertion {
    pub fn new(pos: SourcePosition, expr: Expr) -> Self {
        Self { pos, expr }
    }

    pub fn id(&self) -> String {
        format!("assert-L{}C{}", self.pos.line, self.pos.column)
    }
}

/// A leaf unit of work with a command template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub pos: SourcePosition,
    #[serde(default)]
    pub inputs: Vec<Decl>,
    /// Declarations evaluated after the inputs, before the command
    #[serde(default)]
    pub postinputs: Vec<Decl>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    /// Command text with `~{expr}` placeholders
    pub command: String,
    #[serde(default)]
    pub outputs: Vec<Decl>,
    /// Runtime attributes (`docker`, `cpu`, `memory`, `maxRetries`, `timeout`)
    #[serde(default)]
    pub runtime: IndexMap<String, Expr>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pos: SourcePosition::default(),
            inputs: Vec::new(),
            postinputs: Vec::new(),
            assertions: Vec::new(),
            command: command.into(),
            outputs: Vec::new(),
            runtime: IndexMap::new(),
        }
    }

    pub fn with_input(mut self, decl: Decl) -> Self {
        self.inputs.push(decl);
        self
    }

    pub fn with_output(mut self, decl: Decl) -> Self {
        self.outputs.push(decl);
        self
    }

    pub fn with_runtime(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.runtime.insert(key.into(), expr);
        self
    }

    pub fn available_inputs(&self) -> Bindings<Type> {
        self.inputs
            .iter()
            .map(|d| (d.name.clone(), d.ty.clone()))
            .collect()
    }

    pub fn required_inputs(&self) -> Bindings<Type> {
        self.inputs
            .iter()
            .filter(|d| d.is_required_input())
            .map(|d| (d.name.clone(), d.ty.clone()))
            .collect()
    }

    pub fn output_types(&self) -> Bindings<Type> {
        self.outputs
            .iter()
            .map(|d| (d.name.clone(), d.ty.clone()))
            .collect()
    }
}

/// The task or sub-workflow invoked by a call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Task(Arc<Task>),
    Workflow(Arc<Workflow>),
}

impl Callee {
    pub fn name(&self) -> &str {
        match self {
            Callee::Task(task) => &task.name,
            Callee::Workflow(workflow) => &workflow.name,
        }
    }

    /// Declared inputs, in declaration order.
    pub fn inputs(&self) -> &[Decl] {
        match self {
            Callee::Task(task) => &task.inputs,
            Callee::Workflow(workflow) => &workflow.inputs,
        }
    }

    pub fn output_types(&self) -> Bindings<Type> {
        match self {
            Callee::Task(task) => task.output_types(),
            Callee::Workflow(workflow) => workflow.output_types(),
        }
    }
}

/// Invocation of a task or sub-workflow.
#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub pos: SourcePosition,
    /// Alias, or the callee's name
    pub name: String,
    pub callee: Callee,
    /// Bound inputs; omitted inputs fall back to run inputs, then defaults
    pub inputs: IndexMap<String, Expr>,
    /// Calls that must complete first even without a data dependency
    pub after: Vec<String>,
}

impl Call {
    pub fn new(name: impl Into<String>, callee: Callee) -> Self {
        Self {
            pos: SourcePosition::default(),
            name: name.into(),
            callee,
            inputs: IndexMap::new(),
            after: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.inputs.insert(name.into(), expr);
        self
    }

    pub fn after(mut self, call: impl Into<String>) -> Self {
        self.after.push(call.into());
        self
    }

    pub fn at(mut self, pos: SourcePosition) -> Self {
        self.pos = pos;
        self
    }

    pub fn id(&self) -> String {
        format!("call-{}", self.name)
    }

    /// Callee inputs left unbound at this call site, as `call.input`.
    fn unbound_inputs(&self) -> impl Iterator<Item = &Decl> {
        self.callee
            .inputs()
            .iter()
            .filter(|d| !self.inputs.contains_key(&d.name))
    }
}

/// Synthetic node exposing a section body's name to the enclosing scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gather {
    /// Id of the owning section node
    pub section: String,
    /// Name as bound inside the body (and re-exposed outside)
    pub name: String,
    /// Promoted type: `Array[T]` for scatters, `T?` for conditionals
    pub ty: Type,
    /// Id of the body node producing the name
    pub referee: String,
}

impl Gather {
    pub fn id(&self) -> String {
        format!("gather-{}", self.name)
    }
}

/// A section with a nested, recursively scheduled body.
pub trait WorkflowSection {
    fn body(&self) -> &[WorkflowNode];
    fn gathers(&self) -> &[Arc<Gather>];
    /// Dependency graph of the body, computed once at construction.
    fn scope(&self) -> &Scope;
}

/// `scatter (variable in expr) { body }`
#[derive(Debug, Clone, Serialize)]
pub struct Scatter {
    pub pos: SourcePosition,
    pub variable: String,
    pub expr: Expr,
    pub body: Vec<WorkflowNode>,
    pub gathers: Vec<Arc<Gather>>,
    #[serde(skip)]
    scope: Scope,
}

impl Scatter {
    pub fn new(
        pos: SourcePosition,
        variable: impl Into<String>,
        expr: Expr,
        body: Vec<WorkflowNode>,
    ) -> Result<Self> {
        let id = section_id("scatter", &pos);
        let gathers = gathers_of(&id, &body, Type::array_of);
        let scope = Scope::build(&body)?;
        Ok(Self {
            pos,
            variable: variable.into(),
            expr,
            body,
            gathers,
            scope,
        })
    }

    pub fn id(&self) -> String {
        section_id("scatter", &self.pos)
    }
}

impl WorkflowSection for Scatter {
    fn body(&self) -> &[WorkflowNode] {
        &self.body
    }

    fn gathers(&self) -> &[Arc<Gather>] {
        &self.gathers
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// `if (expr) { body }`
#[derive(Debug, Clone, Serialize)]
pub struct Conditional {
    pub pos: SourcePosition,
    pub expr: Expr,
    pub body: Vec<WorkflowNode>,
    pub gathers: Vec<Arc<Gather>>,
    #[serde(skip)]
    scope: Scope,
}

impl Conditional {
    pub fn new(pos: SourcePosition, expr: Expr, body: Vec<WorkflowNode>) -> Result<Self> {
        let id = section_id("if", &pos);
        let gathers = gathers_of(&id, &body, Type::optional_of);
        let scope = Scope::build(&body)?;
        Ok(Self {
            pos,
            expr,
            body,
            gathers,
            scope,
        })
    }

    pub fn id(&self) -> String {
        section_id("if", &self.pos)
    }
}

impl WorkflowSection for Conditional {
    fn body(&self) -> &[WorkflowNode] {
        &self.body
    }

    fn gathers(&self) -> &[Arc<Gather>] {
        &self.gathers
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }
}

fn section_id(kind: &str, pos: &SourcePosition) -> String {
    format!("{}-L{}C{}", kind, pos.line, pos.column)
}

fn gathers_of(section: &str, body: &[WorkflowNode], promote: fn(Type) -> Type) -> Vec<Arc<Gather>> {
    body.iter()
        .flat_map(|node| {
            let referee = node.id();
            node.produced_types()
                .into_iter()
                .map(move |(name, ty)| {
                    Arc::new(Gather {
                        section: section.to_string(),
                        name,
                        ty: promote(ty),
                        referee: referee.clone(),
                    })
                })
        })
        .collect()
}

/// A node of a workflow body.
///
/// The variant is the node's kind; the scheduler dispatches on it with a
/// single `match`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowNode {
    Decl(Arc<Decl>),
    Assert(Arc<Assertion>),
    Call(Arc<Call>),
    Scatter(Arc<Scatter>),
    Conditional(Arc<Conditional>),
    Gather(Arc<Gather>),
}

impl WorkflowNode {
    /// Id unique within the enclosing scope.
    pub fn id(&self) -> String {
        match self {
            WorkflowNode::Decl(decl) => decl.id(),
            WorkflowNode::Assert(assertion) => assertion.id(),
            WorkflowNode::Call(call) => call.id(),
            WorkflowNode::Scatter(scatter) => scatter.id(),
            WorkflowNode::Conditional(conditional) => conditional.id(),
            WorkflowNode::Gather(gather) => gather.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowNode::Decl(_) => "decl",
            WorkflowNode::Assert(_) => "assert",
            WorkflowNode::Call(_) => "call",
            WorkflowNode::Scatter(_) => "scatter",
            WorkflowNode::Conditional(_) => "conditional",
            WorkflowNode::Gather(_) => "gather",
        }
    }

    /// Source position; gathers have none of their own.
    pub fn pos(&self) -> SourcePosition {
        match self {
            WorkflowNode::Decl(decl) => decl.pos.clone(),
            WorkflowNode::Assert(assertion) => assertion.pos.clone(),
            WorkflowNode::Call(call) => call.pos.clone(),
            WorkflowNode::Scatter(scatter) => scatter.pos.clone(),
            WorkflowNode::Conditional(conditional) => conditional.pos.clone(),
            WorkflowNode::Gather(_) => SourcePosition::default(),
        }
    }

    /// The section interface of scatter and conditional nodes.
    pub fn as_section(&self) -> Option<&dyn WorkflowSection> {
        match self {
            WorkflowNode::Scatter(scatter) => Some(&**scatter),
            WorkflowNode::Conditional(conditional) => Some(&**conditional),
            _ => None,
        }
    }

    /// Names bound in the enclosing scope when this node completes, with
    /// their types. Sections bind nothing themselves; their gathers do.
    pub fn produced_types(&self) -> Vec<(String, Type)> {
        match self {
            WorkflowNode::Decl(decl) => vec![(decl.name.clone(), decl.ty.clone())],
            WorkflowNode::Call(call) => call
                .callee
                .output_types()
                .wrap_namespace(&call.name)
                .to_pairs(),
            WorkflowNode::Gather(gather) => vec![(gather.name.clone(), gather.ty.clone())],
            WorkflowNode::Scatter(scatter) => gathered_types(&scatter.gathers),
            WorkflowNode::Conditional(conditional) => gathered_types(&conditional.gathers),
            WorkflowNode::Assert(_) => Vec::new(),
        }
    }
}

/// Sections report their gathers' names for the purpose of computing an
/// enclosing section's gathers; those names are bound by the gather nodes.
fn gathered_types(gathers: &[Arc<Gather>]) -> Vec<(String, Type)> {
    gathers.iter().map(|g| (g.name.clone(), g.ty.clone())).collect()
}

impl fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.pos())
    }
}

impl From<Decl> for WorkflowNode {
    fn from(decl: Decl) -> Self {
        WorkflowNode::Decl(Arc::new(decl))
    }
}

impl From<Assertion> for WorkflowNode {
    fn from(assertion: Assertion) -> Self {
        WorkflowNode::Assert(Arc::new(assertion))
    }
}

impl From<Call> for WorkflowNode {
    fn from(call: Call) -> Self {
        WorkflowNode::Call(Arc::new(call))
    }
}

impl From<Scatter> for WorkflowNode {
    fn from(scatter: Scatter) -> Self {
        WorkflowNode::Scatter(Arc::new(scatter))
    }
}

impl From<Conditional> for WorkflowNode {
    fn from(conditional: Conditional) -> Self {
        WorkflowNode::Conditional(Arc::new(conditional))
    }
}

/// A named graph of declarations, calls and sections.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub name: String,
    pub pos: SourcePosition,
    pub inputs: Vec<Decl>,
    pub body: Vec<WorkflowNode>,
    /// Explicit output section; `None` exposes every top-level binding
    pub outputs: Option<Vec<Decl>>,
    #[serde(skip)]
    scope: Scope,
}

impl Workflow {
    /// Builds a workflow, computing the dependency graph of its top-level
    /// scope (input declarations plus body).
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<Decl>,
        body: Vec<WorkflowNode>,
        outputs: Option<Vec<Decl>>,
    ) -> Result<Self> {
        let nodes: Vec<WorkflowNode> = inputs
            .iter()
            .cloned()
            .map(WorkflowNode::from)
            .chain(body.iter().cloned())
            .collect();
        let scope = Scope::build(&nodes)?;
        Ok(Self {
            name: name.into(),
            pos: SourcePosition::default(),
            inputs,
            body,
            outputs,
            scope,
        })
    }

    pub fn at(mut self, pos: SourcePosition) -> Self {
        self.pos = pos;
        self
    }

    /// Top-level scope: inputs, body and the gathers of top-level sections.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Every call in the body, including those nested in sections.
    pub fn calls(&self) -> Vec<&Arc<Call>> {
        fn collect<'a>(nodes: &'a [WorkflowNode], out: &mut Vec<&'a Arc<Call>>) {
            for node in nodes {
                match node {
                    WorkflowNode::Call(call) => out.push(call),
                    WorkflowNode::Scatter(scatter) => collect(&scatter.body, out),
                    WorkflowNode::Conditional(conditional) => collect(&conditional.body, out),
                    _ => {}
                }
            }
        }
        let mut calls = Vec::new();
        collect(&self.body, &mut calls);
        calls
    }

    /// Workflow inputs plus `call.input` for every call input left unbound.
    pub fn available_inputs(&self) -> Bindings<Type> {
        let mut available: Bindings<Type> = self
            .inputs
            .iter()
            .map(|d| (d.name.clone(), d.ty.clone()))
            .collect();
        for call in self.calls() {
            for decl in call.unbound_inputs() {
                available = available.bind(format!("{}.{}", call.name, decl.name), decl.ty.clone());
            }
        }
        available
    }

    /// Inputs the caller must supply, including required call inputs left
    /// unbound in the body.
    pub fn required_inputs(&self) -> Bindings<Type> {
        let mut required: Bindings<Type> = self
            .inputs
            .iter()
            .filter(|d| d.is_required_input())
            .map(|d| (d.name.clone(), d.ty.clone()))
            .collect();
        for call in self.calls() {
            for decl in call.unbound_inputs().filter(|d| d.is_required_input()) {
                required = required.bind(format!("{}.{}", call.name, decl.name), decl.ty.clone());
            }
        }
        required
    }

    /// Types of the workflow's outputs: the output section if declared,
    /// otherwise every name bound by the top-level body.
    pub fn output_types(&self) -> Bindings<Type> {
        match &self.outputs {
            Some(outputs) => outputs
                .iter()
                .map(|d| (d.name.clone(), d.ty.clone()))
                .collect(),
            None => self
                .scope
                .nodes()
                .iter()
                .filter(|node| !self.is_input_node(node))
                .filter(|node| node.as_section().is_none())
                .flat_map(|node| node.produced_types())
                .collect(),
        }
    }

    fn is_input_node(&self, node: &WorkflowNode) -> bool {
        matches!(node, WorkflowNode::Decl(decl) if self.inputs.iter().any(|i| i.name == decl.name))
    }
}

/// The unit a run executes.
#[derive(Debug, Clone)]
pub enum Target {
    Task(Arc<Task>),
    Workflow(Arc<Workflow>),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Task(task) => &task.name,
            Target::Workflow(workflow) => &workflow.name,
        }
    }

    pub fn available_inputs(&self) -> Bindings<Type> {
        match self {
            Target::Task(task) => task.available_inputs(),
            Target::Workflow(workflow) => workflow.available_inputs(),
        }
    }

    pub fn required_inputs(&self) -> Bindings<Type> {
        match self {
            Target::Task(task) => task.required_inputs(),
            Target::Workflow(workflow) => workflow.required_inputs(),
        }
    }

    pub fn output_types(&self) -> Bindings<Type> {
        match self {
            Target::Task(task) => task.output_types(),
            Target::Workflow(workflow) => workflow.output_types(),
        }
    }
}
