//! Dependency Resolver
//!
//! Computes, per workflow node, the names it reads and the names it
//! produces, and from those the dependency graph of one scope:
//!
//! - an edge `source -> target` exists when `target` reads a name that
//!   `source` produces
//! - a section's gathers depend on the section
//! - a call's `after` list adds edges from the named calls
//!
//! A name read but not produced in the scope comes from an enclosing scope
//! and adds no edge. The graph is static: one graph per scope, reused by
//! every scatter iteration.
//!
//! Cycles are rejected upstream; observing one here is an internal error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::debug;

use super::model::{WorkflowNode, WorkflowSection};
use crate::error::{Error, Result};

/// True if `read` refers to `name` or to a member of it (`name.left`,
/// `call.out` for a namespace `call`).
pub fn refers_to(read: &str, name: &str) -> bool {
    read == name
        || (read.len() > name.len()
            && read.starts_with(name)
            && read.as_bytes()[name.len()] == b'.')
}

/// Names the node must see bound before it can run.
pub fn reads(node: &WorkflowNode) -> Vec<String> {
    match node {
        WorkflowNode::Decl(decl) => decl
            .expr
            .as_ref()
            .map(|e| e.free_variables())
            .unwrap_or_default(),
        WorkflowNode::Assert(assertion) => assertion.expr.free_variables(),
        WorkflowNode::Call(call) => {
            let mut names = Vec::new();
            for expr in call.inputs.values() {
                for name in expr.free_variables() {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            names
        }
        WorkflowNode::Scatter(scatter) => {
            section_reads(scatter.expr.free_variables(), &**scatter, Some(scatter.variable.as_str()))
        }
        WorkflowNode::Conditional(conditional) => {
            section_reads(conditional.expr.free_variables(), &**conditional, None)
        }
        WorkflowNode::Gather(_) => Vec::new(),
    }
}

/// Reads of the section expression plus the body's reads that are not
/// satisfied inside the body.
fn section_reads(
    mut names: Vec<String>,
    section: &dyn WorkflowSection,
    variable: Option<&str>,
) -> Vec<String> {
    let bound: Vec<String> = section
        .scope()
        .nodes()
        .iter()
        .flat_map(produces)
        .chain(variable.map(str::to_string))
        .collect();
    for node in section.body() {
        for read in reads(node) {
            let internal = bound.iter().any(|name| refers_to(&read, name));
            if !internal && !names.contains(&read) {
                names.push(read);
            }
        }
    }
    names
}

/// Names bound in the enclosing scope when the node completes.
pub fn produces(node: &WorkflowNode) -> Vec<String> {
    match node {
        WorkflowNode::Decl(decl) => vec![decl.name.clone()],
        WorkflowNode::Call(call) => call
            .callee
            .output_types()
            .names()
            .into_iter()
            .map(|out| format!("{}.{}", call.name, out))
            .collect(),
        WorkflowNode::Gather(gather) => vec![gather.name.clone()],
        WorkflowNode::Assert(_) | WorkflowNode::Scatter(_) | WorkflowNode::Conditional(_) => {
            Vec::new()
        }
    }
}

/// Calls that must finish before the node starts, by call name.
fn after(node: &WorkflowNode) -> Vec<String> {
    match node {
        WorkflowNode::Call(call) => call.after.clone(),
        WorkflowNode::Scatter(_) | WorkflowNode::Conditional(_) => {
            let Some(section) = node.as_section() else {
                return Vec::new();
            };
            section
                .body()
                .iter()
                .flat_map(after)
                .filter(|name| {
                    !section
                        .body()
                        .iter()
                        .any(|n| matches!(n, WorkflowNode::Call(c) if &c.name == name))
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Directed acyclic graph over one scope's nodes, indexed by node position.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph and verifies it is acyclic (Kahn's algorithm).
    pub fn build(nodes: &[WorkflowNode]) -> Result<Self> {
        let ids: Vec<String> = nodes.iter().map(WorkflowNode::id).collect();
        let mut index = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(Error::Validation(format!("duplicate workflow node id: {}", id)));
            }
        }

        let mut producers: HashMap<String, usize> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for name in produces(node) {
                producers.insert(name, i);
            }
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (target, node) in nodes.iter().enumerate() {
            let mut sources = Vec::new();
            for read in reads(node) {
                // `a.b.c` may be produced as `a.b.c`, `a.b` or `a`
                let mut candidate = read.as_str();
                loop {
                    if let Some(&source) = producers.get(candidate) {
                        sources.push(source);
                        break;
                    }
                    match candidate.rfind('.') {
                        Some(dot) => candidate = &candidate[..dot],
                        None => break,
                    }
                }
            }
            if let WorkflowNode::Gather(gather) = node {
                if let Some(&section) = index.get(&gather.section) {
                    sources.push(section);
                }
            }
            for call in after(node) {
                if let Some(&source) = index.get(&format!("call-{}", call)) {
                    sources.push(source);
                }
            }
            sources.retain(|&s| s != target);
            sources.sort_unstable();
            sources.dedup();
            dependencies[target] = sources;
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (target, sources) in dependencies.iter().enumerate() {
            for &source in sources {
                dependents[source].push(target);
            }
        }

        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != nodes.len() {
            let stuck: Vec<&str> = (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| ids[i].as_str())
                .collect();
            return Err(Error::Internal(format!(
                "dependency cycle among {}",
                stuck.join(", ")
            )));
        }

        debug!(
            "Dependency graph: {} nodes, {} edges",
            nodes.len(),
            dependencies.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn lookup(&self, indices: &[usize]) -> Vec<&str> {
        indices.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Ids of the nodes `id` waits for.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.lookup(&self.dependencies[i]))
            .unwrap_or_default()
    }

    /// Ids of the nodes waiting for `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.lookup(&self.dependents[i]))
            .unwrap_or_default()
    }

    /// Nodes with no in-scope dependencies.
    pub fn roots(&self) -> Vec<&str> {
        (0..self.ids.len())
            .filter(|&i| self.dependencies[i].is_empty())
            .map(|i| self.ids[i].as_str())
            .collect()
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.lookup(&self.order)
    }

    pub(crate) fn dependency_count(&self, node: usize) -> usize {
        self.dependencies[node].len()
    }

    pub(crate) fn dependents_of(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }
}

struct ScopeInner {
    nodes: Vec<WorkflowNode>,
    graph: DependencyGraph,
}

/// One schedulable scope: a body plus the gathers of its sections, with
/// the dependency graph over them. Cheap to clone.
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl Scope {
    pub fn build(body: &[WorkflowNode]) -> Result<Self> {
        let mut nodes = body.to_vec();
        for node in body {
            if let Some(section) = node.as_section() {
                nodes.extend(section.gathers().iter().cloned().map(WorkflowNode::Gather));
            }
        }
        let graph = DependencyGraph::build(&nodes)?;
        Ok(Scope(Arc::new(ScopeInner { nodes, graph })))
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.0.nodes
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.0.graph
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope(Arc::new(ScopeInner {
            nodes: Vec::new(),
            graph: DependencyGraph::default(),
        }))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("nodes", &self.0.graph.ids)
            .finish()
    }
}
