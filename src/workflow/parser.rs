//! Document Loader
//!
//! Loads a serialized workflow document (YAML, or JSON as a YAML subset)
//! into the in-memory node graph. The document carries expressions as WDL
//! source strings; string literals must therefore be quoted inside the
//! YAML string.
//!
//! ```yaml
//! imports:
//!   - uri: lib.yaml
//!     as: lib
//! tasks:
//!   - name: double
//!     inputs:
//!       - { name: x, type: Int }
//!     command: "echo $(( ~{x} * 2 ))"
//!     outputs:
//!       - { name: y, type: Int, expr: "read_int(stdout())" }
//!     runtime:
//!       docker: '"ubuntu:22.04"'
//! workflow:
//!   name: wf
//!   inputs:
//!     - { name: xs, type: "Array[Int]" }
//!   body:
//!     - scatter:
//!         variable: x
//!         expr: xs
//!         body:
//!           - call: { callee: double, inputs: { x: x } }
//!     - if:
//!         expr: "length(xs) > 2"
//!         body:
//!           - decl: { name: note, type: String, expr: '"long"' }
//!   outputs:
//!     - { name: ys, type: "Array[Int]", expr: double.y }
//! ```
//!
//! Body items carry exactly one of `decl`, `assert`, `call`, `scatter` or
//! `if`. Documents have no line information of their own, so every task,
//! declaration and body item is given a position `uri:N:1` where `N` is its
//! ordinal in the document.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info};
use serde::Deserialize;

use super::model::{
    Assertion, Call, Callee, Conditional, Decl, Scatter, Target, Task, Workflow, WorkflowNode,
};
use crate::error::{Error, Result, SourcePosition};
use crate::expr::Expr;

/// Maximum nesting of imports.
const MAX_IMPORT_DEPTH: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DocumentSpec {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    imports: Vec<ImportSpec>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    workflow: Option<WorkflowSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportSpec {
    uri: String,
    #[serde(default, rename = "as")]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowSpec {
    name: String,
    #[serde(default)]
    inputs: Vec<Decl>,
    #[serde(default)]
    body: Vec<NodeSpec>,
    #[serde(default)]
    outputs: Option<Vec<Decl>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeSpec {
    decl: Option<Decl>,
    assert: Option<Expr>,
    call: Option<CallSpec>,
    scatter: Option<ScatterSpec>,
    #[serde(rename = "if")]
    conditional: Option<ConditionalSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallSpec {
    callee: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    inputs: IndexMap<String, Expr>,
    #[serde(default)]
    after: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScatterSpec {
    variable: String,
    expr: Expr,
    #[serde(default)]
    body: Vec<NodeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionalSpec {
    expr: Expr,
    #[serde(default)]
    body: Vec<NodeSpec>,
}

/// An imported document, reachable as `namespace.name`.
#[derive(Debug, Clone)]
pub struct Import {
    pub namespace: String,
    pub uri: String,
    pub document: Document,
}

/// A loaded document: its tasks, its optional workflow and its imports.
#[derive(Debug, Clone)]
pub struct Document {
    pub uri: String,
    pub version: Option<String>,
    pub tasks: Vec<Arc<Task>>,
    pub workflow: Option<Arc<Workflow>>,
    pub imports: Vec<Import>,
}

impl Document {
    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Selects what to run: the named task or workflow, else the
    /// document's workflow, else its only task.
    pub fn target(&self, name: Option<&str>) -> Result<Target> {
        match name {
            Some(name) => {
                if let Some(workflow) = self.workflow.as_ref().filter(|w| w.name == name) {
                    return Ok(Target::Workflow(workflow.clone()));
                }
                self.task(name)
                    .map(|task| Target::Task(task.clone()))
                    .ok_or_else(|| Error::Validation(format!("no task or workflow named {}", name)))
            }
            None => match (&self.workflow, self.tasks.as_slice()) {
                (Some(workflow), _) => Ok(Target::Workflow(workflow.clone())),
                (None, [task]) => Ok(Target::Task(task.clone())),
                (None, []) => Err(Error::Validation(format!("{}: document is empty", self.uri))),
                (None, _) => Err(Error::Validation(format!(
                    "{}: document has several tasks and no workflow; name the one to run",
                    self.uri
                ))),
            },
        }
    }

    /// Resolves a callee name: a local task, or `namespace.name` for a task
    /// or workflow of an import.
    fn callee(&self, name: &str) -> Option<Callee> {
        if let Some(task) = self.task(name) {
            return Some(Callee::Task(task.clone()));
        }
        let (namespace, rest) = name.split_once('.')?;
        let import = self.imports.iter().find(|i| i.namespace == namespace)?;
        if let Some(workflow) = import.document.workflow.as_ref().filter(|w| w.name == rest) {
            return Some(Callee::Workflow(workflow.clone()));
        }
        import.document.callee(rest)
    }
}

/// Reads and loads a document from a file.
pub fn load_document(path: impl AsRef<Path>) -> Result<Document> {
    let path = path.as_ref();
    info!("Loading document from: {}", path.display());
    let source = fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("failed to read {}: {}", path.display(), e)))?;
    load_at(&source, &path.to_string_lossy(), 0)
}

/// Loads a document from source text. Imports are resolved relative to
/// the directory of `uri`.
pub fn parse_document(source: &str, uri: &str) -> Result<Document> {
    load_at(source, uri, 0)
}

fn load_at(source: &str, uri: &str, depth: usize) -> Result<Document> {
    let spec: DocumentSpec = serde_yaml::from_str(source)
        .map_err(|e| Error::Validation(format!("{}: {}", uri, e)))?;
    debug!("Parsed document {} ({} bytes)", uri, source.len());

    let mut imports = Vec::new();
    for import in spec.imports {
        if depth >= MAX_IMPORT_DEPTH {
            return Err(Error::Validation(format!(
                "{}: imports nested deeper than {}",
                uri, MAX_IMPORT_DEPTH
            )));
        }
        let path = Path::new(uri)
            .parent()
            .map(|dir| dir.join(&import.uri))
            .unwrap_or_else(|| import.uri.clone().into());
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::Validation(format!("{}: failed to import {}: {}", uri, path.display(), e))
        })?;
        let namespace = match import.namespace {
            Some(namespace) => namespace,
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| Error::Validation(format!("{}: bad import uri {}", uri, import.uri)))?,
        };
        let document = load_at(&text, &path.to_string_lossy(), depth + 1)?;
        imports.push(Import {
            namespace,
            uri: import.uri,
            document,
        });
    }

    let mut builder = Builder { uri, ordinal: 0 };
    let mut tasks: Vec<Arc<Task>> = Vec::new();
    for task in spec.tasks {
        if tasks.iter().any(|t| t.name == task.name) {
            return Err(Error::Validation(format!("{}: duplicate task {}", uri, task.name)));
        }
        tasks.push(Arc::new(builder.task(task)?));
    }

    let mut document = Document {
        uri: uri.to_string(),
        version: spec.version,
        tasks,
        workflow: None,
        imports,
    };
    if let Some(workflow) = spec.workflow {
        let workflow = builder.workflow(workflow, &document)?;
        info!(
            "Loaded workflow {} ({} calls, {} tasks)",
            workflow.name,
            workflow.calls().len(),
            document.tasks.len()
        );
        document.workflow = Some(Arc::new(workflow));
    }
    Ok(document)
}

/// A cycle found while building a section's graph is a document error.
fn rejected(pos: &SourcePosition, error: Error) -> Error {
    match error {
        Error::Internal(message) => Error::Validation(format!("{}: {}", pos, message)),
        other => other,
    }
}

struct Builder<'a> {
    uri: &'a str,
    ordinal: u32,
}

impl Builder<'_> {
    fn next_pos(&mut self) -> SourcePosition {
        self.ordinal += 1;
        SourcePosition::new(self.uri, self.ordinal, 1)
    }

    fn decl(&mut self, decl: Decl) -> Decl {
        let pos = self.next_pos();
        decl.at(pos)
    }

    fn task(&mut self, mut task: Task) -> Result<Task> {
        task.pos = self.next_pos();
        Expr::template(&task.command)
            .map_err(|e| Error::Validation(format!("{}: task {}: command: {}", task.pos, task.name, e)))?;
        task.inputs = task.inputs.into_iter().map(|d| self.decl(d)).collect();
        task.postinputs = task.postinputs.into_iter().map(|d| self.decl(d)).collect();
        task.outputs = task.outputs.into_iter().map(|d| self.decl(d)).collect();
        for assertion in &mut task.assertions {
            assertion.pos = self.next_pos();
        }
        Ok(task)
    }

    fn workflow(&mut self, spec: WorkflowSpec, document: &Document) -> Result<Workflow> {
        let pos = self.next_pos();
        let inputs: Vec<Decl> = spec.inputs.into_iter().map(|d| self.decl(d)).collect();
        let body = self.body(spec.body, document)?;
        let outputs = spec
            .outputs
            .map(|outputs| outputs.into_iter().map(|d| self.decl(d)).collect());

        let workflow = Workflow::new(spec.name, inputs, body, outputs)
            .map_err(|e| rejected(&pos, e))?
            .at(pos);

        let names: HashSet<&str> = workflow.calls().iter().map(|c| c.name.as_str()).collect();
        for call in workflow.calls() {
            if let Some(missing) = call.after.iter().find(|a| !names.contains(a.as_str())) {
                return Err(Error::Validation(format!(
                    "{}: call {} waits for unknown call {}",
                    call.pos, call.name, missing
                )));
            }
        }
        Ok(workflow)
    }

    fn body(&mut self, specs: Vec<NodeSpec>, document: &Document) -> Result<Vec<WorkflowNode>> {
        specs.into_iter().map(|spec| self.node(spec, document)).collect()
    }

    fn node(&mut self, spec: NodeSpec, document: &Document) -> Result<WorkflowNode> {
        let pos = self.next_pos();
        let NodeSpec {
            decl,
            assert,
            call,
            scatter,
            conditional,
        } = spec;
        let present = [
            decl.is_some(),
            assert.is_some(),
            call.is_some(),
            scatter.is_some(),
            conditional.is_some(),
        ];
        if present.iter().filter(|&&p| p).count() != 1 {
            return Err(Error::Validation(format!(
                "{}: body item must have exactly one of decl, assert, call, scatter, if",
                pos
            )));
        }

        if let Some(decl) = decl {
            return Ok(decl.at(pos).into());
        }
        if let Some(expr) = assert {
            return Ok(Assertion::new(pos, expr).into());
        }
        if let Some(call) = call {
            let callee = document.callee(&call.callee).ok_or_else(|| {
                Error::Validation(format!("{}: unknown task or workflow {}", pos, call.callee))
            })?;
            if let Some(unknown) = call
                .inputs
                .keys()
                .find(|name| !callee.inputs().iter().any(|d| &d.name == *name))
            {
                return Err(Error::Validation(format!(
                    "{}: {} has no input {}",
                    pos,
                    callee.name(),
                    unknown
                )));
            }
            let name = call
                .alias
                .unwrap_or_else(|| call.callee.rsplit('.').next().unwrap_or_default().to_string());
            let mut node = Call::new(name, callee).at(pos);
            node.inputs = call.inputs;
            node.after = call.after;
            return Ok(node.into());
        }
        if let Some(scatter) = scatter {
            let body = self.body(scatter.body, document)?;
            return Scatter::new(pos.clone(), scatter.variable, scatter.expr, body)
                .map(WorkflowNode::from)
                .map_err(|e| rejected(&pos, e));
        }
        match conditional {
            Some(conditional) => {
                let body = self.body(conditional.body, document)?;
                Conditional::new(pos.clone(), conditional.expr, body)
                    .map(WorkflowNode::from)
                    .map_err(|e| rejected(&pos, e))
            }
            None => Err(Error::Internal(format!("{}: empty body item", pos))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;
    use tempfile::tempdir;

    const DOCUMENT: &str = r#"
tasks:
  - name: double
    inputs:
      - { name: x, type: Int }
    command: "echo $(( ~{x} * 2 ))"
    outputs:
      - { name: y, type: Int, expr: "read_int(stdout())" }
workflow:
  name: wf
  inputs:
    - { name: xs, type: "Array[Int]" }
  body:
    - scatter:
        variable: x
        expr: xs
        body:
          - call: { callee: double, inputs: { x: x } }
    - if:
        expr: "length(xs) > 2"
        body:
          - decl: { name: note, type: String, expr: '"long"' }
    - assert: "length(xs) > 0"
  outputs:
    - { name: ys, type: "Array[Int]", expr: double.y }
"#;

    #[test]
    fn test_parse_document() {
        let document = parse_document(DOCUMENT, "wf.yaml").unwrap();
        assert_eq!(document.tasks.len(), 1);
        let workflow = document.workflow.as_ref().unwrap();
        assert_eq!(workflow.body.len(), 3);
        assert_eq!(workflow.calls().len(), 1);
        assert_eq!(workflow.body[0].id(), "scatter-L6C1");
        assert_eq!(workflow.body[2].kind(), "assert");

        let ids: Vec<&str> = workflow.scope().graph().topological_order();
        assert!(ids.contains(&"gather-double.y"));
        assert!(ids.contains(&"gather-note"));
        assert_eq!(
            workflow.output_types().get("ys"),
            Some(&Type::array_of(Type::Int))
        );
    }

    #[test]
    fn test_target_selection() {
        let document = parse_document(DOCUMENT, "wf.yaml").unwrap();
        assert!(matches!(document.target(None).unwrap(), Target::Workflow(_)));
        assert!(matches!(document.target(Some("double")).unwrap(), Target::Task(_)));
        assert!(document.target(Some("missing")).is_err());
    }

    #[test]
    fn test_unknown_callee_and_input() {
        let doc = "workflow:\n  name: wf\n  body:\n    - call: { callee: nope }\n";
        assert!(matches!(parse_document(doc, "x.yaml"), Err(Error::Validation(_))));

        let doc = r#"
tasks:
  - { name: t, command: "true", inputs: [{ name: a, type: Int }] }
workflow:
  name: wf
  body:
    - call: { callee: t, inputs: { b: "1" } }
"#;
        let err = parse_document(doc, "x.yaml").unwrap_err();
        assert!(err.to_string().contains("has no input b"));
    }

    #[test]
    fn test_body_item_needs_one_kind() {
        let doc = "workflow:\n  name: wf\n  body:\n    - {}\n";
        assert!(matches!(parse_document(doc, "x.yaml"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_cycle_is_validation_error() {
        let doc = r#"
workflow:
  name: wf
  body:
    - decl: { name: a, type: Int, expr: "b + 1" }
    - decl: { name: b, type: Int, expr: "a + 1" }
"#;
        let err = parse_document(doc, "x.yaml").unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_bad_command_template() {
        let doc = "tasks:\n  - { name: t, command: \"echo ~{x\" }\n";
        assert!(matches!(parse_document(doc, "x.yaml"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_imports_and_sub_workflow_calls() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("lib.yaml"),
            r#"
tasks:
  - { name: inc, command: "echo ~{n}", inputs: [{ name: n, type: Int }], outputs: [{ name: out, type: Int, expr: "n + 1" }] }
workflow:
  name: twice
  inputs: [{ name: n, type: Int }]
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
    - call: { callee: lib.twice, inputs: { n: "1" } }
    - call: { callee: lib.inc, after: [twice] }
"#,
        )
        .unwrap();

        let document = load_document(&main).unwrap();
        assert_eq!(document.imports[0].namespace, "lib");
        let workflow = document.workflow.as_ref().unwrap();
        let calls = workflow.calls();
        assert!(matches!(calls[0].callee, Callee::Workflow(_)));
        assert_eq!(calls[1].name, "inc");
        assert_eq!(workflow.required_inputs().names(), vec!["inc.n"]);
        assert_eq!(workflow.scope().graph().dependencies("call-inc"), vec!["call-twice"]);
    }
}
