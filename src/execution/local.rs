//! Local Process Backend
//!
//! Runs a task's command with bash on the host, or inside a container when
//! the task declares an image and a container CLI is configured.
//!
//! Layout of a call directory after execution:
//!
//! ```text
//! call-align/
//!   command       # rendered script
//!   stdout.txt
//!   stderr.txt
//!   work/         # working directory; relative output paths resolve here
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, TaskBackend, TaskRequest};
use crate::env::Bindings;
use crate::expr::{Expr, StdLib, StringPart};
use crate::value::Value;
use crate::workflow::Task;

/// Lines of stderr kept in failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// Backend running commands as local processes.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: String,
    container_cli: Option<String>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            container_cli: None,
        }
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs tasks declaring an image through `cli run` (e.g. `docker`).
    pub fn with_container_cli(mut self, cli: impl Into<String>) -> Self {
        self.container_cli = Some(cli.into());
        self
    }

    fn command(&self, request: &TaskRequest, script: &Path, work: &Path) -> Command {
        match (&request.runtime.image, &self.container_cli) {
            (Some(image), Some(cli)) => {
                let dir = request.dir.to_string_lossy();
                let mut cmd = Command::new(cli);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-v")
                    .arg(format!("{0}:{0}", dir))
                    .arg("-w")
                    .arg(work)
                    .arg(image)
                    .arg("bash")
                    .arg(script);
                cmd
            }
            (image, _) => {
                if let Some(image) = image {
                    warn!(
                        "{}: no container CLI configured, running on the host instead of {}",
                        request.call, image
                    );
                }
                let mut cmd = Command::new(&self.shell);
                cmd.arg(script).current_dir(work);
                cmd
            }
        }
    }
}

/// Substitutes `~{expr}` placeholders of the task command.
///
/// Arrays are joined with spaces and absent optionals render as nothing.
pub fn render_command(task: &Task, inputs: &Bindings<Value>) -> Result<String, String> {
    let template = Expr::template(&task.command)?;
    let Expr::String(parts) = template else {
        return Ok(task.command.clone());
    };
    let stdlib = StdLib::new();
    let mut command = String::new();
    for part in parts {
        match part {
            StringPart::Text(text) => command.push_str(&text),
            StringPart::Placeholder(expr) => {
                let value = expr
                    .eval(inputs, &stdlib)
                    .map_err(|e| format!("command placeholder ~{{{}}}: {}", expr, e))?;
                match value {
                    Value::Null => {}
                    Value::Array(items) => {
                        let items: Vec<String> = items.iter().map(Value::to_string).collect();
                        command.push_str(&items.join(" "));
                    }
                    other => command.push_str(&other.to_string()),
                }
            }
        }
    }
    Ok(command)
}

async fn stderr_tail(path: &Path) -> String {
    let text = fs::read_to_string(path).await.unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn transient(context: &str) -> impl Fn(std::io::Error) -> BackendError + '_ {
    move |e| BackendError::Transient(format!("{}: {}", context, e))
}

#[async_trait]
impl TaskBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn fingerprint(&self, request: &TaskRequest) -> String {
        match (&request.runtime.image, &self.container_cli) {
            (Some(image), Some(cli)) => format!("{}:{}", cli, image),
            _ => self.name().to_string(),
        }
    }

    async fn execute(
        &self,
        request: &TaskRequest,
        abort: CancellationToken,
    ) -> Result<Bindings<Value>, BackendError> {
        let work = request.dir.join("work");
        fs::create_dir_all(&work)
            .await
            .map_err(transient("creating work directory"))?;

        let command = render_command(&request.task, &request.inputs).map_err(BackendError::permanent)?;
        let script = request.dir.join("command");
        fs::write(&script, format!("#!/bin/bash\nset -e\n{}\n", command))
            .await
            .map_err(transient("writing command"))?;

        let stdout_path = request.dir.join("stdout.txt");
        let stderr_path = request.dir.join("stderr.txt");
        let stdout = std::fs::File::create(&stdout_path).map_err(transient("creating stdout.txt"))?;
        let stderr = std::fs::File::create(&stderr_path).map_err(transient("creating stderr.txt"))?;

        let mut cmd = self.command(request, &script, &work);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        debug!("{}: executing {}", request.call, script.display());
        let mut child = cmd.spawn().map_err(transient("starting command"))?;
        let status = tokio::select! {
            status = child.wait() => status.map_err(transient("waiting for command"))?,
            _ = abort.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("{}: failed to terminate command: {}", request.call, e);
                }
                return Err(BackendError::Permanent {
                    exit_status: None,
                    stderr: stderr_tail(&stderr_path).await,
                    message: "command terminated".to_string(),
                });
            }
        };

        if !status.success() {
            let stderr = stderr_tail(&stderr_path).await;
            error!(
                "{}: command failed with exit code {:?}",
                request.call,
                status.code()
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
            return Err(BackendError::Permanent {
                exit_status: status.code(),
                stderr,
                message: match status.code() {
                    Some(code) => format!("command exited with status {}", code),
                    None => "command killed by signal".to_string(),
                },
            });
        }

        collect_outputs(&request.task, &request.inputs, &work, &stdout_path, &stderr_path)
    }
}

/// Evaluates the task's output declarations in the finished work directory.
fn collect_outputs(
    task: &Task,
    inputs: &Bindings<Value>,
    work: &Path,
    stdout: &Path,
    stderr: &Path,
) -> Result<Bindings<Value>, BackendError> {
    let stdlib = StdLib::in_dir(work).with_streams(stdout, stderr);
    let mut env = inputs.clone();
    let mut outputs = Bindings::new();
    for decl in &task.outputs {
        let expr = decl
            .expr
            .as_ref()
            .ok_or_else(|| BackendError::permanent(format!("output {} has no expression", decl.name)))?;
        let value = expr
            .eval(&env, &stdlib)
            .and_then(|v| v.coerce(&decl.ty))
            .map_err(|e| BackendError::permanent(format!("output {}: {}", decl.name, e)))?;
        let value = value.map_files(&mut |path| {
            let resolved = if Path::new(&path).is_absolute() {
                PathBuf::from(&path)
            } else {
                work.join(&path)
            };
            if resolved.exists() {
                Ok(resolved.to_string_lossy().into_owned())
            } else {
                Err(BackendError::permanent(format!(
                    "output {}: file not found: {}",
                    decl.name, path
                )))
            }
        })?;
        env = env.bind(decl.name.clone(), value.clone());
        outputs = outputs.bind(decl.name.clone(), value);
    }
    Ok(outputs)
}
