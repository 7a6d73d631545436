//! Built-in Functions
//!
//! The pure functions (`length`, `flatten`, `range`, `select_first`,
//! `select_all`, `defined`, `prefix`, `basename`) are always available.
//! File functions (`read_*`, `stdout`, `stderr`) resolve relative paths
//! against the task working directory, so they only succeed when the
//! library was created for a task's output section.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EvalError;
use crate::value::Value;

/// Function library used by expression evaluation.
#[derive(Debug, Clone, Default)]
pub struct StdLib {
    work_dir: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

impl StdLib {
    /// Library without file access.
    pub fn new() -> Self {
        Self::default()
    }

    /// Library resolving relative paths against `work_dir`.
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            ..Self::default()
        }
    }

    /// Sets the files returned by `stdout()` and `stderr()`.
    pub fn with_streams(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn apply(&self, function: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match function {
            "length" => {
                let [value] = arity(function, args)?;
                let len = match value {
                    Value::Array(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Null => return Err(EvalError::NullValue("argument of length()".into())),
                    other => return Err(EvalError::mismatch("Array", other.type_name())),
                };
                Ok(Value::Int(len as i64))
            }
            "flatten" => {
                let [value] = arity(function, args)?;
                let mut flat = Vec::new();
                for inner in into_array(value)? {
                    flat.extend(into_array(inner)?);
                }
                Ok(Value::Array(flat))
            }
            "range" => {
                let [n] = arity(function, args)?;
                let n = n.as_int()?;
                if n < 0 {
                    return Err(EvalError::function(function, format!("negative length {}", n)));
                }
                Ok(Value::Array((0..n).map(Value::Int).collect()))
            }
            "select_first" => {
                let [value] = arity(function, args)?;
                into_array(value)?
                    .into_iter()
                    .find(|v| !v.is_null())
                    .ok_or_else(|| EvalError::function(function, "all values are None"))
            }
            "select_all" => {
                let [value] = arity(function, args)?;
                Ok(Value::Array(
                    into_array(value)?.into_iter().filter(|v| !v.is_null()).collect(),
                ))
            }
            "defined" => {
                let [value] = arity(function, args)?;
                Ok(Value::Boolean(!value.is_null()))
            }
            "prefix" => {
                let [prefix, values] = arity(function, args)?;
                let prefix = prefix.as_str()?.to_string();
                Ok(Value::Array(
                    into_array(values)?
                        .into_iter()
                        .map(|v| Value::String(format!("{}{}", prefix, v)))
                        .collect(),
                ))
            }
            "basename" => {
                let (path, suffix) = match args.len() {
                    1 => {
                        let [path] = arity(function, args)?;
                        (path, None)
                    }
                    _ => {
                        let [path, suffix] = arity(function, args)?;
                        (path, Some(suffix))
                    }
                };
                let path = path.as_str()?;
                let mut name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Some(suffix) = suffix {
                    let suffix = suffix.as_str()?;
                    if let Some(stripped) = name.strip_suffix(suffix) {
                        name = stripped.to_string();
                    }
                }
                Ok(Value::String(name))
            }
            "stdout" | "stderr" => {
                let [] = arity(function, args)?;
                let stream = if function == "stdout" {
                    &self.stdout
                } else {
                    &self.stderr
                };
                stream
                    .as_ref()
                    .map(|p| Value::File(p.to_string_lossy().into_owned()))
                    .ok_or_else(|| EvalError::function(function, "only available in task outputs"))
            }
            "read_string" => {
                let text = self.read(function, args)?;
                Ok(Value::String(text.trim_end_matches(&['\n', '\r'][..]).to_string()))
            }
            "read_int" => {
                let text = self.read(function, args)?;
                text.trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| EvalError::function(function, format!("not an integer: {:?}", text.trim())))
            }
            "read_float" => {
                let text = self.read(function, args)?;
                text.trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| EvalError::function(function, format!("not a float: {:?}", text.trim())))
            }
            "read_boolean" => {
                let text = self.read(function, args)?;
                match text.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Boolean(true)),
                    "false" => Ok(Value::Boolean(false)),
                    other => Err(EvalError::function(function, format!("not a boolean: {:?}", other))),
                }
            }
            "read_lines" => {
                let text = self.read(function, args)?;
                Ok(Value::Array(text.lines().map(Value::string).collect()))
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }

    fn read(&self, function: &str, args: Vec<Value>) -> Result<String, EvalError> {
        let [file] = arity(function, args)?;
        let path = Path::new(file.as_str()?);
        let path = match &self.work_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            Some(_) => path.to_path_buf(),
            None => {
                return Err(EvalError::function(function, "file access is not available here"))
            }
        };
        fs::read_to_string(&path)
            .map_err(|e| EvalError::function(function, format!("{}: {}", path.display(), e)))
    }
}

fn arity<const N: usize>(function: &str, args: Vec<Value>) -> Result<[Value; N], EvalError> {
    let got = args.len();
    args.try_into().map_err(|_| EvalError::Arity {
        function: function.to_string(),
        expected: N,
        got,
    })
}

fn into_array(value: Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(EvalError::mismatch("Array", other.type_name())),
    }
}
