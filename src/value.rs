//! Values and Types
//!
//! Runtime values flowing between workflow nodes, the declared types they
//! are checked against, and conversion to and from Cromwell-style JSON.
//!
//! # JSON inputs
//!
//! ```json
//! {
//!   "wf.numerator": 7,
//!   "wf.denominator": 2,
//!   "#comment": "keys starting with '#' are ignored"
//! }
//! ```
//!
//! [`values_from_json`] strips the optional namespace (`wf.`), checks every
//! key against the available declarations and converts each value to its
//! declared type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::env::Bindings;
use crate::error::{Error, EvalError, Result};

/// Declared type of a value.
///
/// Serialized in documents as its WDL spelling, e.g. `Array[Int]+` or
/// `Map[String,File]?`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Type {
    Boolean,
    Int,
    Float,
    String,
    File,
    Array { item: Box<Type>, nonempty: bool },
    Pair(Box<Type>, Box<Type>),
    Map(Box<Type>, Box<Type>),
    Optional(Box<Type>),
    /// Accepts any value; used for untyped JSON and inferred declarations
    Any,
}

impl Type {
    /// `Array[T]`, the promotion of a name gathered out of a scatter.
    pub fn array_of(item: Type) -> Type {
        Type::Array {
            item: Box::new(item),
            nonempty: false,
        }
    }

    /// `T?`, the promotion of a name gathered out of a conditional.
    /// Optional types are returned unchanged.
    pub fn optional_of(inner: Type) -> Type {
        match inner {
            Type::Optional(_) | Type::Any => inner,
            other => Type::Optional(Box::new(other)),
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Type::Optional(_) | Type::Any)
    }

    /// The type with any top-level optional quantifier removed.
    pub fn required(&self) -> &Type {
        match self {
            Type::Optional(inner) => inner,
            other => other,
        }
    }

    /// True if values of this type may contain `File`s.
    pub fn mentions_file(&self) -> bool {
        match self {
            Type::File | Type::Any => true,
            Type::Array { item, .. } => item.mentions_file(),
            Type::Pair(left, right) | Type::Map(left, right) => {
                left.mentions_file() || right.mentions_file()
            }
            Type::Optional(inner) => inner.mentions_file(),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Boolean => write!(f, "Boolean"),
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::String => write!(f, "String"),
            Type::File => write!(f, "File"),
            Type::Any => write!(f, "Any"),
            Type::Array { item, nonempty } => {
                write!(f, "Array[{}]{}", item, if *nonempty { "+" } else { "" })
            }
            Type::Pair(left, right) => write!(f, "Pair[{},{}]", left, right),
            Type::Map(key, value) => write!(f, "Map[{},{}]", key, value),
            Type::Optional(inner) => write!(f, "{}?", inner),
        }
    }
}

impl FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix('?') {
            return Ok(Type::optional_of(inner.parse()?));
        }
        if let Some(inner) = s.strip_suffix('+') {
            return match inner.parse()? {
                Type::Array { item, .. } => Ok(Type::Array {
                    item,
                    nonempty: true,
                }),
                other => Err(format!("'+' quantifier on non-array type {}", other)),
            };
        }

        let (head, params) = match s.find('[') {
            Some(open) if s.ends_with(']') => {
                (&s[..open], split_type_params(&s[open + 1..s.len() - 1])?)
            }
            Some(_) => return Err(format!("malformed type: {}", s)),
            None => (s, Vec::new()),
        };

        let ty = match (head, params.as_slice()) {
            ("Boolean", []) => Type::Boolean,
            ("Int", []) => Type::Int,
            ("Float", []) => Type::Float,
            ("String", []) => Type::String,
            ("File", []) => Type::File,
            ("Any", []) => Type::Any,
            ("Array", [item]) => Type::array_of(item.parse()?),
            ("Pair", [left, right]) => Type::Pair(Box::new(left.parse()?), Box::new(right.parse()?)),
            ("Map", [key, value]) => Type::Map(Box::new(key.parse()?), Box::new(value.parse()?)),
            _ => return Err(format!("unknown type: {}", s)),
        };
        Ok(ty)
    }
}

/// Splits `A,Map[B,C]` at top-level commas.
fn split_type_params(s: &str) -> std::result::Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced brackets in type: {}", s))?
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    Ok(parts)
}

impl TryFrom<String> for Type {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Type> for String {
    fn from(ty: Type) -> String {
        ty.to_string()
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent optional value
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Path (or URI) of a file
    File(String),
    Array(Vec<Value>),
    Pair(Box<Value>, Box<Value>),
    /// Ordered key/value entries
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn pair(left: Value, right: Value) -> Value {
        Value::Pair(Box::new(left), Box::new(right))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn file(path: impl Into<String>) -> Value {
        Value::File(path.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the value's kind, used in type mismatch messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "None",
            Value::Boolean(_) => "Boolean",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::File(_) => "File",
            Value::Array(_) => "Array",
            Value::Pair(_, _) => "Pair",
            Value::Map(_) => "Map",
        }
    }

    pub fn as_bool(&self) -> std::result::Result<bool, EvalError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => Err(EvalError::mismatch("Boolean", other.type_name())),
        }
    }

    pub fn as_int(&self) -> std::result::Result<i64, EvalError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(EvalError::mismatch("Int", other.type_name())),
        }
    }

    /// Numeric value, promoting `Int` to `Float`.
    pub fn as_float(&self) -> std::result::Result<f64, EvalError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(x) => Ok(*x),
            other => Err(EvalError::mismatch("Float", other.type_name())),
        }
    }

    /// Text of a `String` or `File`.
    pub fn as_str(&self) -> std::result::Result<&str, EvalError> {
        match self {
            Value::String(s) | Value::File(s) => Ok(s),
            other => Err(EvalError::mismatch("String", other.type_name())),
        }
    }

    pub fn as_array(&self) -> std::result::Result<&[Value], EvalError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(EvalError::mismatch("Array", other.type_name())),
        }
    }

    /// Converts to the declared type, applying the implicit coercions
    /// (`Int` to `Float`, `String` to `File` and back).
    pub fn coerce(self, ty: &Type) -> std::result::Result<Value, EvalError> {
        match (ty, self) {
            (Type::Any, v) => Ok(v),
            (Type::Optional(_), Value::Null) => Ok(Value::Null),
            (Type::Optional(inner), v) => v.coerce(inner),
            (_, Value::Null) => Err(EvalError::NullValue(format!(
                "None assigned to non-optional {}",
                ty
            ))),
            (Type::Boolean, v @ Value::Boolean(_)) => Ok(v),
            (Type::Int, v @ Value::Int(_)) => Ok(v),
            (Type::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Type::Float, v @ Value::Float(_)) => Ok(v),
            (Type::String, Value::String(s) | Value::File(s)) => Ok(Value::String(s)),
            (Type::File, Value::String(s) | Value::File(s)) => Ok(Value::File(s)),
            (Type::Array { item, nonempty }, Value::Array(items)) => {
                if *nonempty && items.is_empty() {
                    return Err(EvalError::mismatch(ty.to_string(), "empty array"));
                }
                items
                    .into_iter()
                    .map(|v| v.coerce(item))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            (Type::Pair(lt, rt), Value::Pair(left, right)) => {
                Ok(Value::pair(left.coerce(lt)?, right.coerce(rt)?))
            }
            (Type::Map(kt, vt), Value::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| Ok((k.coerce(kt)?, v.coerce(vt)?)))
                .collect::<std::result::Result<Vec<_>, EvalError>>()
                .map(Value::Map),
            (_, v) => Err(EvalError::mismatch(ty.to_string(), v.type_name())),
        }
    }

    /// Cromwell-style JSON rendering.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(x) => serde_json::Number::from_f64(*x)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) | Value::File(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Pair(left, right) => {
                let mut obj = serde_json::Map::new();
                obj.insert("left".to_string(), left.to_json());
                obj.insert("right".to_string(), right.to_json());
                Json::Object(obj)
            }
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Parses JSON as a value of the given type.
    pub fn from_json(ty: &Type, json: &Json) -> std::result::Result<Value, EvalError> {
        let value = match (ty, json) {
            (Type::Optional(_) | Type::Any, Json::Null) => Value::Null,
            (Type::Optional(inner), json) => Value::from_json(inner, json)?,
            (Type::Any, json) => Value::infer_json(json),
            (Type::Boolean, Json::Bool(b)) => Value::Boolean(*b),
            (Type::Int, Json::Number(n)) if n.is_i64() => Value::Int(n.as_i64().unwrap_or_default()),
            (Type::Float, Json::Number(n)) => Value::Float(n.as_f64().unwrap_or_default()),
            (Type::String, Json::String(s)) => Value::String(s.clone()),
            (Type::File, Json::String(s)) => Value::File(s.clone()),
            (Type::Array { item, nonempty }, Json::Array(items)) => {
                if *nonempty && items.is_empty() {
                    return Err(EvalError::mismatch(ty.to_string(), "empty array"));
                }
                Value::Array(
                    items
                        .iter()
                        .map(|json| Value::from_json(item, json))
                        .collect::<std::result::Result<_, _>>()?,
                )
            }
            (Type::Pair(lt, rt), Json::Object(obj)) => {
                match (obj.get("left"), obj.get("right")) {
                    (Some(left), Some(right)) => {
                        Value::pair(Value::from_json(lt, left)?, Value::from_json(rt, right)?)
                    }
                    _ => return Err(EvalError::mismatch(ty.to_string(), "object")),
                }
            }
            (Type::Map(kt, vt), Json::Object(obj)) => Value::Map(
                obj.iter()
                    .map(|(k, v)| Ok((map_key_from_str(kt, k)?, Value::from_json(vt, v)?)))
                    .collect::<std::result::Result<Vec<_>, EvalError>>()?,
            ),
            (ty, json) => return Err(EvalError::mismatch(ty.to_string(), json_kind(json))),
        };
        Ok(value)
    }

    fn infer_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::infer_json).collect()),
            Json::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::infer_json(v)))
                    .collect(),
            ),
        }
    }

    /// Calls `f` on every `File` path inside the value.
    pub fn visit_files<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Value::File(path) => f(path),
            Value::Array(items) => items.iter().for_each(|v| v.visit_files(f)),
            Value::Pair(left, right) => {
                left.visit_files(f);
                right.visit_files(f);
            }
            Value::Map(entries) => entries.iter().for_each(|(k, v)| {
                k.visit_files(f);
                v.visit_files(f);
            }),
            _ => {}
        }
    }

    /// Rewrites every `File` path inside the value.
    pub fn map_files<E>(
        self,
        f: &mut impl FnMut(String) -> std::result::Result<String, E>,
    ) -> std::result::Result<Value, E> {
        Ok(match self {
            Value::File(path) => Value::File(f(path)?),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| v.map_files(f))
                    .collect::<std::result::Result<Vec<_>, E>>()?,
            ),
            Value::Pair(left, right) => Value::pair(left.map_files(f)?, right.map_files(f)?),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k.map_files(f)?, v.map_files(f)?)))
                    .collect::<std::result::Result<_, E>>()?,
            ),
            other => other,
        })
    }
}

fn map_key_from_str(ty: &Type, key: &str) -> std::result::Result<Value, EvalError> {
    let parsed = match ty.required() {
        Type::Int => key.parse().map(Value::Int).ok(),
        Type::Float => key.parse().map(Value::Float).ok(),
        Type::Boolean => key.parse().map(Value::Boolean).ok(),
        Type::File => Some(Value::File(key.to_string())),
        _ => Some(Value::String(key.to_string())),
    };
    parsed.ok_or_else(|| EvalError::mismatch(ty.to_string(), format!("map key {:?}", key)))
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// String form used by interpolation and map keys.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:.6}", x),
            Value::String(s) | Value::File(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Converts a JSON object to typed bindings.
///
/// Keys starting with `#` are ignored. When `namespace` is given, a leading
/// `namespace.` is stripped from each key. A key of the form
/// `call.subworkflow.input` that is not itself available falls back to
/// `call.input`. Unknown keys and (when `required` is given) missing
/// required names are reported as [`Error::Input`].
pub fn values_from_json(
    json: &Json,
    available: &Bindings<Type>,
    required: Option<&Bindings<Type>>,
    namespace: &str,
) -> Result<Bindings<Value>> {
    let obj = json
        .as_object()
        .ok_or_else(|| Error::Input(format!("expected a JSON object, got {}", json_kind(json))))?;
    let prefix = if namespace.is_empty() || namespace.ends_with('.') {
        namespace.to_string()
    } else {
        format!("{}.", namespace)
    };

    let mut values = Bindings::new();
    for (key, json_value) in obj {
        if key.starts_with('#') {
            continue;
        }
        let mut name = match key.strip_prefix(&prefix) {
            Some(rest) if !prefix.is_empty() => rest.to_string(),
            _ => key.clone(),
        };
        let mut ty = available.get(&name);
        if ty.is_none() {
            let parts: Vec<&str> = name.split('.').collect();
            if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
                name = format!("{}.{}", parts[0], parts[2]);
                ty = available.get(&name);
            }
        }
        let ty = ty.ok_or_else(|| Error::Input(format!("unknown input/output: {}", key)))?;
        let value = Value::from_json(ty, json_value)
            .map_err(|e| Error::Input(format!("{}: {}", key, e)))?;
        values = values.bind(name, value);
    }

    if let Some(required) = required {
        let missing = required.subtract(&values);
        if !missing.is_empty() {
            let names: Vec<String> = missing
                .names()
                .into_iter()
                .map(|n| format!("{}{}", prefix, n))
                .collect();
            return Err(Error::Input(format!(
                "missing required inputs/outputs: {}",
                names.join(", ")
            )));
        }
    }
    Ok(values)
}

/// Converts bindings to a JSON object, prefixing keys with `namespace.`
pub fn values_to_json(values: &Bindings<Value>, namespace: &str) -> Json {
    let prefix = if namespace.is_empty() || namespace.ends_with('.') {
        namespace.to_string()
    } else {
        format!("{}.", namespace)
    };
    Json::Object(
        values
            .iter()
            .map(|b| (format!("{}{}", prefix, b.name()), b.value().to_json()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_parse_and_display() {
        for spelling in ["Int", "Array[Int]+", "File?", "Map[String,Array[File]]", "Pair[Int,String]?"] {
            let ty: Type = spelling.parse().unwrap();
            assert_eq!(ty.to_string(), spelling);
        }
        assert!("Array[Int".parse::<Type>().is_err());
        assert!("Int+".parse::<Type>().is_err());
    }

    #[test]
    fn test_type_promotion() {
        assert_eq!(Type::array_of(Type::Int).to_string(), "Array[Int]");
        assert_eq!(Type::optional_of(Type::Int).to_string(), "Int?");
        assert_eq!(
            Type::optional_of(Type::optional_of(Type::Int)).to_string(),
            "Int?"
        );
        assert_eq!(
            Type::array_of(Type::optional_of(Type::File)).to_string(),
            "Array[File?]"
        );
    }

    #[test]
    fn test_coercion() {
        assert_eq!(Value::Int(2).coerce(&Type::Float).unwrap(), Value::Float(2.0));
        assert_eq!(
            Value::string("a.txt").coerce(&Type::File).unwrap(),
            Value::file("a.txt")
        );
        assert_eq!(
            Value::Null.coerce(&Type::optional_of(Type::Int)).unwrap(),
            Value::Null
        );
        assert!(Value::Null.coerce(&Type::Int).is_err());
        assert!(Value::Array(vec![])
            .coerce(&"Array[Int]+".parse().unwrap())
            .is_err());
        assert!(Value::string("x").coerce(&Type::Int).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let ty: Type = "Map[String,Array[Pair[Int,Float]]]".parse().unwrap();
        let json = json!({"a": [{"left": 1, "right": 2}]});
        let value = Value::from_json(&ty, &json).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![(
                Value::string("a"),
                Value::Array(vec![Value::pair(Value::Int(1), Value::Float(2.0))])
            )])
        );
        assert_eq!(value.to_json(), json!({"a": [{"left": 1, "right": 2.0}]}));

        assert!(Value::from_json(&Type::Int, &json!(1.5)).is_err());
        assert!(Value::from_json(&Type::Int, &json!(null)).is_err());
        let int_keys: Type = "Map[Int,String]".parse().unwrap();
        assert_eq!(
            Value::from_json(&int_keys, &json!({"3": "c"})).unwrap(),
            Value::Map(vec![(Value::Int(3), Value::string("c"))])
        );
    }

    #[test]
    fn test_value_serde_is_lossless() {
        let value = Value::Array(vec![Value::file("/data/a.bam"), Value::Null]);
        let text = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_file_visiting() {
        let value = Value::Array(vec![
            Value::file("a"),
            Value::pair(Value::Int(1), Value::file("b")),
        ]);
        let mut seen = Vec::new();
        value.visit_files(&mut |p| seen.push(p.to_string()));
        assert_eq!(seen, vec!["a", "b"]);

        let moved = value
            .map_files(&mut |p| Ok::<_, ()>(format!("/in/{}", p)))
            .unwrap();
        let mut seen = Vec::new();
        moved.visit_files(&mut |p| seen.push(p.to_string()));
        assert_eq!(seen, vec!["/in/a", "/in/b"]);
    }

    fn available() -> Bindings<Type> {
        Bindings::new()
            .bind("numerator", Type::Int)
            .bind("denominator", Type::Int)
            .bind("align.threads", Type::optional_of(Type::Int))
    }

    #[test]
    fn test_values_from_json() {
        let required = Bindings::new()
            .bind("numerator", Type::Int)
            .bind("denominator", Type::Int);
        let inputs = json!({
            "div.numerator": 7,
            "div.denominator": 2,
            "div.align.sub.threads": 4,
            "#note": "ignored"
        });
        let values = values_from_json(&inputs, &available(), Some(&required), "div").unwrap();
        assert_eq!(values.get("numerator"), Some(&Value::Int(7)));
        assert_eq!(values.get("align.threads"), Some(&Value::Int(4)));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_values_from_json_errors() {
        let err = values_from_json(&json!({"bogus": 1}), &available(), None, "").unwrap_err();
        assert!(err.to_string().contains("unknown input/output: bogus"));

        let required = Bindings::new().bind("denominator", Type::Int);
        let err = values_from_json(&json!({"numerator": 1}), &available(), Some(&required), "")
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required inputs/outputs: denominator"));

        let err = values_from_json(&json!({"numerator": "x"}), &available(), None, "").unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }

    #[test]
    fn test_values_to_json() {
        let values = Bindings::new()
            .bind("quotient", Value::Int(3))
            .bind("names", Value::Array(vec![Value::string("a")]));
        assert_eq!(
            values_to_json(&values, "div"),
            json!({"div.quotient": 3, "div.names": ["a"]})
        );
    }
}
