//! Node Executors
//!
//! Evaluation of the non-call node kinds:
//!
//! - declarations, with run-input overrides for workflow inputs
//! - assertions, failing with the literal expression source
//! - gathers, collapsing a finished section into the enclosing scope
//! - output sections of workflows

use log::debug;

use crate::env::Bindings;
use crate::error::{Error, Result};
use crate::expr::StdLib;
use crate::value::Value;
use crate::workflow::{Assertion, Decl, Gather, Workflow};

/// What a finished section hands to its gathers.
#[derive(Debug, Clone)]
pub enum SectionOutcome {
    /// Produced bindings of each iteration, in collection order
    Scatter(Vec<Bindings<Value>>),
    /// Produced bindings of the body, or `None` when the guard was false
    Conditional(Option<Bindings<Value>>),
}

/// Value of a declaration.
///
/// A value supplied in `inputs` under the declaration's name takes
/// precedence over its expression. An input left unsupplied evaluates to
/// `Null` when optional and is an input error otherwise.
pub fn evaluate_decl(decl: &Decl, env: &Bindings<Value>, inputs: &Bindings<Value>) -> Result<Value> {
    if let Some(value) = inputs.get(&decl.name) {
        return value
            .clone()
            .coerce(&decl.ty)
            .map_err(|e| Error::Input(format!("{}: {}", decl.name, e)));
    }
    match &decl.expr {
        Some(expr) => expr
            .eval(env, &StdLib::new())
            .and_then(|value| value.coerce(&decl.ty))
            .map_err(|e| Error::runtime(&decl.pos, e)),
        None if decl.ty.is_optional() => Ok(Value::Null),
        None => Err(Error::Input(format!("missing required input: {}", decl.name))),
    }
}

pub fn check_assertion(assertion: &Assertion, env: &Bindings<Value>) -> Result<()> {
    let holds = assertion
        .expr
        .eval(env, &StdLib::new())
        .and_then(|value| value.as_bool())
        .map_err(|e| Error::runtime(&assertion.pos, e))?;
    if holds {
        Ok(())
    } else {
        Err(Error::AssertionFailed {
            pos: assertion.pos.clone(),
            expr: assertion.expr.to_string(),
        })
    }
}

/// Binds the gathered name from its section's outcome.
///
/// Scatters yield one array element per iteration; iterations that did
/// not bind the name (e.g. a nested false conditional) contribute `Null`.
pub fn gather(gather: &Gather, outcome: &SectionOutcome) -> Bindings<Value> {
    let value = match outcome {
        SectionOutcome::Scatter(iterations) => Value::Array(
            iterations
                .iter()
                .map(|bindings| bindings.get(&gather.name).cloned().unwrap_or(Value::Null))
                .collect(),
        ),
        SectionOutcome::Conditional(Some(bindings)) => {
            bindings.get(&gather.name).cloned().unwrap_or(Value::Null)
        }
        SectionOutcome::Conditional(None) => Value::Null,
    };
    debug!("gather {} from {}", gather.name, gather.section);
    Bindings::new().bind(gather.name.clone(), value)
}

/// Evaluates output declarations in order; later outputs see earlier ones.
pub fn evaluate_outputs(decls: &[Decl], env: &Bindings<Value>) -> Result<Bindings<Value>> {
    let stdlib = StdLib::new();
    let mut env = env.clone();
    let mut outputs = Bindings::new();
    for decl in decls {
        let expr = decl
            .expr
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("output {} has no expression", decl.name)))?;
        let value = expr
            .eval(&env, &stdlib)
            .and_then(|value| value.coerce(&decl.ty))
            .map_err(|e| Error::runtime(&decl.pos, e))?;
        env = env.bind(decl.name.clone(), value.clone());
        outputs = outputs.bind(decl.name.clone(), value);
    }
    Ok(outputs)
}

/// Outputs of a finished workflow: its output section, or every name its
/// top-level scope produced other than the inputs.
pub fn workflow_outputs(workflow: &Workflow, produced: &Bindings<Value>) -> Result<Bindings<Value>> {
    match &workflow.outputs {
        Some(decls) => evaluate_outputs(decls, produced),
        None => Ok(produced.filter(|b| !workflow.inputs.iter().any(|d| d.name == b.name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EvalError, SourcePosition};
    use crate::value::Type;

    fn decl(name: &str, ty: &str, expr: Option<&str>) -> Decl {
        let decl = Decl::new(name, ty.parse::<Type>().unwrap()).at(SourcePosition::new("w.yaml", 3, 5));
        match expr {
            Some(src) => decl.with_expr(src.parse().unwrap()),
            None => decl,
        }
    }

    #[test]
    fn test_evaluate_decl() {
        let env = Bindings::new().bind("x", Value::Int(4));
        let none = Bindings::new();
        assert_eq!(evaluate_decl(&decl("y", "Int", Some("x * 2")), &env, &none).unwrap(), Value::Int(8));
        assert_eq!(evaluate_decl(&decl("f", "Float", Some("x")), &env, &none).unwrap(), Value::Float(4.0));
        assert_eq!(evaluate_decl(&decl("o", "Int?", None), &env, &none).unwrap(), Value::Null);
        assert!(matches!(
            evaluate_decl(&decl("r", "Int", None), &env, &none),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn test_inputs_override_defaults() {
        let inputs = Bindings::new().bind("n", Value::Int(10));
        let value = evaluate_decl(&decl("n", "Int", Some("1")), &Bindings::new(), &inputs).unwrap();
        assert_eq!(value, Value::Int(10));
    }

    #[test]
    fn test_runtime_error_carries_position() {
        let env = Bindings::new().bind("x", Value::Int(1));
        match evaluate_decl(&decl("q", "Int", Some("x / 0")), &env, &Bindings::new()) {
            Err(Error::Runtime { pos, source }) => {
                assert_eq!(pos.line, 3);
                assert_eq!(source, EvalError::DivisionByZero);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_check_assertion() {
        let pos = SourcePosition::new("w.yaml", 9, 1);
        let assertion = Assertion::new(pos, "denominator != 0".parse().unwrap());
        let ok = Bindings::new().bind("denominator", Value::Int(2));
        assert!(check_assertion(&assertion, &ok).is_ok());

        let zero = Bindings::new().bind("denominator", Value::Int(0));
        let err = check_assertion(&assertion, &zero).unwrap_err();
        assert!(err.is_runtime_error());
        assert!(err.to_string().contains("assertion failed: denominator != 0"));
    }

    #[test]
    fn test_gather_promotion() {
        let g = Gather {
            section: "scatter-L2C1".into(),
            name: "y".into(),
            ty: Type::array_of(Type::Int),
            referee: "decl-y".into(),
        };
        let outcome = SectionOutcome::Scatter(vec![
            Bindings::new().bind("y", Value::Int(2)),
            Bindings::new(),
            Bindings::new().bind("y", Value::Int(6)),
        ]);
        assert_eq!(
            gather(&g, &outcome).get("y"),
            Some(&Value::Array(vec![Value::Int(2), Value::Null, Value::Int(6)]))
        );
        assert_eq!(
            gather(&g, &SectionOutcome::Scatter(Vec::new())).get("y"),
            Some(&Value::Array(Vec::new()))
        );
        assert_eq!(gather(&g, &SectionOutcome::Conditional(None)).get("y"), Some(&Value::Null));
    }

    #[test]
    fn test_outputs_see_earlier_outputs() {
        let env = Bindings::new().bind("x", Value::Int(3));
        let outputs = evaluate_outputs(
            &[decl("a", "Int", Some("x + 1")), decl("b", "Int", Some("a * 10"))],
            &env,
        )
        .unwrap();
        assert_eq!(outputs.names(), vec!["a", "b"]);
        assert_eq!(outputs.get("b"), Some(&Value::Int(40)));
    }
}
