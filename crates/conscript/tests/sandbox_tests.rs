//! Every operation the sandbox forbids, and the ones it allows.

use std::sync::Arc;

use conscript::{
    make_literal, DebugInfo, Dictionary, ErrorKind, Expression, Function, IncludeKind,
    ScriptFrame, SetOp, Value,
};

fn di() -> DebugInfo {
    DebugInfo::default()
}

fn b(expr: Expression) -> Box<Expression> {
    Box::new(expr)
}

fn lit(value: impl Into<Value>) -> Expression {
    make_literal(value)
}

fn sandboxed_frame() -> (ScriptFrame, Dictionary) {
    let self_dict = Dictionary::new();
    let frame = ScriptFrame::with_self(self_dict.clone().into());
    frame.set_sandboxed(true);
    (frame, self_dict)
}

fn assert_sandbox_violation(expr: Expression) {
    let (frame, _) = sandboxed_frame();
    let err = expr.evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SandboxViolation, "{}", err.message);
}

#[test]
fn test_assignment_is_forbidden() {
    assert_sandbox_violation(Expression::Set {
        target: b(Expression::Variable {
            name: "x".into(),
            di: di(),
        }),
        op: SetOp::Literal,
        value: b(lit(1.0)),
        di: di(),
    });
}

#[test]
fn test_while_is_forbidden() {
    assert_sandbox_violation(Expression::While {
        condition: b(lit(false)),
        body: b(lit(Value::Empty)),
        di: di(),
    });
}

#[test]
fn test_for_is_forbidden() {
    assert_sandbox_violation(Expression::For {
        key_var: "x".into(),
        value_var: None,
        iterable: b(Expression::Array {
            items: vec![],
            di: di(),
        }),
        body: b(lit(Value::Empty)),
        di: di(),
    });
}

#[test]
fn test_import_is_forbidden() {
    assert_sandbox_violation(Expression::Import {
        name: b(lit("any-template")),
        di: di(),
    });
}

#[test]
fn test_include_is_forbidden() {
    assert_sandbox_violation(Expression::Include {
        kind: IncludeKind::Regular,
        path: b(lit("conf.d/hosts.conf")),
        pattern: None,
        name: None,
        search_includes: false,
        relative_base: "".into(),
        zone: "".into(),
        package: "_etc".into(),
        di: di(),
    });
}

#[test]
fn test_library_is_forbidden() {
    assert_sandbox_violation(Expression::Library {
        path: b(lit("methods")),
        di: di(),
    });
}

#[test]
fn test_apply_is_forbidden() {
    assert_sandbox_violation(Expression::Apply {
        type_name: "Service".into(),
        target_type: "Host".into(),
        name: b(lit("sandboxed-rule")),
        filter: None,
        package: "_etc".into(),
        fk_var: None,
        fv_var: None,
        f_term: None,
        closed_vars: None,
        ignore_on_error: false,
        body: Arc::new(lit(Value::Empty)),
        di: di(),
    });
}

#[test]
fn test_object_is_forbidden() {
    assert_sandbox_violation(Expression::Object {
        abstract_: false,
        type_name: "Host".into(),
        name: Some(b(lit("sandboxed-host"))),
        filter: None,
        zone: "".into(),
        package: "_etc".into(),
        ignore_on_error: false,
        closed_vars: None,
        body: Arc::new(lit(Value::Empty)),
        di: di(),
    });
}

#[test]
fn test_calling_ordinary_functions_is_forbidden() {
    let (frame, self_dict) = sandboxed_frame();

    // Script-defined functions are not side-effect free.
    let ordinary = Function::new(vec![], None, false, Arc::new(lit(1.0)));
    self_dict.insert("f", ordinary.into());

    let call = Expression::FunctionCall {
        callee: b(Expression::Variable {
            name: "f".into(),
            di: di(),
        }),
        args: vec![],
        di: di(),
    };
    let err = call.evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SandboxViolation);
}

#[test]
fn test_side_effect_free_functions_are_allowed() {
    let (frame, self_dict) = sandboxed_frame();

    let safe = Function::new(vec![], None, true, Arc::new(lit(7.0)));
    self_dict.insert("f", safe.into());

    let call = Expression::FunctionCall {
        callee: b(Expression::Variable {
            name: "f".into(),
            di: di(),
        }),
        args: vec![],
        di: di(),
    };
    assert_eq!(call.evaluate(&frame, None).unwrap().value, Value::Number(7.0));
}

#[test]
fn test_reading_function_internals_is_forbidden() {
    let (frame, self_dict) = sandboxed_frame();

    let func = Function::new(vec![], None, true, Arc::new(lit(Value::Empty)));
    self_dict.insert("f", func.into());

    let expr = Expression::Indexer {
        parent: b(Expression::Variable {
            name: "f".into(),
            di: di(),
        }),
        index: b(lit("body")),
        di: di(),
    };
    let err = expr.evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::SandboxViolation);
}

#[test]
fn test_pure_expressions_still_evaluate() {
    let (frame, self_dict) = sandboxed_frame();
    self_dict.insert("threshold", Value::Number(90.0));

    let expr = Expression::GreaterThan {
        lhs: b(Expression::Variable {
            name: "threshold".into(),
            di: di(),
        }),
        rhs: b(lit(80.0)),
        di: di(),
    };
    assert_eq!(expr.evaluate(&frame, None).unwrap().value, Value::Bool(true));
}

#[test]
fn test_child_frames_inherit_the_sandbox_flag() {
    let (outer, _) = sandboxed_frame();
    let inner = ScriptFrame::with_self(Value::Empty);
    assert!(inner.sandboxed());

    let err = Expression::While {
        condition: b(lit(false)),
        body: b(lit(Value::Empty)),
        di: di(),
    }
    .evaluate(&inner, None)
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SandboxViolation);

    drop(inner);
    drop(outer);
}
