//! Behavioural tests for the tree-walking evaluator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;

use conscript::config;
use conscript::{
    bind_to_scope, make_literal, DebugInfo, Dictionary, ErrorKind, Expression, ExpressionResult,
    Function, ResultCode, ScopeSpecifier, ScriptFrame, ScriptGlobal, SetOp, Value,
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

fn var(name: &str) -> Expression {
    Expression::Variable {
        name: name.into(),
        di: di(),
    }
}

fn add(lhs: Expression, rhs: Expression) -> Expression {
    Expression::Add {
        lhs: b(lhs),
        rhs: b(rhs),
        di: di(),
    }
}

fn set(target: Expression, value: Expression) -> Expression {
    set_op(target, SetOp::Literal, value)
}

fn set_op(target: Expression, op: SetOp, value: Expression) -> Expression {
    Expression::Set {
        target: b(target),
        op,
        value: b(value),
        di: di(),
    }
}

fn index(parent: Expression, key: &str) -> Expression {
    Expression::Indexer {
        parent: b(parent),
        index: b(lit(key)),
        di: di(),
    }
}

fn throw(message: &str) -> Expression {
    Expression::Throw {
        message: b(lit(message)),
        incomplete: false,
        di: di(),
    }
}

fn array(items: Vec<Expression>) -> Expression {
    Expression::Array {
        items,
        di: di(),
    }
}

fn dict(items: Vec<Expression>, inline: bool) -> Expression {
    Expression::Dict {
        items,
        inline,
        di: di(),
    }
}

/// A frame whose `self` is a private dictionary, so assignments do not
/// leak into the shared globals.
fn scoped_frame() -> (ScriptFrame, Dictionary) {
    let self_dict = Dictionary::new();
    let frame = ScriptFrame::with_self(self_dict.clone().into());
    (frame, self_dict)
}

fn eval(expr: &Expression) -> conscript::Result<ExpressionResult> {
    let (frame, _) = scoped_frame();
    expr.evaluate(&frame, None)
}

#[test]
fn test_arithmetic_tree() {
    // 2 + 3 * 4
    let expr = add(
        lit(2.0),
        Expression::Multiply {
            lhs: b(lit(3.0)),
            rhs: b(lit(4.0)),
            di: di(),
        },
    );
    assert_eq!(eval(&expr).unwrap().value, Value::Number(14.0));
}

#[test]
fn test_string_concatenation_with_empty() {
    let expr = add(lit("db-"), add(lit("master"), lit(Value::Empty)));
    assert_eq!(eval(&expr).unwrap().value, Value::string("db-master"));
}

#[test]
fn test_division_by_zero_and_bad_operands() {
    let expr = Expression::Divide {
        lhs: b(lit(1.0)),
        rhs: b(lit(0.0)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Number(f64::INFINITY));

    let expr = Expression::Subtract {
        lhs: b(lit("a")),
        rhs: b(lit(1.0)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap_err().kind, ErrorKind::Arithmetic);
}

#[test]
fn test_logical_and_short_circuits() {
    // The throwing right side must not run when the left side decides.
    let expr = Expression::LogicalAnd {
        lhs: b(lit(false)),
        rhs: b(throw("must not run")),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Bool(false));

    let expr = Expression::LogicalAnd {
        lhs: b(lit(true)),
        rhs: b(lit(7.0)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Number(7.0));

    let expr = Expression::LogicalAnd {
        lhs: b(lit(true)),
        rhs: b(throw("boom")),
        di: di(),
    };
    assert!(eval(&expr).is_err());
}

#[test]
fn test_logical_or_short_circuits_in_sandbox() {
    // The sandboxed assignment on the right is never evaluated.
    let (frame, self_dict) = scoped_frame();
    frame.set_sandboxed(true);

    let expr = Expression::LogicalOr {
        lhs: b(lit(true)),
        rhs: b(set(var("x"), lit(1.0))),
        di: di(),
    };

    let result = expr.evaluate(&frame, None).unwrap();
    assert_eq!(result.value, Value::Bool(true));
    assert!(!self_dict.has("x"));
}

#[test]
fn test_while_break_terminates() {
    let expr = Expression::While {
        condition: b(lit(true)),
        body: b(Expression::Break { di: di() }),
        di: di(),
    };
    let result = eval(&expr).unwrap();
    assert_eq!(result.value, Value::Empty);
    assert_eq!(result.code, ResultCode::Ok);
}

#[test]
fn test_while_accumulates() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("i", Value::Number(0.0));

    let expr = Expression::While {
        condition: b(Expression::LessThan {
            lhs: b(var("i")),
            rhs: b(lit(5.0)),
            di: di(),
        }),
        body: b(set_op(var("i"), SetOp::Add, lit(1.0))),
        di: di(),
    };

    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("i"), Value::Number(5.0));
}

#[test]
fn test_while_continue_skips() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("i", Value::Number(0.0));
    self_dict.insert("sum", Value::Number(0.0));

    // while (i < 5) { i += 1; if (i == 3) continue; sum += i }
    let body = dict(
        vec![
            set_op(var("i"), SetOp::Add, lit(1.0)),
            Expression::Conditional {
                condition: b(Expression::Equal {
                    lhs: b(var("i")),
                    rhs: b(lit(3.0)),
                    di: di(),
                }),
                true_branch: b(Expression::Continue { di: di() }),
                false_branch: None,
                di: di(),
            },
            set_op(var("sum"), SetOp::Add, var("i")),
        ],
        true,
    );

    let expr = Expression::While {
        condition: b(Expression::LessThan {
            lhs: b(var("i")),
            rhs: b(lit(5.0)),
            di: di(),
        }),
        body: b(body),
        di: di(),
    };

    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("sum"), Value::Number(12.0));
    assert_eq!(self_dict.get("i"), Value::Number(5.0));
}

fn nested_adds(levels: usize) -> Expression {
    let mut expr = lit(0.0);
    for _ in 0..levels {
        expr = add(expr, lit(1.0));
    }
    expr
}

#[test]
fn test_recursion_guard_boundary() {
    // 299 nested adds reach depth 300 exactly; one more crosses it.
    let (frame, _) = scoped_frame();
    assert!(nested_adds(299).evaluate(&frame, None).is_ok());
    assert_eq!(frame.depth(), 0);

    let err = nested_adds(300).evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::RecursionTooDeep);
    // The depth counter is restored even on the error path.
    assert_eq!(frame.depth(), 0);
}

#[test]
fn test_depth_restored_after_error() {
    let (frame, _) = scoped_frame();
    assert!(throw("bang").evaluate(&frame, None).is_err());
    assert_eq!(frame.depth(), 0);
}

#[test]
fn test_array_literal() {
    let expr = array(vec![lit(1.0), lit("x"), add(lit(1.0), lit(2.0))]);
    let result = eval(&expr).unwrap();
    let items = result.value.as_array().unwrap().snapshot();
    assert_eq!(
        items,
        vec![Value::Number(1.0), Value::string("x"), Value::Number(3.0)]
    );
}

#[test]
fn test_inline_dict_accumulates_into_self() {
    let (frame, self_dict) = scoped_frame();

    let expr = dict(
        vec![set(var("a"), lit(1.0)), set(var("b"), lit(2.0))],
        true,
    );

    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("a"), Value::Number(1.0));
    assert_eq!(self_dict.get("b"), Value::Number(2.0));
}

#[test]
fn test_non_inline_dict_returns_fresh_dictionary() {
    let (frame, self_dict) = scoped_frame();

    let expr = dict(vec![set(var("a"), lit(1.0))], false);
    let result = expr.evaluate(&frame, None).unwrap();

    let produced = result.value.as_dictionary().unwrap();
    assert_eq!(produced.get("a"), Value::Number(1.0));
    // The assignment went into the fresh dictionary, not the frame self.
    assert!(!self_dict.has("a"));
    assert!(frame.self_().as_dictionary().unwrap().ptr_eq(&self_dict));
}

#[test]
fn test_non_inline_dict_restores_self_on_error() {
    let (frame, self_dict) = scoped_frame();

    let expr = dict(vec![throw("inside body")], false);
    assert!(expr.evaluate(&frame, None).is_err());
    assert!(frame.self_().as_dictionary().unwrap().ptr_eq(&self_dict));
}

#[test]
fn test_indexer_reads_nested_fields() {
    let (frame, self_dict) = scoped_frame();
    let inner = Dictionary::new();
    inner.insert("port", Value::Number(5665.0));
    self_dict.insert("endpoint", inner.into());

    let expr = index(var("endpoint"), "port");
    assert_eq!(
        expr.evaluate(&frame, None).unwrap().value,
        Value::Number(5665.0)
    );
}

#[test]
fn test_set_through_indexer_creates_intermediate_dicts() {
    let (frame, self_dict) = scoped_frame();

    let expr = set(index(index(var("vars"), "disks"), "sda"), lit("used"));
    expr.evaluate(&frame, None).unwrap();

    let vars = self_dict.get("vars");
    let disks = vars.as_dictionary().unwrap().get("disks");
    assert_eq!(
        disks.as_dictionary().unwrap().get("sda"),
        Value::string("used")
    );
}

#[test]
fn test_set_does_not_overwrite_string_slot() {
    let (frame, self_dict) = scoped_frame();
    let holder = Dictionary::new();
    holder.insert("s", Value::string("keep"));
    self_dict.insert("obj", holder.clone().into());

    let expr = set(index(index(var("obj"), "s"), "b"), lit(1.0));
    let err = expr.evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
    assert_eq!(holder.get("s"), Value::string("keep"));
}

#[test]
fn test_augmented_assignments() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("n", Value::Number(10.0));

    set_op(var("n"), SetOp::Subtract, lit(3.0))
        .evaluate(&frame, None)
        .unwrap();
    assert_eq!(self_dict.get("n"), Value::Number(7.0));

    set_op(var("n"), SetOp::Multiply, lit(4.0))
        .evaluate(&frame, None)
        .unwrap();
    assert_eq!(self_dict.get("n"), Value::Number(28.0));

    set_op(var("n"), SetOp::BinaryAnd, lit(12.0))
        .evaluate(&frame, None)
        .unwrap();
    assert_eq!(self_dict.get("n"), Value::Number(12.0));
}

#[test]
fn test_membership_operators() {
    let haystack = array(vec![lit(1.0), lit(2.0), lit(3.0)]);
    let expr = Expression::In {
        lhs: b(lit(2.0)),
        rhs: b(haystack),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Bool(true));

    // Empty right side: `in` is trivially false, `not in` trivially true.
    let expr = Expression::In {
        lhs: b(lit(2.0)),
        rhs: b(lit(Value::Empty)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Bool(false));

    let expr = Expression::NotIn {
        lhs: b(lit(2.0)),
        rhs: b(lit(Value::Empty)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Bool(true));

    let expr = Expression::In {
        lhs: b(lit(2.0)),
        rhs: b(lit(5.0)),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap_err().kind, ErrorKind::TypeMismatch);
}

#[test]
fn test_variable_resolution_precedence() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("host_name", Value::string("from-self"));
    frame
        .locals()
        .insert("host_name", Value::string("from-locals"));

    assert_eq!(
        var("host_name").evaluate(&frame, None).unwrap().value,
        Value::string("from-locals")
    );

    let (frame2, self2) = scoped_frame();
    self2.insert("host_name", Value::string("from-self"));
    assert_eq!(
        var("host_name").evaluate(&frame2, None).unwrap().value,
        Value::string("from-self")
    );

    let import = Dictionary::new();
    import.insert("eval_tests_imported_name", Value::string("from-import"));
    ScriptFrame::add_import(import);
    assert_eq!(
        var("eval_tests_imported_name")
            .evaluate(&frame2, None)
            .unwrap()
            .value,
        Value::string("from-import")
    );

    ScriptGlobal::set("eval_tests_global_name", Value::string("from-globals"));
    assert_eq!(
        var("eval_tests_global_name")
            .evaluate(&frame2, None)
            .unwrap()
            .value,
        Value::string("from-globals")
    );

    let err = var("eval_tests_no_such_name")
        .evaluate(&frame2, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UndefinedVariable);
}

#[test]
fn test_get_scope() {
    let (frame, self_dict) = scoped_frame();

    let locals = Expression::GetScope {
        scope: ScopeSpecifier::Local,
        di: di(),
    }
    .evaluate(&frame, None)
    .unwrap();
    assert!(locals.value.as_dictionary().is_some());

    let this = Expression::GetScope {
        scope: ScopeSpecifier::This,
        di: di(),
    }
    .evaluate(&frame, None)
    .unwrap();
    assert!(this.value.as_dictionary().unwrap().ptr_eq(&self_dict));

    let global = Expression::GetScope {
        scope: ScopeSpecifier::Global,
        di: di(),
    }
    .evaluate(&frame, None)
    .unwrap();
    assert_eq!(global.value, ScriptGlobal::globals().into());
}

fn function_expr(
    params: Vec<&str>,
    closed_vars: Option<IndexMap<String, Expression>>,
    body: Expression,
) -> Expression {
    Expression::Function {
        params: params.into_iter().map(str::to_string).collect(),
        closed_vars,
        body: Arc::new(body),
        di: di(),
    }
}

#[test]
fn test_function_definition_and_call() {
    let (frame, self_dict) = scoped_frame();

    let body = Expression::Return {
        operand: b(add(var("a"), var("b"))),
        di: di(),
    };
    let func = function_expr(vec!["a", "b"], None, body)
        .evaluate(&frame, None)
        .unwrap();
    self_dict.insert("sum", func.value);

    let call = Expression::FunctionCall {
        callee: b(var("sum")),
        args: vec![lit(2.0), lit(3.0)],
        di: di(),
    };
    assert_eq!(call.evaluate(&frame, None).unwrap().value, Value::Number(5.0));
}

#[test]
fn test_function_captures_closed_vars() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("base", Value::Number(40.0));

    let mut closed = IndexMap::new();
    closed.insert("base".to_string(), var("base"));

    let body = Expression::Return {
        operand: b(add(var("base"), var("a"))),
        di: di(),
    };
    let func = function_expr(vec!["a"], Some(closed), body)
        .evaluate(&frame, None)
        .unwrap();

    // Change the original after capture; the closure must not see it.
    self_dict.insert("base", Value::Number(0.0));
    self_dict.insert("f", func.value);

    let call = Expression::FunctionCall {
        callee: b(var("f")),
        args: vec![lit(2.0)],
        di: di(),
    };
    assert_eq!(
        call.evaluate(&frame, None).unwrap().value,
        Value::Number(42.0)
    );
}

#[test]
fn test_function_call_arity_and_callee_errors() {
    let (frame, self_dict) = scoped_frame();

    let func = function_expr(vec!["a"], None, lit(Value::Empty))
        .evaluate(&frame, None)
        .unwrap();
    self_dict.insert("f", func.value);

    let call = Expression::FunctionCall {
        callee: b(var("f")),
        args: vec![],
        di: di(),
    };
    let err = call.evaluate(&frame, None).unwrap_err();
    assert!(err.message.contains("Too few arguments"));

    let call = Expression::FunctionCall {
        callee: b(lit(5.0)),
        args: vec![],
        di: di(),
    };
    let err = call.evaluate(&frame, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn test_method_call_binds_self() {
    let (frame, self_dict) = scoped_frame();

    let body = Expression::Return {
        operand: b(index(
            Expression::GetScope {
                scope: ScopeSpecifier::This,
                di: di(),
            },
            "tag",
        )),
        di: di(),
    };
    let method = function_expr(vec![], None, body)
        .evaluate(&frame, None)
        .unwrap();

    let obj = Dictionary::new();
    obj.insert("tag", Value::string("endpoint-zone"));
    obj.insert("describe", method.value);
    self_dict.insert("obj", obj.into());

    let call = Expression::FunctionCall {
        callee: b(index(var("obj"), "describe")),
        args: vec![],
        di: di(),
    };
    assert_eq!(
        call.evaluate(&frame, None).unwrap().value,
        Value::string("endpoint-zone")
    );
}

#[test]
fn test_constructor_call_through_types_namespace() {
    let (frame, _) = scoped_frame();

    let call = Expression::FunctionCall {
        callee: b(index(var("Types"), "Array")),
        args: vec![lit(1.0), lit(2.0)],
        di: di(),
    };
    let result = call.evaluate(&frame, None).unwrap();
    assert_eq!(result.value.as_array().unwrap().len(), 2);
}

#[test]
fn test_conditional() {
    let expr = Expression::Conditional {
        condition: b(lit(true)),
        true_branch: b(lit("yes")),
        false_branch: Some(b(lit("no"))),
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::string("yes"));

    let expr = Expression::Conditional {
        condition: b(lit(0.0)),
        true_branch: b(lit("yes")),
        false_branch: None,
        di: di(),
    };
    assert_eq!(eval(&expr).unwrap().value, Value::Empty);
}

#[test]
fn test_for_over_array() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("sum", Value::Number(0.0));

    let expr = Expression::For {
        key_var: "x".into(),
        value_var: None,
        iterable: b(array(vec![lit(1.0), lit(2.0), lit(3.0)])),
        body: b(set_op(var("sum"), SetOp::Add, var("x"))),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("sum"), Value::Number(6.0));
}

#[test]
fn test_for_over_array_with_index() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("indexes", Value::Number(0.0));

    let expr = Expression::For {
        key_var: "i".into(),
        value_var: Some("item".into()),
        iterable: b(array(vec![lit("a"), lit("b"), lit("c")])),
        body: b(set_op(var("indexes"), SetOp::Add, var("i"))),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("indexes"), Value::Number(3.0));
}

#[test]
fn test_for_over_dictionary() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("keys", Value::string(""));
    self_dict.insert("total", Value::Number(0.0));

    let input = Dictionary::new();
    input.insert("warn", Value::Number(80.0));
    input.insert("crit", Value::Number(95.0));

    let body = dict(
        vec![
            set_op(var("keys"), SetOp::Add, var("k")),
            set_op(var("total"), SetOp::Add, var("v")),
        ],
        true,
    );

    let expr = Expression::For {
        key_var: "k".into(),
        value_var: Some("v".into()),
        iterable: b(lit(Value::from(input))),
        body: b(body),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("keys"), Value::string("warncrit"));
    assert_eq!(self_dict.get("total"), Value::Number(175.0));

    // A single loop variable over a dictionary is refused.
    let expr = Expression::For {
        key_var: "k".into(),
        value_var: None,
        iterable: b(lit(Value::from(Dictionary::new()))),
        body: b(lit(Value::Empty)),
        di: di(),
    };
    assert!(expr.evaluate(&frame, None).is_err());
}

#[test]
fn test_for_respects_control_codes() {
    let (frame, self_dict) = scoped_frame();
    self_dict.insert("seen", Value::Number(0.0));

    // break after the second element
    let body = dict(
        vec![
            set_op(var("seen"), SetOp::Add, lit(1.0)),
            Expression::Conditional {
                condition: b(Expression::Equal {
                    lhs: b(var("x")),
                    rhs: b(lit(2.0)),
                    di: di(),
                }),
                true_branch: b(Expression::Break { di: di() }),
                false_branch: None,
                di: di(),
            },
        ],
        true,
    );
    let expr = Expression::For {
        key_var: "x".into(),
        value_var: None,
        iterable: b(array(vec![lit(1.0), lit(2.0), lit(3.0)])),
        body: b(body),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("seen"), Value::Number(2.0));

    // return bubbles out of the loop with its value
    let expr = Expression::For {
        key_var: "x".into(),
        value_var: None,
        iterable: b(array(vec![lit(1.0)])),
        body: b(Expression::Return {
            operand: b(lit(9.0)),
            di: di(),
        }),
        di: di(),
    };
    let result = expr.evaluate(&frame, None).unwrap();
    assert_eq!(result.code, ResultCode::Return);
    assert_eq!(result.value, Value::Number(9.0));
}

#[test]
fn test_throw_carries_flags() {
    let expr = Expression::Throw {
        message: b(lit("incomplete input")),
        incomplete: true,
        di: di(),
    };
    let err = eval(&expr).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Script);
    assert!(err.incomplete);
    assert_eq!(err.message, "incomplete input");
}

#[test]
fn test_import_evaluates_template_body() {
    let template_body = dict(vec![set(var("address"), lit("10.0.0.1"))], true);
    config::register_item(config::ConfigItem::new(
        "Host",
        "eval-tests-base-template",
        true,
        "",
        "_etc",
        false,
        None,
        Dictionary::new(),
        Arc::new(template_body),
        DebugInfo::default(),
    ))
    .unwrap();

    let (frame, self_dict) = scoped_frame();
    self_dict.insert("type", Value::string("Host"));

    let expr = Expression::Import {
        name: b(lit("eval-tests-base-template")),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(self_dict.get("address"), Value::string("10.0.0.1"));

    let expr = Expression::Import {
        name: b(lit("eval-tests-missing-template")),
        di: di(),
    };
    let err = expr.evaluate(&frame, None).unwrap_err();
    assert!(err.message.contains("unknown template"));

    config::remove_item("Host", "eval-tests-base-template");
}

#[test]
fn test_object_definition_registers_item() {
    let (frame, _) = scoped_frame();

    let expr = Expression::Object {
        abstract_: false,
        type_name: "Host".into(),
        name: Some(b(lit("eval-tests-web01"))),
        filter: None,
        zone: "".into(),
        package: "_etc".into(),
        ignore_on_error: false,
        closed_vars: None,
        body: Arc::new(dict(vec![set(var("address"), lit("192.0.2.1"))], true)),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();

    let item = config::ConfigItem::get_by_type_and_name("Host", "eval-tests-web01").unwrap();
    assert!(!item.is_abstract());
    assert_eq!(item.package(), "_etc");
    config::remove_item("Host", "eval-tests-web01");
}

#[test]
fn test_apply_records_rule() {
    let (frame, _) = scoped_frame();

    let expr = Expression::Apply {
        type_name: "Service".into(),
        target_type: "Host".into(),
        name: b(lit("eval-tests-load")),
        filter: Some(Arc::new(lit(true))),
        package: "_etc".into(),
        fk_var: None,
        fv_var: None,
        f_term: None,
        closed_vars: None,
        ignore_on_error: false,
        body: Arc::new(dict(vec![], true)),
        di: di(),
    };
    expr.evaluate(&frame, None).unwrap();

    let rules = config::apply_rules_for_type("Service");
    assert!(rules.iter().any(|rule| rule.name == "eval-tests-load"));
}

#[test]
fn test_bind_to_scope_rewrites_names() {
    let (frame, _) = scoped_frame();
    frame.locals().insert("port", Value::Number(5665.0));

    let mut expr = var("port");
    bind_to_scope(&mut expr, ScopeSpecifier::Local);
    assert!(matches!(expr, Expression::Indexer { .. }));
    assert_eq!(
        expr.evaluate(&frame, None).unwrap().value,
        Value::Number(5665.0)
    );

    // String literals are bound the same way.
    let mut expr = lit("port");
    bind_to_scope(&mut expr, ScopeSpecifier::Local);
    assert_eq!(
        expr.evaluate(&frame, None).unwrap().value,
        Value::Number(5665.0)
    );

    // Dict elements and Set targets are rewritten recursively.
    let mut expr = dict(vec![set(var("bound_target"), lit(1.0))], true);
    bind_to_scope(&mut expr, ScopeSpecifier::Local);
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(frame.locals().get("bound_target"), Value::Number(1.0));
}

#[test]
fn test_breakpoint_bus() {
    let marker = DebugInfo::new("eval-tests-breakpoint-marker.conf", 1, 1, 1, 1);
    let hits = Arc::new(AtomicUsize::new(0));
    let errors_seen = Arc::new(AtomicUsize::new(0));

    let hits_clone = Arc::clone(&hits);
    let errors_clone = Arc::clone(&errors_seen);
    let marker_path = marker.path.clone();
    let subscription = Expression::on_breakpoint(move |frame, error, location| {
        if location.path != marker_path {
            return;
        }
        hits_clone.fetch_add(1, Ordering::SeqCst);
        if error.is_some() {
            errors_clone.fetch_add(1, Ordering::SeqCst);
        }
        // Errors raised inside a handler must not re-enter the bus.
        let reentrant = Expression::Throw {
            message: Box::new(make_literal("from handler")),
            incomplete: false,
            di: location.clone(),
        };
        let _ = reentrant.evaluate(frame, None);
    });

    let (frame, _) = scoped_frame();

    let expr = Expression::Breakpoint { di: marker.clone() };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(errors_seen.load(Ordering::SeqCst), 0);

    let expr = Expression::Throw {
        message: b(lit("observed")),
        incomplete: false,
        di: marker.clone(),
    };
    assert!(expr.evaluate(&frame, None).is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(errors_seen.load(Ordering::SeqCst), 1);

    subscription.disconnect();
    let expr = Expression::Breakpoint { di: marker };
    expr.evaluate(&frame, None).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

struct StubCompiler;

impl config::ConfigCompiler for StubCompiler {
    fn handle_include(
        &self,
        _relative_base: &str,
        path: &str,
        _search_includes: bool,
        _zone: &str,
        _package: &str,
        _debug_info: &DebugInfo,
    ) -> std::result::Result<Box<Expression>, Box<dyn std::error::Error + Send + Sync>> {
        if path == "missing.conf" {
            return Err(format!("failed to open '{}'", path).into());
        }
        Ok(Box::new(make_literal(format!("included:{}", path))))
    }

    fn handle_include_recursive(
        &self,
        _relative_base: &str,
        path: &str,
        pattern: &str,
        _zone: &str,
        _package: &str,
        _debug_info: &DebugInfo,
    ) -> std::result::Result<Box<Expression>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Box::new(make_literal(format!("glob:{}/{}", path, pattern))))
    }

    fn handle_include_zones(
        &self,
        _relative_base: &str,
        name: &str,
        path: &str,
        _pattern: &str,
        _package: &str,
        _debug_info: &DebugInfo,
    ) -> std::result::Result<Box<Expression>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Box::new(make_literal(format!("zones:{}:{}", name, path))))
    }
}

fn include_expr(kind: conscript::IncludeKind, path: &str) -> Expression {
    Expression::Include {
        kind,
        path: b(lit(path)),
        pattern: Some(b(lit("*.conf"))),
        name: Some(b(lit("master"))),
        search_includes: false,
        relative_base: "/etc/conscript".into(),
        zone: "".into(),
        package: "_etc".into(),
        di: di(),
    }
}

#[test]
fn test_include_goes_through_registered_compiler() {
    use conscript::IncludeKind;

    // Before a compiler is registered the directive fails cleanly.
    let err = eval(&include_expr(IncludeKind::Regular, "conf.d/hosts.conf")).unwrap_err();
    assert!(err.message.contains("config compiler"));

    config::set_compiler(StubCompiler);

    let result = eval(&include_expr(IncludeKind::Regular, "conf.d/hosts.conf")).unwrap();
    assert_eq!(result.value, Value::string("included:conf.d/hosts.conf"));

    let result = eval(&include_expr(IncludeKind::Recursive, "conf.d")).unwrap();
    assert_eq!(result.value, Value::string("glob:conf.d/*.conf"));

    let result = eval(&include_expr(IncludeKind::Zones, "zones.d")).unwrap();
    assert_eq!(result.value, Value::string("zones:master:zones.d"));

    // Host errors are wrapped with location context and a nested cause.
    let err = eval(&include_expr(IncludeKind::Regular, "missing.conf")).unwrap_err();
    assert!(err.message.starts_with("Error while evaluating expression:"));
    assert!(err.cause.is_some());
}

#[test]
fn test_library_goes_through_loader_hook() {
    use std::sync::Mutex;

    static LOADED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    config::set_library_loader(|path| {
        LOADED.lock().unwrap().push(path.to_string());
        Ok(())
    });

    let expr = Expression::Library {
        path: b(lit("methods")),
        di: di(),
    };
    eval(&expr).unwrap();
    assert!(LOADED.lock().unwrap().contains(&"methods".to_string()));
}

#[test]
fn test_imports_snapshot_is_stable_across_writers() {
    let before = ScriptFrame::imports();
    let before_len = before.len();

    let handle = std::thread::spawn(|| {
        let marker = Dictionary::new();
        marker.insert("eval_tests_cow_marker", Value::Bool(true));
        ScriptFrame::add_import(marker);
    });
    handle.join().unwrap();

    // The old snapshot is untouched; a fresh snapshot sees the import.
    assert_eq!(before.len(), before_len);
    assert!(!before.iter().any(|d| d.has("eval_tests_cow_marker")));
    assert!(ScriptFrame::imports()
        .iter()
        .any(|d| d.has("eval_tests_cow_marker")));
}

#[test]
fn test_set_annotates_debug_hint() {
    use conscript::DebugHint;

    let (frame, _) = scoped_frame();
    let hint = DebugHint::new();

    let location = DebugInfo::new("hosts.conf", 7, 3, 7, 21);
    let expr = Expression::Set {
        target: b(var("address")),
        op: SetOp::Literal,
        value: b(lit("192.0.2.9")),
        di: location,
    };
    expr.evaluate(&frame, Some(&hint)).unwrap();

    // The assignment recorded an "=" message on the field's hint node.
    let address_hint = hint.child("address").to_value();
    let messages = address_hint.as_dictionary().unwrap().get("messages");
    let messages = messages.as_array().unwrap().snapshot();
    assert_eq!(messages.len(), 1);
    let entry = messages[0].as_array().unwrap().snapshot();
    assert_eq!(entry[0], Value::string("="));
    assert_eq!(entry[1], Value::string("hosts.conf"));
}

#[test]
fn test_side_effect_free_function_value() {
    // Function values built by the host can opt into sandbox calls.
    let body = Arc::new(make_literal(7.0));
    let func = Function::new(vec![], None, true, body);
    assert!(func.is_side_effect_free());
    assert!(Value::from(func).as_function().is_some());
}
