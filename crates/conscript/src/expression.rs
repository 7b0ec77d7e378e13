//! The expression AST and the tree-walking evaluator.
//!
//! Every node kind of the configuration language is one variant of
//! [`Expression`]. Evaluation goes through [`Expression::evaluate`], which
//! owns the depth bookkeeping and breakpoint signalling, and dispatches to
//! the variant-specific logic. Nodes that can be assigned to additionally
//! resolve to an L-value through `get_reference`.
//!
//! Control flow (`return`, `break`, `continue`) is not modelled as errors:
//! it travels in [`ExpressionResult::code`] and is consumed by the nearest
//! enclosing loop or call.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::config;
use crate::debug::{DebugHint, DebugInfo};
use crate::error::{Result, ScriptError};
use crate::frame::ScriptFrame;
use crate::globals::ScriptGlobal;
use crate::operators;
use crate::ops;
use crate::value::{json_encode, Array, Dictionary, Value};

#[cfg(feature = "jit")]
use crate::jit::JitExpression;

/// How an evaluation finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Return,
    Break,
    Continue,
}

/// The value of an evaluation together with its control code.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionResult {
    pub value: Value,
    pub code: ResultCode,
}

impl ExpressionResult {
    pub fn new(value: Value) -> Self {
        ExpressionResult {
            value,
            code: ResultCode::Ok,
        }
    }

    pub fn with_code(value: Value, code: ResultCode) -> Self {
        ExpressionResult { value, code }
    }
}

impl From<Value> for ExpressionResult {
    fn from(value: Value) -> Self {
        ExpressionResult::new(value)
    }
}

/// Which scope a [`Expression::GetScope`] node reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeSpecifier {
    Local,
    This,
    Global,
}

/// The combined-assignment operator of a [`Expression::Set`] node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOp {
    Literal,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Xor,
    BinaryAnd,
    BinaryOr,
}

/// The flavour of an include directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeKind {
    Regular,
    Recursive,
    Zones,
}

/// An L-value: the container and index an assignment writes through,
/// plus the debug-hint node recording annotations for that slot.
pub(crate) struct Reference {
    pub parent: Value,
    pub index: String,
    pub hint: Option<DebugHint>,
}

/// One node of the configuration-script AST.
#[derive(Debug)]
pub enum Expression {
    Literal {
        value: Value,
        di: DebugInfo,
    },
    Variable {
        name: String,
        di: DebugInfo,
    },
    GetScope {
        scope: ScopeSpecifier,
        di: DebugInfo,
    },
    Negate {
        operand: Box<Expression>,
        di: DebugInfo,
    },
    LogicalNegate {
        operand: Box<Expression>,
        di: DebugInfo,
    },
    Add { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Subtract { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Multiply { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Divide { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Modulo { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Xor { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    BinaryAnd { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    BinaryOr { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    ShiftLeft { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    ShiftRight { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Equal { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    NotEqual { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    LessThan { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    GreaterThan { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    LessThanOrEqual { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    GreaterThanOrEqual { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    In { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    NotIn { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    LogicalAnd { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    LogicalOr { lhs: Box<Expression>, rhs: Box<Expression>, di: DebugInfo },
    Array {
        items: Vec<Expression>,
        di: DebugInfo,
    },
    /// A dictionary body. Inline bodies (`{ ... }` appearing as a value)
    /// evaluate their elements against the current `self`; non-inline
    /// bodies swap a fresh dictionary into `frame.self` for the duration
    /// and return it.
    Dict {
        items: Vec<Expression>,
        inline: bool,
        di: DebugInfo,
    },
    Indexer {
        parent: Box<Expression>,
        index: Box<Expression>,
        di: DebugInfo,
    },
    FunctionCall {
        callee: Box<Expression>,
        args: Vec<Expression>,
        di: DebugInfo,
    },
    Set {
        target: Box<Expression>,
        op: SetOp,
        value: Box<Expression>,
        di: DebugInfo,
    },
    Conditional {
        condition: Box<Expression>,
        true_branch: Box<Expression>,
        false_branch: Option<Box<Expression>>,
        di: DebugInfo,
    },
    While {
        condition: Box<Expression>,
        body: Box<Expression>,
        di: DebugInfo,
    },
    For {
        key_var: String,
        value_var: Option<String>,
        iterable: Box<Expression>,
        body: Box<Expression>,
        di: DebugInfo,
    },
    Return {
        operand: Box<Expression>,
        di: DebugInfo,
    },
    Break {
        di: DebugInfo,
    },
    Continue {
        di: DebugInfo,
    },
    Throw {
        message: Box<Expression>,
        incomplete: bool,
        di: DebugInfo,
    },
    Function {
        params: Vec<String>,
        closed_vars: Option<IndexMap<String, Expression>>,
        body: Arc<Expression>,
        di: DebugInfo,
    },
    Apply {
        type_name: String,
        target_type: String,
        name: Box<Expression>,
        filter: Option<Arc<Expression>>,
        package: String,
        fk_var: Option<String>,
        fv_var: Option<String>,
        f_term: Option<Arc<Expression>>,
        closed_vars: Option<IndexMap<String, Expression>>,
        ignore_on_error: bool,
        body: Arc<Expression>,
        di: DebugInfo,
    },
    Object {
        abstract_: bool,
        type_name: String,
        name: Option<Box<Expression>>,
        filter: Option<Arc<Expression>>,
        zone: String,
        package: String,
        ignore_on_error: bool,
        closed_vars: Option<IndexMap<String, Expression>>,
        body: Arc<Expression>,
        di: DebugInfo,
    },
    Import {
        name: Box<Expression>,
        di: DebugInfo,
    },
    Include {
        kind: IncludeKind,
        path: Box<Expression>,
        pattern: Option<Box<Expression>>,
        name: Option<Box<Expression>>,
        search_includes: bool,
        relative_base: String,
        zone: String,
        package: String,
        di: DebugInfo,
    },
    Library {
        path: Box<Expression>,
        di: DebugInfo,
    },
    Breakpoint {
        di: DebugInfo,
    },
    /// A subtree lowered to native code. Owns the compiled routines.
    #[cfg(feature = "jit")]
    Jit(JitExpression),
}

/// `literal(value)` with no source location.
pub fn make_literal(value: impl Into<Value>) -> Expression {
    Expression::Literal {
        value: value.into(),
        di: DebugInfo::default(),
    }
}

/// `scope[name]` — how bound names are rewritten.
pub fn make_indexer(scope: ScopeSpecifier, index: &str) -> Expression {
    Expression::Indexer {
        parent: Box::new(Expression::GetScope {
            scope,
            di: DebugInfo::default(),
        }),
        index: Box::new(make_literal(index)),
        di: DebugInfo::default(),
    }
}

// ---------------------------------------------------------------------------
// Breakpoint bus
// ---------------------------------------------------------------------------

/// Subscriber signature for [`Expression::on_breakpoint`].
pub type BreakpointHandler = dyn Fn(&ScriptFrame, Option<&ScriptError>, &DebugInfo) + Send + Sync;

static BREAKPOINT_HANDLERS: Lazy<RwLock<Vec<(u64, Arc<BreakpointHandler>)>>> =
    Lazy::new(|| RwLock::new(Vec::new()));
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static IN_BREAKPOINT_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// Handle returned by [`Expression::on_breakpoint`]; disconnect to stop
/// receiving events.
pub struct BreakpointSubscription {
    id: u64,
}

impl BreakpointSubscription {
    pub fn disconnect(self) {
        let mut handlers = BREAKPOINT_HANDLERS
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.retain(|(id, _)| *id != self.id);
    }
}

/// Fire the breakpoint broadcast unless a handler is already running on
/// this thread; recursive invocations are suppressed, not failed.
pub(crate) fn script_breakpoint(frame: &ScriptFrame, error: Option<&ScriptError>, di: &DebugInfo) {
    let entered = IN_BREAKPOINT_HANDLER.with(|flag| {
        if flag.get() {
            false
        } else {
            flag.set(true);
            true
        }
    });

    if !entered {
        return;
    }

    let handlers: Vec<Arc<BreakpointHandler>> = BREAKPOINT_HANDLERS
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();

    for handler in handlers {
        handler(frame, error, di);
    }

    IN_BREAKPOINT_HANDLER.with(|flag| flag.set(false));
}

/// Return the enclosing evaluation result when a sub-evaluation produced
/// a control code.
macro_rules! check_result {
    ($result:expr) => {
        if $result.code != ResultCode::Ok {
            return Ok($result);
        }
    };
}

/// Loop-body variant: `break` leaves the loop, `return` bubbles out,
/// `continue` falls through to the next iteration.
macro_rules! check_result_loop {
    ($result:expr) => {
        match $result.code {
            ResultCode::Return => return Ok($result),
            ResultCode::Break => break,
            _ => {}
        }
    };
}

impl Expression {
    /// Subscribe to the breakpoint broadcast. The handler fires for
    /// explicit breakpoint nodes and for every script error leaving a
    /// node on its way out.
    pub fn on_breakpoint(
        handler: impl Fn(&ScriptFrame, Option<&ScriptError>, &DebugInfo) + Send + Sync + 'static,
    ) -> BreakpointSubscription {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, AtomicOrdering::Relaxed);
        BREAKPOINT_HANDLERS
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(handler)));
        BreakpointSubscription { id }
    }

    /// The source region this node was parsed from.
    pub fn debug_info(&self) -> &DebugInfo {
        static EMPTY: Lazy<DebugInfo> = Lazy::new(DebugInfo::default);

        match self {
            Expression::Literal { di, .. }
            | Expression::Variable { di, .. }
            | Expression::GetScope { di, .. }
            | Expression::Negate { di, .. }
            | Expression::LogicalNegate { di, .. }
            | Expression::Add { di, .. }
            | Expression::Subtract { di, .. }
            | Expression::Multiply { di, .. }
            | Expression::Divide { di, .. }
            | Expression::Modulo { di, .. }
            | Expression::Xor { di, .. }
            | Expression::BinaryAnd { di, .. }
            | Expression::BinaryOr { di, .. }
            | Expression::ShiftLeft { di, .. }
            | Expression::ShiftRight { di, .. }
            | Expression::Equal { di, .. }
            | Expression::NotEqual { di, .. }
            | Expression::LessThan { di, .. }
            | Expression::GreaterThan { di, .. }
            | Expression::LessThanOrEqual { di, .. }
            | Expression::GreaterThanOrEqual { di, .. }
            | Expression::In { di, .. }
            | Expression::NotIn { di, .. }
            | Expression::LogicalAnd { di, .. }
            | Expression::LogicalOr { di, .. }
            | Expression::Array { di, .. }
            | Expression::Dict { di, .. }
            | Expression::Indexer { di, .. }
            | Expression::FunctionCall { di, .. }
            | Expression::Set { di, .. }
            | Expression::Conditional { di, .. }
            | Expression::While { di, .. }
            | Expression::For { di, .. }
            | Expression::Return { di, .. }
            | Expression::Break { di, .. }
            | Expression::Continue { di, .. }
            | Expression::Throw { di, .. }
            | Expression::Function { di, .. }
            | Expression::Apply { di, .. }
            | Expression::Object { di, .. }
            | Expression::Import { di, .. }
            | Expression::Include { di, .. }
            | Expression::Library { di, .. }
            | Expression::Breakpoint { di, .. } => di,
            #[cfg(feature = "jit")]
            Expression::Jit(_) => &EMPTY,
        }
    }

    /// Evaluate this expression in `frame`.
    ///
    /// This is the sole public entry point for running an AST: it bounds
    /// the recursion depth (restoring it on every exit path) and fires
    /// the breakpoint broadcast for errors leaving this node.
    pub fn evaluate(
        &self,
        frame: &ScriptFrame,
        dhint: Option<&DebugHint>,
    ) -> Result<ExpressionResult> {
        if let Err(err) = frame.increase_stack_depth() {
            script_breakpoint(frame, Some(&err), self.debug_info());
            return Err(err);
        }

        let result = self.do_evaluate(frame, dhint);
        frame.decrease_stack_depth();

        if let Err(err) = &result {
            script_breakpoint(frame, Some(err), self.debug_info());
        }

        result
    }

    pub(crate) fn do_evaluate(
        &self,
        frame: &ScriptFrame,
        dhint: Option<&DebugHint>,
    ) -> Result<ExpressionResult> {
        match self {
            Expression::Literal { value, .. } => Ok(value.clone().into()),

            Expression::Variable { name, di } => {
                ops::variable(frame, name, di).map(ExpressionResult::new)
            }

            Expression::GetScope { scope, .. } => {
                let value = match scope {
                    ScopeSpecifier::Local => frame.locals().into(),
                    ScopeSpecifier::This => frame.self_(),
                    ScopeSpecifier::Global => ScriptGlobal::globals().into(),
                };
                Ok(ExpressionResult::new(value))
            }

            Expression::Negate { operand, .. } => {
                operators::negate(&operand.evaluate(frame, None)?.value).map(ExpressionResult::new)
            }

            Expression::LogicalNegate { operand, .. } => Ok(ExpressionResult::new(
                operators::logical_negate(&operand.evaluate(frame, None)?.value),
            )),

            Expression::Add { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::add),
            Expression::Subtract { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::subtract),
            Expression::Multiply { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::multiply),
            Expression::Divide { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::divide),
            Expression::Modulo { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::modulo),
            Expression::Xor { lhs, rhs, .. } => binary_op(frame, lhs, rhs, operators::xor),
            Expression::BinaryAnd { lhs, rhs, .. } => {
                binary_op(frame, lhs, rhs, operators::binary_and)
            }
            Expression::BinaryOr { lhs, rhs, .. } => {
                binary_op(frame, lhs, rhs, operators::binary_or)
            }
            Expression::ShiftLeft { lhs, rhs, .. } => {
                binary_op(frame, lhs, rhs, operators::shift_left)
            }
            Expression::ShiftRight { lhs, rhs, .. } => {
                binary_op(frame, lhs, rhs, operators::shift_right)
            }

            Expression::Equal { lhs, rhs, .. } => binary_cmp(frame, lhs, rhs, operators::equal),
            Expression::NotEqual { lhs, rhs, .. } => {
                binary_cmp(frame, lhs, rhs, operators::not_equal)
            }
            Expression::LessThan { lhs, rhs, .. } => {
                binary_cmp(frame, lhs, rhs, operators::less_than)
            }
            Expression::GreaterThan { lhs, rhs, .. } => {
                binary_cmp(frame, lhs, rhs, operators::greater_than)
            }
            Expression::LessThanOrEqual { lhs, rhs, .. } => {
                binary_cmp(frame, lhs, rhs, operators::less_than_or_equal)
            }
            Expression::GreaterThanOrEqual { lhs, rhs, .. } => {
                binary_cmp(frame, lhs, rhs, operators::greater_than_or_equal)
            }

            Expression::In { lhs, rhs, di } => {
                Ok(ExpressionResult::new(Value::Bool(evaluate_membership(
                    frame, lhs, rhs, di,
                )?)))
            }

            Expression::NotIn { lhs, rhs, di } => {
                Ok(ExpressionResult::new(Value::Bool(!evaluate_membership(
                    frame, lhs, rhs, di,
                )?)))
            }

            Expression::LogicalAnd { lhs, rhs, .. } => {
                let operand1 = lhs.evaluate(frame, None)?;
                if !operand1.value.is_true() {
                    Ok(operand1)
                } else {
                    Ok(rhs.evaluate(frame, None)?.value.into())
                }
            }

            Expression::LogicalOr { lhs, rhs, .. } => {
                let operand1 = lhs.evaluate(frame, None)?;
                if operand1.value.is_true() {
                    Ok(operand1)
                } else {
                    Ok(rhs.evaluate(frame, None)?.value.into())
                }
            }

            Expression::Array { items, .. } => {
                let result = Array::new();
                for item in items {
                    result.add(item.evaluate(frame, None)?.value);
                }
                Ok(ExpressionResult::new(result.into()))
            }

            Expression::Dict { items, inline, .. } => {
                if *inline {
                    let mut result = Value::Empty;
                    for item in items {
                        let element = item.evaluate(frame, dhint)?;
                        check_result!(element);
                        result = element.value;
                    }
                    return Ok(ExpressionResult::new(result));
                }

                // Evaluate the body against a fresh dictionary swapped into
                // `self`; the original is restored on every exit path.
                let mut swapped: Value = Dictionary::new().into();
                frame.swap_self(&mut swapped);

                let outcome = (|| -> Result<ExpressionResult> {
                    let mut last = ExpressionResult::new(Value::Empty);
                    for item in items {
                        last = item.evaluate(frame, dhint)?;
                        if last.code != ResultCode::Ok {
                            break;
                        }
                    }
                    Ok(last)
                })();

                frame.swap_self(&mut swapped);

                match outcome {
                    Err(err) => Err(err),
                    Ok(result) if result.code != ResultCode::Ok => Ok(result),
                    Ok(_) => Ok(ExpressionResult::new(swapped)),
                }
            }

            Expression::Indexer { parent, index, di } => {
                let container = parent.evaluate(frame, dhint)?.value;
                let field = index.evaluate(frame, dhint)?.value;
                ops::get_field(&container, &field, frame.sandboxed(), di)
                    .map(ExpressionResult::new)
            }

            Expression::FunctionCall { callee, args, di } => {
                let mut call_self = Value::Empty;
                let vfunc = match callee.get_reference(frame, false, None)? {
                    Some(reference) => {
                        let func = ops::get_field(
                            &reference.parent,
                            &Value::string(&reference.index),
                            frame.sandboxed(),
                            di,
                        )?;
                        call_self = reference.parent;
                        func
                    }
                    None => callee.evaluate(frame, None)?.value,
                };

                if let Some(ty) = vfunc.as_type() {
                    let mut arguments = Vec::with_capacity(args.len());
                    for arg in args {
                        arguments.push(arg.evaluate(frame, None)?.value);
                    }
                    return ops::constructor_call(ty, &arguments, di).map(ExpressionResult::new);
                }

                let Some(func) = vfunc.as_function() else {
                    return Err(ScriptError::type_mismatch(
                        "Argument is not a callable object.",
                        di.clone(),
                    ));
                };

                if frame.sandboxed() && !func.is_side_effect_free() {
                    return Err(ScriptError::sandbox(
                        "Function is not marked as safe for sandbox mode.",
                        di.clone(),
                    ));
                }

                let mut arguments = Vec::with_capacity(args.len());
                for arg in args {
                    arguments.push(arg.evaluate(frame, None)?.value);
                }

                ops::function_call(frame, call_self, func, arguments, di)
                    .map(ExpressionResult::new)
            }

            Expression::Set {
                target,
                op,
                value,
                di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Assignments are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let reference = target.get_reference(frame, true, dhint)?.ok_or_else(|| {
                    ScriptError::new("Expression cannot be assigned to.", di.clone())
                })?;

                let mut operand2 = value.evaluate(frame, dhint)?.value;

                if *op != SetOp::Literal {
                    let object = ops::get_field(
                        &reference.parent,
                        &Value::string(&reference.index),
                        frame.sandboxed(),
                        di,
                    )?;
                    operand2 = match op {
                        SetOp::Add => operators::add(&object, &operand2)?,
                        SetOp::Subtract => operators::subtract(&object, &operand2)?,
                        SetOp::Multiply => operators::multiply(&object, &operand2)?,
                        SetOp::Divide => operators::divide(&object, &operand2)?,
                        SetOp::Modulo => operators::modulo(&object, &operand2)?,
                        SetOp::Xor => operators::xor(&object, &operand2)?,
                        SetOp::BinaryAnd => operators::binary_and(&object, &operand2)?,
                        SetOp::BinaryOr => operators::binary_or(&object, &operand2)?,
                        SetOp::Literal => unreachable!(),
                    };
                }

                ops::set_field(&reference.parent, &reference.index, operand2, di)?;

                if let Some(hint) = &reference.hint {
                    hint.add_message("=", di);
                }

                Ok(ExpressionResult::new(Value::Empty))
            }

            Expression::Conditional {
                condition,
                true_branch,
                false_branch,
                ..
            } => {
                if condition.evaluate(frame, None)?.value.is_true() {
                    true_branch.evaluate(frame, dhint)
                } else if let Some(false_branch) = false_branch {
                    false_branch.evaluate(frame, dhint)
                } else {
                    Ok(ExpressionResult::new(Value::Empty))
                }
            }

            Expression::While {
                condition, body, di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "While loops are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                loop {
                    if !condition.evaluate(frame, None)?.value.is_true() {
                        break;
                    }

                    let loop_body = body.evaluate(frame, dhint)?;
                    check_result_loop!(loop_body);
                }

                Ok(ExpressionResult::new(Value::Empty))
            }

            Expression::For {
                key_var,
                value_var,
                iterable,
                body,
                di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "For loops are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let iterable = iterable.evaluate(frame, dhint)?.value;
                ops::for_(frame, key_var, value_var.as_deref(), iterable, body, di)
            }

            Expression::Return { operand, .. } => {
                let mut operand = operand.evaluate(frame, None)?;
                operand.code = ResultCode::Return;
                Ok(operand)
            }

            Expression::Break { .. } => Ok(ExpressionResult::with_code(
                Value::Empty,
                ResultCode::Break,
            )),

            Expression::Continue { .. } => Ok(ExpressionResult::with_code(
                Value::Empty,
                ResultCode::Continue,
            )),

            Expression::Throw {
                message,
                incomplete,
                di,
            } => {
                let message = message.evaluate(frame, None)?.value;
                let mut err = ScriptError::new(message.to_string(), di.clone());
                if *incomplete {
                    err = err.incomplete();
                }
                Err(err)
            }

            Expression::Function {
                params,
                closed_vars,
                body,
                ..
            } => ops::new_function(frame, params, closed_vars.as_ref(), body)
                .map(ExpressionResult::new),

            Expression::Apply {
                type_name,
                target_type,
                name,
                filter,
                package,
                fk_var,
                fv_var,
                f_term,
                closed_vars,
                ignore_on_error,
                body,
                di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Apply rules are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let name = name.evaluate(frame, None)?.value;
                ops::new_apply(
                    frame,
                    type_name,
                    target_type,
                    &name.to_string(),
                    filter.clone(),
                    package,
                    fk_var.as_deref(),
                    fv_var.as_deref(),
                    f_term.clone(),
                    closed_vars.as_ref(),
                    *ignore_on_error,
                    body,
                    di,
                )
                .map(ExpressionResult::new)
            }

            Expression::Object {
                abstract_,
                type_name,
                name,
                filter,
                zone,
                package,
                ignore_on_error,
                closed_vars,
                body,
                di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Object definitions are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let object_name = match name {
                    Some(name) => name.evaluate(frame, None)?.value.to_string(),
                    None => String::new(),
                };

                ops::new_object(
                    frame,
                    *abstract_,
                    type_name,
                    &object_name,
                    filter.clone(),
                    zone,
                    package,
                    *ignore_on_error,
                    closed_vars.as_ref(),
                    body,
                    di,
                )
                .map(ExpressionResult::new)
            }

            Expression::Import { name, di } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Imports are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let type_name = ops::get_field(
                    &frame.self_(),
                    &Value::string("type"),
                    frame.sandboxed(),
                    di,
                )?
                .to_string();

                let name = name.evaluate(frame, None)?.value;
                let Some(name) = name.as_str() else {
                    return Err(ScriptError::type_mismatch(
                        "Template/object name must be a string",
                        di.clone(),
                    ));
                };

                let item = config::ConfigItem::get_by_type_and_name(&type_name, name)
                    .ok_or_else(|| {
                        ScriptError::new(
                            format!("Import references unknown template: '{}'", name),
                            di.clone(),
                        )
                    })?;

                let result = item.expression().evaluate(frame, dhint)?;
                Ok(ExpressionResult::new(result.value))
            }

            Expression::Include {
                kind,
                path,
                pattern,
                name,
                search_includes,
                relative_base,
                zone,
                package,
                di,
            } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Includes are not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let compiler = config::compiler().ok_or_else(|| {
                    ScriptError::new(
                        "No config compiler is registered for include directives",
                        di.clone(),
                    )
                })?;

                let path = path.evaluate(frame, None)?.value.to_string();

                let expr = match kind {
                    IncludeKind::Regular => compiler
                        .handle_include(relative_base, &path, *search_includes, zone, package, di),
                    IncludeKind::Recursive => {
                        let pattern = evaluate_optional_string(frame, pattern.as_deref())?;
                        compiler.handle_include_recursive(
                            relative_base,
                            &path,
                            &pattern,
                            zone,
                            package,
                            di,
                        )
                    }
                    IncludeKind::Zones => {
                        let name = evaluate_optional_string(frame, name.as_deref())?;
                        let pattern = evaluate_optional_string(frame, pattern.as_deref())?;
                        compiler.handle_include_zones(
                            relative_base,
                            &name,
                            &path,
                            &pattern,
                            package,
                            di,
                        )
                    }
                }
                .map_err(|cause| ScriptError::wrap(cause, di.clone()))?;

                // `expr` is owned and dropped on every exit path.
                expr.evaluate(frame, dhint)
            }

            Expression::Library { path, di } => {
                if frame.sandboxed() {
                    return Err(ScriptError::sandbox(
                        "Loading libraries is not allowed in sandbox mode.",
                        di.clone(),
                    ));
                }

                let path = path.evaluate(frame, None)?.value.to_string();
                config::load_extension_library(&path)
                    .map_err(|cause| ScriptError::wrap(cause, di.clone()))?;

                Ok(ExpressionResult::new(Value::Empty))
            }

            Expression::Breakpoint { di } => {
                script_breakpoint(frame, None, di);
                Ok(ExpressionResult::new(Value::Empty))
            }

            #[cfg(feature = "jit")]
            Expression::Jit(jit) => jit.do_evaluate(frame, dhint),
        }
    }

    /// Resolve this node to an L-value, following the same precedence as
    /// evaluation. `init_dict` creates an empty dictionary in empty
    /// intermediate slots (never in sandbox mode, and never overwriting
    /// strings). Returns `None` for nodes that cannot be assigned to.
    pub(crate) fn get_reference(
        &self,
        frame: &ScriptFrame,
        init_dict: bool,
        dhint: Option<&DebugHint>,
    ) -> Result<Option<Reference>> {
        match self {
            Expression::Variable { name, .. } => {
                if frame.has_locals() && frame.locals().has(name) {
                    return Ok(Some(Reference {
                        parent: frame.locals().into(),
                        index: name.clone(),
                        hint: None,
                    }));
                }

                let self_val = frame.self_();
                if let Some(dict) = self_val.as_dictionary() {
                    let self_is_locals =
                        frame.has_locals() && frame.locals().ptr_eq(dict);
                    if !self_is_locals && dict.has(name) {
                        return Ok(Some(Reference {
                            parent: self_val.clone(),
                            index: name.clone(),
                            hint: dhint.map(|hint| hint.child(name)),
                        }));
                    }
                }

                if ScriptGlobal::exists(name) {
                    Ok(Some(Reference {
                        parent: ScriptGlobal::globals().into(),
                        index: name.clone(),
                        hint: None,
                    }))
                } else {
                    Ok(Some(Reference {
                        parent: frame.self_(),
                        index: name.clone(),
                        hint: dhint.map(|hint| hint.child(name)),
                    }))
                }
            }

            Expression::Indexer { parent, index, di } => {
                let init_dict = init_dict && !frame.sandboxed();

                let (parent_value, parent_hint) =
                    match parent.get_reference(frame, init_dict, dhint)? {
                        Some(reference) => {
                            if init_dict {
                                let old_value = ops::get_field(
                                    &reference.parent,
                                    &Value::string(&reference.index),
                                    frame.sandboxed(),
                                    parent.debug_info(),
                                )?;

                                if old_value.is_empty() && !old_value.is_string() {
                                    ops::set_field(
                                        &reference.parent,
                                        &reference.index,
                                        Dictionary::new().into(),
                                        parent.debug_info(),
                                    )?;
                                }
                            }

                            let value = ops::get_field(
                                &reference.parent,
                                &Value::string(&reference.index),
                                frame.sandboxed(),
                                di,
                            )?;
                            (value, reference.hint)
                        }
                        None => (parent.evaluate(frame, None)?.value, dhint.cloned()),
                    };

                let index = index.evaluate(frame, None)?.value.to_string();
                let hint = parent_hint.map(|hint| hint.child(&index));

                Ok(Some(Reference {
                    parent: parent_value,
                    index,
                    hint,
                }))
            }

            _ => Ok(None),
        }
    }
}

fn binary_op(
    frame: &ScriptFrame,
    lhs: &Expression,
    rhs: &Expression,
    op: fn(&Value, &Value) -> Result<Value>,
) -> Result<ExpressionResult> {
    let a = lhs.evaluate(frame, None)?.value;
    let b = rhs.evaluate(frame, None)?.value;
    op(&a, &b).map(ExpressionResult::new)
}

fn binary_cmp(
    frame: &ScriptFrame,
    lhs: &Expression,
    rhs: &Expression,
    op: fn(&Value, &Value) -> Value,
) -> Result<ExpressionResult> {
    let a = lhs.evaluate(frame, None)?.value;
    let b = rhs.evaluate(frame, None)?.value;
    Ok(ExpressionResult::new(op(&a, &b)))
}

/// Shared logic of `in`/`not in`: the right side must be an array (or
/// empty, which trivially contains nothing). Membership compares the
/// evaluated value of the left side.
fn evaluate_membership(
    frame: &ScriptFrame,
    lhs: &Expression,
    rhs: &Expression,
    di: &DebugInfo,
) -> Result<bool> {
    let operand2 = rhs.evaluate(frame, None)?;

    if operand2.value.is_empty() {
        return Ok(false);
    }

    let Some(arr) = operand2.value.as_array() else {
        return Err(ScriptError::type_mismatch(
            format!(
                "Invalid right side argument for 'in' operator: {}",
                json_encode(&operand2.value)
            ),
            di.clone(),
        ));
    };

    let needle = lhs.evaluate(frame, None)?.value;
    Ok(arr.contains(&needle))
}

fn evaluate_optional_string(frame: &ScriptFrame, expr: Option<&Expression>) -> Result<String> {
    match expr {
        Some(expr) => Ok(expr.evaluate(frame, None)?.value.to_string()),
        None => Ok(String::new()),
    }
}

/// Rewrite an AST in place so bare name references become lookups
/// relative to `scope`: `Variable` nodes and string literals turn into
/// `Indexer(GetScope(scope), literal)`; `Dict` elements, `Set` targets
/// and `Indexer` parents are rewritten recursively.
pub fn bind_to_scope(expr: &mut Expression, scope: ScopeSpecifier) {
    #[cfg(feature = "jit")]
    debug_assert!(
        !matches!(expr, Expression::Jit(_)),
        "cannot rebind a compiled expression"
    );

    match expr {
        Expression::Dict { items, .. } => {
            for item in items {
                bind_to_scope(item, scope);
            }
        }

        Expression::Set { target, .. } => bind_to_scope(target, scope),

        Expression::Indexer { parent, .. } => bind_to_scope(parent, scope),

        Expression::Variable { .. }
        | Expression::Literal {
            value: Value::String(_),
            ..
        } => {
            let di = expr.debug_info().clone();
            let old = std::mem::replace(expr, Expression::Break { di: di.clone() });

            let index = match old {
                Expression::Variable { name, di } => Expression::Literal {
                    value: Value::string(name),
                    di,
                },
                literal @ Expression::Literal { .. } => literal,
                _ => unreachable!(),
            };

            *expr = Expression::Indexer {
                parent: Box::new(Expression::GetScope {
                    scope,
                    di: di.clone(),
                }),
                index: Box::new(index),
                di,
            };
        }

        _ => {}
    }
}
