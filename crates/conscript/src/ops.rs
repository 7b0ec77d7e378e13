//! VM operations: the runtime behaviour behind variable resolution,
//! field access, calls, closures, object registration and `for` loops.
//!
//! Everything here is stateless; all runtime state lives in the frame,
//! the value heap objects, and the registries in [`crate::config`].

use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::{self, ApplyRule, ConfigItem};
use crate::debug::DebugInfo;
use crate::error::{Result, ScriptError};
use crate::expression::{Expression, ExpressionResult, ResultCode};
use crate::frame::ScriptFrame;
use crate::globals::ScriptGlobal;
use crate::value::{Dictionary, Function, Type, Value};

/// Resolve a free name: locals first, then the own fields of `self`,
/// then the import chain in order, then the script globals.
pub(crate) fn variable(frame: &ScriptFrame, name: &str, di: &DebugInfo) -> Result<Value> {
    if frame.has_locals() && frame.locals().has(name) {
        return Ok(frame.locals().get(name));
    }

    if let Some(dict) = frame.self_().as_dictionary() {
        if dict.has(name) {
            return Ok(dict.get(name));
        }
    }

    for import in ScriptFrame::imports().iter() {
        if import.has(name) {
            return Ok(import.get(name));
        }
    }

    if ScriptGlobal::exists(name) {
        return Ok(ScriptGlobal::get(name));
    }

    Err(ScriptError::undefined_variable(name, di.clone()))
}

/// Read a field of a container value.
///
/// Missing dictionary keys read as Empty; array and string indexes are
/// bounds-checked. Reading through the empty value yields Empty, so
/// chained lookups over absent config sections do not fail.
pub(crate) fn get_field(
    parent: &Value,
    field: &Value,
    sandboxed: bool,
    di: &DebugInfo,
) -> Result<Value> {
    match parent {
        Value::Empty => Ok(Value::Empty),

        Value::Object(obj) => match obj {
            crate::value::Object::Dictionary(dict) => {
                let key = field_to_key(field);
                Ok(dict.get(&key))
            }

            crate::value::Object::Array(arr) => {
                let index = array_index(field, di)?;
                arr.get(index).ok_or_else(|| {
                    ScriptError::new(
                        format!("Array index {} is out of bounds", index),
                        di.clone(),
                    )
                })
            }

            crate::value::Object::Function(_) | crate::value::Object::Type(_) => {
                if sandboxed {
                    Err(ScriptError::sandbox(
                        "Accessing object internals is not allowed in sandbox mode.",
                        di.clone(),
                    ))
                } else {
                    Err(ScriptError::type_mismatch(
                        format!("Cannot access field on value of type '{}'", parent.type_name()),
                        di.clone(),
                    ))
                }
            }
        },

        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let index = array_index(field, di)?;
            match chars.get(index) {
                Some(ch) => Ok(Value::string(ch.to_string())),
                None => Err(ScriptError::new(
                    format!("String index {} is out of bounds", index),
                    di.clone(),
                )),
            }
        }

        _ => Err(ScriptError::type_mismatch(
            format!("Cannot access field on value of type '{}'", parent.type_name()),
            di.clone(),
        )),
    }
}

/// Store through a (container, index) reference.
pub(crate) fn set_field(parent: &Value, field: &str, value: Value, di: &DebugInfo) -> Result<()> {
    match parent {
        Value::Object(crate::value::Object::Dictionary(dict)) => {
            dict.insert(field, value);
            Ok(())
        }

        Value::Object(crate::value::Object::Array(arr)) => {
            let index = array_index(&Value::string(field), di)?;
            if arr.set(index, value) {
                Ok(())
            } else {
                Err(ScriptError::new(
                    format!("Array index {} is out of bounds", index),
                    di.clone(),
                ))
            }
        }

        _ => Err(ScriptError::type_mismatch(
            format!("Cannot set field on value of type '{}'", parent.type_name()),
            di.clone(),
        )),
    }
}

fn field_to_key(field: &Value) -> String {
    match field.as_str() {
        Some(s) => s.to_string(),
        None => field.to_string(),
    }
}

fn array_index(field: &Value, di: &DebugInfo) -> Result<usize> {
    let number = match field {
        Value::String(s) => s.parse::<f64>().ok(),
        other => other.as_number(),
    };

    match number {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(ScriptError::type_mismatch(
            format!("'{}' is not a valid index", field),
            di.clone(),
        )),
    }
}

/// Call a script function: a child frame bound to `self`, locals built
/// from the captured environment and the parameters, the body evaluated,
/// and any `return` unwrapped to its value.
pub(crate) fn function_call(
    frame: &ScriptFrame,
    call_self: Value,
    func: &Function,
    args: Vec<Value>,
    di: &DebugInfo,
) -> Result<Value> {
    if args.len() < func.params().len() {
        return Err(ScriptError::new(
            format!(
                "Too few arguments for function call: {} given, {} expected",
                args.len(),
                func.params().len()
            ),
            di.clone(),
        ));
    }

    let self_val = if call_self.is_empty() {
        frame.self_()
    } else {
        call_self
    };

    let child = ScriptFrame::with_self(self_val);

    let locals = Dictionary::new();
    if let Some(env) = func.env() {
        for (name, value) in env.snapshot() {
            locals.insert(name, value);
        }
    }
    for (param, arg) in func.params().iter().zip(args) {
        locals.insert(param.clone(), arg);
    }
    child.set_locals(locals);

    let result = func.body().evaluate(&child, None)?;
    Ok(result.value)
}

/// Invoke a constructible type.
pub(crate) fn constructor_call(ty: &Type, args: &[Value], di: &DebugInfo) -> Result<Value> {
    ty.construct(args).map_err(|mut err| {
        if err.location.is_empty() {
            err.location = di.clone();
        }
        err
    })
}

fn evaluate_closed_vars(
    frame: &ScriptFrame,
    closed_vars: Option<&IndexMap<String, Expression>>,
) -> Result<Option<Dictionary>> {
    match closed_vars {
        None => Ok(None),
        Some(vars) => {
            let env = Dictionary::new();
            for (name, expr) in vars {
                env.insert(name.clone(), expr.evaluate(frame, None)?.value);
            }
            Ok(Some(env))
        }
    }
}

/// Build a function value, capturing the closed-over variables from the
/// current frame.
pub(crate) fn new_function(
    frame: &ScriptFrame,
    params: &[String],
    closed_vars: Option<&IndexMap<String, Expression>>,
    body: &Arc<Expression>,
) -> Result<Value> {
    let env = evaluate_closed_vars(frame, closed_vars)?;
    Ok(Function::new(params.to_vec(), env, false, Arc::clone(body)).into())
}

/// Register a configuration object. Duplicate type+name is an error
/// unless the object is flagged ignore-on-error.
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_object(
    frame: &ScriptFrame,
    abstract_: bool,
    type_name: &str,
    name: &str,
    filter: Option<Arc<Expression>>,
    zone: &str,
    package: &str,
    ignore_on_error: bool,
    closed_vars: Option<&IndexMap<String, Expression>>,
    body: &Arc<Expression>,
    di: &DebugInfo,
) -> Result<Value> {
    let scope = evaluate_closed_vars(frame, closed_vars)?.unwrap_or_default();

    let item = ConfigItem::new(
        type_name,
        name,
        abstract_,
        zone,
        package,
        ignore_on_error,
        filter,
        scope,
        Arc::clone(body),
        di.clone(),
    );

    match config::register_item(item) {
        Ok(_) => Ok(Value::Empty),
        Err(_) if ignore_on_error => Ok(Value::Empty),
        Err(err) => Err(err),
    }
}

/// Record an apply rule for later instantiation by the host.
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_apply(
    frame: &ScriptFrame,
    type_name: &str,
    target_type: &str,
    name: &str,
    filter: Option<Arc<Expression>>,
    package: &str,
    fk_var: Option<&str>,
    fv_var: Option<&str>,
    f_term: Option<Arc<Expression>>,
    closed_vars: Option<&IndexMap<String, Expression>>,
    ignore_on_error: bool,
    body: &Arc<Expression>,
    di: &DebugInfo,
) -> Result<Value> {
    let scope = evaluate_closed_vars(frame, closed_vars)?.unwrap_or_default();

    config::add_apply_rule(ApplyRule::new(
        type_name,
        target_type,
        name,
        filter,
        package,
        fk_var,
        fv_var,
        f_term,
        scope,
        ignore_on_error,
        Arc::clone(body),
        di.clone(),
    ));

    Ok(Value::Empty)
}

/// Iterate a container, binding the loop variables into the frame locals.
///
/// Arrays bind the element to the single variable, or index and element
/// when two variables are given. Dictionaries require two variables and
/// bind key and value in insertion order.
pub(crate) fn for_(
    frame: &ScriptFrame,
    key_var: &str,
    value_var: Option<&str>,
    iterable: Value,
    body: &Expression,
    di: &DebugInfo,
) -> Result<ExpressionResult> {
    if let Some(arr) = iterable.as_array() {
        for (index, item) in arr.snapshot().into_iter().enumerate() {
            match value_var {
                Some(value_var) => {
                    frame.locals().insert(key_var, Value::from(index));
                    frame.locals().insert(value_var, item);
                }
                None => frame.locals().insert(key_var, item),
            }

            let result = body.evaluate(frame, None)?;
            match result.code {
                ResultCode::Return => return Ok(result),
                ResultCode::Break => break,
                _ => {}
            }
        }

        return Ok(ExpressionResult::new(Value::Empty));
    }

    if let Some(dict) = iterable.as_dictionary() {
        let Some(value_var) = value_var else {
            return Err(ScriptError::new(
                "One iterator variable is not allowed when iterating over a dictionary",
                di.clone(),
            ));
        };

        for (key, value) in dict.snapshot() {
            frame.locals().insert(key_var, Value::string(key));
            frame.locals().insert(value_var, value);

            let result = body.evaluate(frame, None)?;
            match result.code {
                ResultCode::Return => return Ok(result),
                ResultCode::Break => break,
                _ => {}
            }
        }

        return Ok(ExpressionResult::new(Value::Empty));
    }

    Err(ScriptError::type_mismatch(
        format!("Cannot iterate value of type '{}'", iterable.type_name()),
        di.clone(),
    ))
}
