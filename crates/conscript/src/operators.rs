//! Binary and unary operators over [`Value`].
//!
//! This module implements the script operators:
//! - Arithmetic: +, -, *, /, %
//! - Bitwise: ^, &, |, <<, >>, unary ~
//! - Comparison: ==, !=, <, <=, >, >=
//!
//! Arithmetic accepts numbers and booleans (0/1); `+` additionally
//! concatenates strings, treating the empty value as `""`. Bitwise and
//! shift operators coerce both operands to a 64-bit signed integer.
//! Comparisons across different tags follow the total order over values.

use std::cmp::Ordering;

use crate::debug::DebugInfo;
use crate::error::{Result, ScriptError};
use crate::value::Value;

fn operand_error(op: &str, a: &Value, b: &Value) -> ScriptError {
    ScriptError::arithmetic(
        format!(
            "Operator '{}' cannot be applied to operands of type '{}' and '{}'",
            op,
            a.type_name(),
            b.type_name()
        ),
        DebugInfo::default(),
    )
}

fn as_i64(op: &str, a: &Value, b: &Value, operand: &Value) -> Result<i64> {
    operand
        .as_number()
        .map(|n| n as i64)
        .ok_or_else(|| operand_error(op, a, b))
}

pub fn add(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(Value::string(format!("{}{}", x, y))),
        (Value::String(x), Value::Empty) => Ok(Value::String(x.clone())),
        (Value::Empty, Value::String(y)) => Ok(Value::String(y.clone())),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok(Value::Number(x + y)),
            _ => Err(operand_error("+", a, b)),
        },
    }
}

pub fn subtract(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop("-", a, b, |x, y| x - y)
}

pub fn multiply(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop("*", a, b, |x, y| x * y)
}

/// IEEE-754 division: numeric division by zero yields an infinity or NaN
/// rather than an error.
pub fn divide(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop("/", a, b, |x, y| x / y)
}

/// Truncating integer modulo after coercion.
pub fn modulo(a: &Value, b: &Value) -> Result<Value> {
    let x = as_i64("%", a, b, a)?;
    let y = as_i64("%", a, b, b)?;
    if y == 0 {
        return Err(ScriptError::arithmetic("Modulo by zero", DebugInfo::default()));
    }
    Ok(Value::Number((x % y) as f64))
}

pub fn xor(a: &Value, b: &Value) -> Result<Value> {
    integer_binop("^", a, b, |x, y| x ^ y)
}

pub fn binary_and(a: &Value, b: &Value) -> Result<Value> {
    integer_binop("&", a, b, |x, y| x & y)
}

pub fn binary_or(a: &Value, b: &Value) -> Result<Value> {
    integer_binop("|", a, b, |x, y| x | y)
}

pub fn shift_left(a: &Value, b: &Value) -> Result<Value> {
    shift("<<", a, b, |x, y| x << y)
}

pub fn shift_right(a: &Value, b: &Value) -> Result<Value> {
    shift(">>", a, b, |x, y| x >> y)
}

/// Bitwise complement of the integer coercion.
pub fn negate(a: &Value) -> Result<Value> {
    let x = a
        .as_number()
        .map(|n| n as i64)
        .ok_or_else(|| operand_error("~", a, a))?;
    Ok(Value::Number(!x as f64))
}

pub fn logical_negate(a: &Value) -> Value {
    Value::Bool(!a.is_true())
}

pub fn equal(a: &Value, b: &Value) -> Value {
    Value::Bool(a == b)
}

pub fn not_equal(a: &Value, b: &Value) -> Value {
    Value::Bool(a != b)
}

pub fn less_than(a: &Value, b: &Value) -> Value {
    Value::Bool(a.total_cmp(b) == Ordering::Less)
}

pub fn greater_than(a: &Value, b: &Value) -> Value {
    Value::Bool(a.total_cmp(b) == Ordering::Greater)
}

pub fn less_than_or_equal(a: &Value, b: &Value) -> Value {
    Value::Bool(a.total_cmp(b) != Ordering::Greater)
}

pub fn greater_than_or_equal(a: &Value, b: &Value) -> Value {
    Value::Bool(a.total_cmp(b) != Ordering::Less)
}

fn numeric_binop<F>(op: &str, a: &Value, b: &Value, f: F) -> Result<Value>
where
    F: Fn(f64, f64) -> f64,
{
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(Value::Number(f(x, y))),
        _ => Err(operand_error(op, a, b)),
    }
}

fn integer_binop<F>(op: &str, a: &Value, b: &Value, f: F) -> Result<Value>
where
    F: Fn(i64, i64) -> i64,
{
    let x = as_i64(op, a, b, a)?;
    let y = as_i64(op, a, b, b)?;
    Ok(Value::Number(f(x, y) as f64))
}

fn shift<F>(op: &str, a: &Value, b: &Value, f: F) -> Result<Value>
where
    F: Fn(i64, u32) -> i64,
{
    let x = as_i64(op, a, b, a)?;
    let y = as_i64(op, a, b, b)?;
    if !(0..64).contains(&y) {
        return Err(ScriptError::arithmetic(
            format!("Shift amount {} is out of range", y),
            DebugInfo::default(),
        ));
    }
    Ok(Value::Number(f(x, y as u32) as f64))
}
