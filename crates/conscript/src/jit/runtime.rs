//! Host helpers the emitted code calls, and the table describing them.
//!
//! Every helper is an `extern "C"` function registered as an imported
//! symbol of the JIT module. Helpers never unwind: fallible operations
//! report failure through the returned status code and stash the error in
//! a thread-local slot that [`super::JitExpression::do_evaluate`] drains.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use cranelift_codegen::ir::types;
use cranelift_codegen::ir::Type as ClifType;

use super::{code_of, CODE_ERROR, CODE_OK};
use crate::debug::{DebugHint, DebugInfo};
use crate::error::ScriptError;
use crate::expression::Expression;
use crate::frame::ScriptFrame;
use crate::operators;
use crate::value::{Array, Value};

thread_local! {
    static PENDING_ERROR: RefCell<Option<ScriptError>> = const { RefCell::new(None) };
}

pub(super) fn set_pending_error(err: ScriptError) {
    PENDING_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

pub(super) fn take_pending_error() -> ScriptError {
    PENDING_ERROR
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| {
            ScriptError::new(
                "Compiled expression failed without a recorded error",
                DebugInfo::default(),
            )
        })
}

/// Parameter shapes a helper can take. Pointer-sized integers (lengths,
/// addresses) all travel as `Ptr`.
#[derive(Clone, Copy)]
pub(super) enum ParamKind {
    Ptr,
    F64,
    I32,
}

impl ParamKind {
    pub(super) fn clif_type(self, pointer_type: ClifType) -> ClifType {
        match self {
            ParamKind::Ptr => pointer_type,
            ParamKind::F64 => types::F64,
            ParamKind::I32 => types::I32,
        }
    }
}

pub(super) struct HelperSpec {
    pub name: &'static str,
    pub ptr: *const u8,
    pub params: &'static [ParamKind],
    pub returns_code: bool,
}

use self::ParamKind::{F64, I32, Ptr};

/// Every host function the emitted code may call.
pub(super) fn helper_specs() -> Vec<HelperSpec> {
    macro_rules! spec {
        ($name:literal, $func:ident, [$($param:expr),*], $returns:expr) => {
            HelperSpec {
                name: $name,
                ptr: $func as *const u8,
                params: &[$($param),*],
                returns_code: $returns,
            }
        };
    }

    vec![
        spec!("new_empty", jit_new_empty, [Ptr], false),
        spec!("new_bool", jit_new_bool, [I32, Ptr], false),
        spec!("new_number", jit_new_number, [F64, Ptr], false),
        spec!("new_string", jit_new_string, [Ptr, Ptr, Ptr], false),
        spec!("drop_value", jit_drop_value, [Ptr], false),
        spec!("value_is_true", jit_value_is_true, [Ptr], true),
        spec!("value_negate", jit_value_negate, [Ptr], true),
        spec!("value_logical_negate", jit_value_logical_negate, [Ptr], false),
        spec!("value_add", jit_value_add, [Ptr, Ptr], true),
        spec!("value_subtract", jit_value_subtract, [Ptr, Ptr], true),
        spec!("value_multiply", jit_value_multiply, [Ptr, Ptr], true),
        spec!("value_divide", jit_value_divide, [Ptr, Ptr], true),
        spec!("value_modulo", jit_value_modulo, [Ptr, Ptr], true),
        spec!("value_xor", jit_value_xor, [Ptr, Ptr], true),
        spec!("value_binary_and", jit_value_binary_and, [Ptr, Ptr], true),
        spec!("value_binary_or", jit_value_binary_or, [Ptr, Ptr], true),
        spec!("value_shift_left", jit_value_shift_left, [Ptr, Ptr], true),
        spec!("value_shift_right", jit_value_shift_right, [Ptr, Ptr], true),
        spec!("value_equal", jit_value_equal, [Ptr, Ptr], true),
        spec!("value_not_equal", jit_value_not_equal, [Ptr, Ptr], true),
        spec!("value_less_than", jit_value_less_than, [Ptr, Ptr], true),
        spec!("value_greater_than", jit_value_greater_than, [Ptr, Ptr], true),
        spec!(
            "value_less_than_or_equal",
            jit_value_less_than_or_equal,
            [Ptr, Ptr],
            true
        ),
        spec!(
            "value_greater_than_or_equal",
            jit_value_greater_than_or_equal,
            [Ptr, Ptr],
            true
        ),
        spec!("new_array", jit_new_array, [Ptr], false),
        spec!("array_add", jit_array_add, [Ptr, Ptr], false),
        spec!("scope_local", jit_scope_local, [Ptr, Ptr], false),
        spec!("scope_this", jit_scope_this, [Ptr, Ptr], false),
        spec!("scope_global", jit_scope_global, [Ptr], false),
        spec!("invoke", jit_invoke, [Ptr, Ptr, Ptr, Ptr], true),
        spec!("drop_expression", jit_drop_expression, [Ptr], false),
        spec!("free_string", jit_free_string, [Ptr, Ptr], false),
    ]
}

extern "C" fn jit_new_empty(res: *mut Value) {
    // SAFETY: emitted code passes a pointer to an uninitialised Value slot.
    unsafe { res.write(Value::Empty) }
}

extern "C" fn jit_new_bool(value: i32, res: *mut Value) {
    // SAFETY: as above.
    unsafe { res.write(Value::Bool(value != 0)) }
}

extern "C" fn jit_new_number(value: f64, res: *mut Value) {
    // SAFETY: as above.
    unsafe { res.write(Value::Number(value)) }
}

extern "C" fn jit_new_string(ptr: *const u8, len: usize, res: *mut Value) {
    // SAFETY: `ptr`/`len` describe a byte buffer leaked at emission time
    // from a valid &str; it stays alive until the compiled dtor frees it.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    // SAFETY: the buffer was copied out of a &str, so it is valid UTF-8.
    let s = unsafe { std::str::from_utf8_unchecked(bytes) };
    // SAFETY: `res` is an uninitialised Value slot.
    unsafe { res.write(Value::string(s)) }
}

extern "C" fn jit_drop_value(value: *mut Value) {
    // SAFETY: emitted code only drops slots it previously initialised,
    // exactly once.
    unsafe { std::ptr::drop_in_place(value) }
}

extern "C" fn jit_value_is_true(value: *const Value) -> i32 {
    // SAFETY: points at a live Value.
    let value = unsafe { &*value };
    value.is_true() as i32
}

extern "C" fn jit_value_negate(value: *mut Value) -> i32 {
    // SAFETY: points at a live Value slot that stays initialised.
    let value = unsafe { &mut *value };
    match operators::negate(value) {
        Ok(result) => {
            *value = result;
            CODE_OK
        }
        Err(err) => {
            *value = Value::Empty;
            set_pending_error(err);
            CODE_ERROR
        }
    }
}

extern "C" fn jit_value_logical_negate(value: *mut Value) {
    // SAFETY: points at a live Value slot.
    let value = unsafe { &mut *value };
    *value = operators::logical_negate(value);
}

/// `*op2out = op(op1, *op2out)` for fallible operators.
macro_rules! binary_helper {
    ($name:ident, $op:path) => {
        extern "C" fn $name(op1: *const Value, op2out: *mut Value) -> i32 {
            // SAFETY: both pointers address live, distinct Value slots.
            let (a, out) = unsafe { (&*op1, &mut *op2out) };
            match $op(a, out) {
                Ok(result) => {
                    *out = result;
                    CODE_OK
                }
                Err(err) => {
                    *out = Value::Empty;
                    set_pending_error(err);
                    CODE_ERROR
                }
            }
        }
    };
}

/// `*op2out = op(op1, *op2out)` for comparisons, which cannot fail.
macro_rules! compare_helper {
    ($name:ident, $op:path) => {
        extern "C" fn $name(op1: *const Value, op2out: *mut Value) -> i32 {
            // SAFETY: both pointers address live, distinct Value slots.
            let (a, out) = unsafe { (&*op1, &mut *op2out) };
            *out = $op(a, out);
            CODE_OK
        }
    };
}

binary_helper!(jit_value_add, operators::add);
binary_helper!(jit_value_subtract, operators::subtract);
binary_helper!(jit_value_multiply, operators::multiply);
binary_helper!(jit_value_divide, operators::divide);
binary_helper!(jit_value_modulo, operators::modulo);
binary_helper!(jit_value_xor, operators::xor);
binary_helper!(jit_value_binary_and, operators::binary_and);
binary_helper!(jit_value_binary_or, operators::binary_or);
binary_helper!(jit_value_shift_left, operators::shift_left);
binary_helper!(jit_value_shift_right, operators::shift_right);

compare_helper!(jit_value_equal, operators::equal);
compare_helper!(jit_value_not_equal, operators::not_equal);
compare_helper!(jit_value_less_than, operators::less_than);
compare_helper!(jit_value_greater_than, operators::greater_than);
compare_helper!(jit_value_less_than_or_equal, operators::less_than_or_equal);
compare_helper!(
    jit_value_greater_than_or_equal,
    operators::greater_than_or_equal
);

extern "C" fn jit_new_array(res: *mut Value) {
    // SAFETY: `res` is an uninitialised Value slot.
    unsafe { res.write(Array::new().into()) }
}

extern "C" fn jit_array_add(array: *const Value, item: *const Value) {
    // SAFETY: both point at live Values; `array` was produced by
    // jit_new_array.
    let (array, item) = unsafe { (&*array, &*item) };
    if let Some(arr) = array.as_array() {
        arr.add(item.clone());
    }
}

extern "C" fn jit_scope_local(frame: *const ScriptFrame, res: *mut Value) {
    // SAFETY: `frame` is the live frame the compiled routine was entered
    // with; `res` is an uninitialised slot.
    let frame = unsafe { &*frame };
    unsafe { res.write(frame.locals().into()) }
}

extern "C" fn jit_scope_this(frame: *const ScriptFrame, res: *mut Value) {
    // SAFETY: as above.
    let frame = unsafe { &*frame };
    unsafe { res.write(frame.self_()) }
}

extern "C" fn jit_scope_global(res: *mut Value) {
    // SAFETY: `res` is an uninitialised slot.
    unsafe { res.write(crate::globals::ScriptGlobal::globals().into()) }
}

/// Interpreter fallback: run a node that was not lowered. The returned
/// status is the result code, or [`CODE_ERROR`] with the error stashed.
/// Panics are contained here; unwinding into emitted frames would be
/// undefined behaviour.
extern "C" fn jit_invoke(
    expr: *const Expression,
    frame: *const ScriptFrame,
    dhint: *const DebugHint,
    res: *mut Value,
) -> i32 {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `expr` was leaked at emission time and is freed only by
        // the compiled dtor; `frame` is the live evaluation frame;
        // `dhint` is either null or a live hint.
        let expr = unsafe { &*expr };
        let frame = unsafe { &*frame };
        let dhint = if dhint.is_null() {
            None
        } else {
            Some(unsafe { &*dhint })
        };
        expr.do_evaluate(frame, dhint)
    }));

    match outcome {
        Ok(Ok(result)) => {
            let code = code_of(result.code);
            // SAFETY: `res` is an uninitialised slot.
            unsafe { res.write(result.value) };
            code
        }
        Ok(Err(err)) => {
            // SAFETY: as above.
            unsafe { res.write(Value::Empty) };
            set_pending_error(err);
            CODE_ERROR
        }
        Err(_) => {
            // SAFETY: as above.
            unsafe { res.write(Value::Empty) };
            set_pending_error(ScriptError::new(
                "Panic while evaluating expression",
                DebugInfo::default(),
            ));
            CODE_ERROR
        }
    }
}

extern "C" fn jit_drop_expression(expr: *mut Expression) {
    // SAFETY: `expr` was produced by Box::into_raw at emission time and
    // is dropped exactly once, by the compiled dtor.
    drop(unsafe { Box::from_raw(expr) });
}

extern "C" fn jit_free_string(ptr: *mut u8, len: usize) {
    // SAFETY: reconstructs the boxed byte buffer leaked at emission time.
    let slice = std::ptr::slice_from_raw_parts_mut(ptr, len);
    drop(unsafe { Box::from_raw(slice) });
}
