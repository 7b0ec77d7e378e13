//! The cranelift-based JIT backend.
//!
//! [`JitExpression::new`] lowers a whole expression tree into two native
//! routines built in lock-step inside one JIT module:
//!
//! - `evaluate(frame, dhint, out) -> i32` leaves an owned [`Value`] at
//!   `out` and returns the result code (negative means a host error was
//!   stashed for the caller);
//! - `dtor()` frees everything captured at emission time: leaked string
//!   buffers and the interpreter-fallback nodes, in emission order.
//!
//! A node kind is lowered only where the emitted code reproduces the
//! interpreter exactly. Operand positions whose result codes the
//! interpreter discards must not be able to yield a code at all
//! ([`can_yield_code`]); everything else falls back to an emitted call
//! into the interpreter. Children of fallback nodes are still wrapped as
//! independent sub-compilations where possible, so arithmetic below an
//! assignment or call keeps running natively.

mod runtime;

use std::collections::HashMap;
use std::fmt;
use std::mem::MaybeUninit;

use cranelift_codegen::ir::{
    types, AbiParam, FuncRef, Function, InstBuilder, StackSlotData, StackSlotKind, UserFuncName,
    Value as ClifValue,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use target_lexicon::Triple;
use thiserror::Error;

use crate::debug::{DebugHint, DebugInfo};
use crate::error::Result;
use crate::expression::{make_literal, Expression, ExpressionResult, ResultCode, ScopeSpecifier};
use crate::frame::ScriptFrame;
use crate::value::Value;

pub(crate) const CODE_OK: i32 = 0;
pub(crate) const CODE_RETURN: i32 = 1;
pub(crate) const CODE_BREAK: i32 = 2;
pub(crate) const CODE_CONTINUE: i32 = 3;
pub(crate) const CODE_ERROR: i32 = -1;

pub(crate) fn code_of(code: ResultCode) -> i32 {
    match code {
        ResultCode::Ok => CODE_OK,
        ResultCode::Return => CODE_RETURN,
        ResultCode::Break => CODE_BREAK,
        ResultCode::Continue => CODE_CONTINUE,
    }
}

fn code_to_result(code: i32) -> ResultCode {
    match code {
        CODE_RETURN => ResultCode::Return,
        CODE_BREAK => ResultCode::Break,
        CODE_CONTINUE => ResultCode::Continue,
        _ => ResultCode::Ok,
    }
}

/// Why a tree could not be compiled.
#[derive(Error)]
pub enum JitError {
    /// The root node kind is interpreted-only. The tree is handed back
    /// unchanged apart from children that were compiled independently.
    #[error("expression does not support JIT compilation")]
    Unsupported(Box<Expression>),
    /// Code generation itself failed.
    #[error("JIT code generation failed: {0}")]
    Codegen(String),
}

impl fmt::Debug for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Unsupported(_) => f.write_str("JitError::Unsupported"),
            JitError::Codegen(message) => write!(f, "JitError::Codegen({:?})", message),
        }
    }
}

type JitEvaluateFn = unsafe extern "C" fn(*const ScriptFrame, *const DebugHint, *mut Value) -> i32;
type JitDtorFn = unsafe extern "C" fn();

/// A compiled expression tree: the evaluate and dtor routines plus the
/// executable pages backing them.
pub struct JitExpression {
    module: Option<JITModule>,
    evaluate: JitEvaluateFn,
    dtor: JitDtorFn,
}

// SAFETY: the compiled code pages are immutable after finalisation and
// the evaluate routine only touches state owned by the calling thread
// (the frame, the out slot, and this thread's pending-error slot). The
// dtor runs exactly once, from Drop, which requires exclusive access.
unsafe impl Send for JitExpression {}
// SAFETY: as above; `evaluate` is reentrant across threads.
unsafe impl Sync for JitExpression {}

impl fmt::Debug for JitExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JitExpression")
    }
}

impl JitExpression {
    /// Lower a whole tree. Roots that cannot be lowered are handed back
    /// in [`JitError::Unsupported`] with their children compiled
    /// independently where possible.
    pub fn new(mut root: Box<Expression>) -> std::result::Result<JitExpression, JitError> {
        if !jit_supported(&root) {
            wrap_fallback_children(&mut root);
            return Err(JitError::Unsupported(root));
        }

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let isa_builder = cranelift_codegen::isa::lookup(Triple::host())
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let mut jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
        let specs = runtime::helper_specs();
        for spec in &specs {
            jit_builder.symbol(spec.name, spec.ptr);
        }

        let mut module = JITModule::new(jit_builder);
        let ptr_type = module.target_config().pointer_type();

        let mut eval_sig = module.make_signature();
        for _ in 0..3 {
            eval_sig.params.push(AbiParam::new(ptr_type));
        }
        eval_sig.returns.push(AbiParam::new(types::I32));
        let dtor_sig = module.make_signature();

        let eval_id = module
            .declare_anonymous_function(&eval_sig)
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let dtor_id = module
            .declare_anonymous_function(&dtor_sig)
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let mut helper_ids = HashMap::new();
        for spec in &specs {
            let mut sig = module.make_signature();
            for param in spec.params {
                sig.params.push(AbiParam::new(param.clif_type(ptr_type)));
            }
            if spec.returns_code {
                sig.returns.push(AbiParam::new(types::I32));
            }
            let id = module
                .declare_function(spec.name, Linkage::Import, &sig)
                .map_err(|e| JitError::Codegen(e.to_string()))?;
            helper_ids.insert(spec.name, id);
        }

        let mut eval_func =
            Function::with_name_signature(UserFuncName::user(0, eval_id.as_u32()), eval_sig);
        let mut dtor_func =
            Function::with_name_signature(UserFuncName::user(0, dtor_id.as_u32()), dtor_sig);

        let mut eval_refs = HashMap::new();
        let mut dtor_refs = HashMap::new();
        for (name, id) in &helper_ids {
            eval_refs.insert(*name, module.declare_func_in_func(*id, &mut eval_func));
            dtor_refs.insert(*name, module.declare_func_in_func(*id, &mut dtor_func));
        }

        let mut eval_fbc = FunctionBuilderContext::new();
        let mut dtor_fbc = FunctionBuilderContext::new();
        {
            let mut eval_builder = FunctionBuilder::new(&mut eval_func, &mut eval_fbc);
            let mut dtor_builder = FunctionBuilder::new(&mut dtor_func, &mut dtor_fbc);

            let entry = eval_builder.create_block();
            eval_builder.append_block_params_for_function_params(entry);
            eval_builder.switch_to_block(entry);
            eval_builder.seal_block(entry);
            let params = eval_builder.block_params(entry).to_vec();
            let (frame, dhint, res) = (params[0], params[1], params[2]);

            let dtor_entry = dtor_builder.create_block();
            dtor_builder.switch_to_block(dtor_entry);
            dtor_builder.seal_block(dtor_entry);

            let mut cx = JitContext {
                eval: eval_builder,
                dtor: dtor_builder,
                ptr_type,
                frame,
                dhint,
                eval_refs,
                dtor_refs,
                live_scratch: Vec::new(),
            };

            // The out slot must be initialised before any early exit can
            // run; producers overwrite it without dropping, which is a
            // no-op for the empty value.
            cx.call_eval("new_empty", &[res]);

            if compile_node(root, &mut cx, res).is_err() {
                return Err(JitError::Codegen(
                    "an unsupported node reached emission".into(),
                ));
            }

            let ok = cx.eval.ins().iconst(types::I32, CODE_OK as i64);
            cx.eval.ins().return_(&[ok]);
            cx.dtor.ins().return_(&[]);

            let JitContext { eval, dtor, .. } = cx;
            eval.finalize();
            dtor.finalize();
        }

        let mut ctx = Context::for_function(eval_func);
        module
            .define_function(eval_id, &mut ctx)
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let mut ctx = Context::for_function(dtor_func);
        module
            .define_function(dtor_id, &mut ctx)
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        module
            .finalize_definitions()
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let eval_ptr = module.get_finalized_function(eval_id);
        let dtor_ptr = module.get_finalized_function(dtor_id);

        // SAFETY: the pointers come from finalised functions defined with
        // exactly these signatures above.
        let evaluate = unsafe { std::mem::transmute::<*const u8, JitEvaluateFn>(eval_ptr) };
        // SAFETY: as above.
        let dtor = unsafe { std::mem::transmute::<*const u8, JitDtorFn>(dtor_ptr) };

        Ok(JitExpression {
            module: Some(module),
            evaluate,
            dtor,
        })
    }

    /// Run the compiled routine, reconstructing the interpreter's result
    /// shape (value plus control code) or the stashed error.
    pub(crate) fn do_evaluate(
        &self,
        frame: &ScriptFrame,
        dhint: Option<&DebugHint>,
    ) -> Result<ExpressionResult> {
        let mut out = MaybeUninit::<Value>::uninit();
        let dhint_ptr = dhint.map_or(std::ptr::null(), |hint| hint as *const DebugHint);

        // SAFETY: the compiled routine initialises `out` on every exit
        // path before returning, including error paths.
        let code = unsafe { (self.evaluate)(frame as *const ScriptFrame, dhint_ptr, out.as_mut_ptr()) };
        // SAFETY: as above.
        let value = unsafe { out.assume_init() };

        if code < 0 {
            drop(value);
            return Err(runtime::take_pending_error());
        }

        Ok(ExpressionResult::with_code(value, code_to_result(code)))
    }
}

impl Drop for JitExpression {
    fn drop(&mut self) {
        // SAFETY: the dtor routine runs exactly once and frees only what
        // emission leaked for this tree.
        unsafe { (self.dtor)() };
        if let Some(module) = self.module.take() {
            // SAFETY: both routine pointers die with self; nothing can
            // call into the pages after this.
            unsafe { module.free_memory() };
        }
    }
}

impl Expression {
    /// Lower this tree, yielding the wrapper node that owns the compiled
    /// routines. Unsupported roots are handed back inside the error.
    pub fn compile_jit(self: Box<Self>) -> std::result::Result<Box<Expression>, JitError> {
        JitExpression::new(self).map(|jit| Box::new(Expression::Jit(jit)))
    }
}

struct JitContext<'a> {
    eval: FunctionBuilder<'a>,
    dtor: FunctionBuilder<'a>,
    ptr_type: cranelift_codegen::ir::Type,
    frame: ClifValue,
    dhint: ClifValue,
    eval_refs: HashMap<&'static str, FuncRef>,
    dtor_refs: HashMap<&'static str, FuncRef>,
    /// Scratch slots currently holding a live value: the left operands of
    /// the binary operators enclosing the emission point. Every emitted
    /// early exit must release them before returning. A slot is pushed
    /// only once its producer has run on all fall-through paths, so the
    /// exit-path drops never see uninitialised memory.
    live_scratch: Vec<ClifValue>,
}

impl JitContext<'_> {
    fn call_eval(&mut self, name: &str, args: &[ClifValue]) -> Option<ClifValue> {
        let func_ref = self.eval_refs[name];
        let call = self.eval.ins().call(func_ref, args);
        self.eval.inst_results(call).first().copied()
    }

    fn call_dtor(&mut self, name: &str, args: &[ClifValue]) {
        let func_ref = self.dtor_refs[name];
        self.dtor.ins().call(func_ref, args);
    }

    fn eval_addr(&mut self, addr: usize) -> ClifValue {
        self.eval.ins().iconst(self.ptr_type, addr as i64)
    }

    fn dtor_addr(&mut self, addr: usize) -> ClifValue {
        self.dtor.ins().iconst(self.ptr_type, addr as i64)
    }

    /// A stack slot big enough for one Value, as a pointer.
    fn new_scratch(&mut self) -> ClifValue {
        let slot = self.eval.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            std::mem::size_of::<Value>() as u32,
            std::mem::align_of::<Value>().trailing_zeros() as u8,
        ));
        self.eval.ins().stack_addr(self.ptr_type, slot, 0)
    }
}

/// Emit a child expression into `res`: lowered inline when possible,
/// otherwise as an interpreter call whose node is owned by the dtor.
fn emit_expression(cx: &mut JitContext<'_>, expr: Box<Expression>, res: ClifValue) {
    match compile_node(expr, cx, res) {
        Ok(()) => {}
        Err(expr) => {
            let raw = Box::into_raw(expr);
            let dtor_ptr = cx.dtor_addr(raw as usize);
            cx.call_dtor("drop_expression", &[dtor_ptr]);

            let eval_ptr = cx.eval_addr(raw as usize);
            let frame = cx.frame;
            let dhint = cx.dhint;
            let code = cx
                .call_eval("invoke", &[eval_ptr, frame, dhint, res])
                .expect("invoke returns a code");
            emit_code_check(cx, code);
        }
    }
}

/// After any step that produced a result code: return it immediately
/// unless it is Ok. The exit path first releases the scratch operands of
/// every enclosing binary operator that are still live at this point, so
/// an early return cannot abandon a heap-backed value in a stack slot.
fn emit_code_check(cx: &mut JitContext<'_>, code: ClifValue) {
    let exit = cx.eval.create_block();
    let cont = cx.eval.create_block();
    cx.eval.ins().brif(code, exit, &[], cont, &[]);

    cx.eval.switch_to_block(exit);
    cx.eval.seal_block(exit);
    emit_live_scratch_drops(cx);
    cx.eval.ins().return_(&[code]);

    cx.eval.switch_to_block(cont);
    cx.eval.seal_block(cont);
}

/// Release the scratch operands of enclosing binary operators; emitted in
/// front of every instruction that leaves the compiled routine.
fn emit_live_scratch_drops(cx: &mut JitContext<'_>) {
    for slot in cx.live_scratch.clone().into_iter().rev() {
        emit_drop(cx, slot);
    }
}

fn emit_drop(cx: &mut JitContext<'_>, value: ClifValue) {
    cx.call_eval("drop_value", &[value]);
}

/// Construct a constant Value at `res`. String payloads are leaked at
/// emission time and their free is appended to the dtor routine.
fn emit_new_value(cx: &mut JitContext<'_>, value: &Value, res: ClifValue) {
    match value {
        Value::Empty => {
            cx.call_eval("new_empty", &[res]);
        }
        Value::Bool(b) => {
            let v = cx.eval.ins().iconst(types::I32, *b as i64);
            cx.call_eval("new_bool", &[v, res]);
        }
        Value::Number(n) => {
            let v = cx.eval.ins().f64const(*n);
            cx.call_eval("new_number", &[v, res]);
        }
        Value::String(s) => {
            let bytes: Box<[u8]> = s.as_bytes().into();
            let len = bytes.len();
            let ptr = Box::into_raw(bytes) as *mut u8 as usize;

            let dtor_ptr = cx.dtor_addr(ptr);
            let dtor_len = cx.dtor_addr(len);
            cx.call_dtor("free_string", &[dtor_ptr, dtor_len]);

            let eval_ptr = cx.eval_addr(ptr);
            let eval_len = cx.eval_addr(len);
            cx.call_eval("new_string", &[eval_ptr, eval_len, res]);
        }
        Value::Object(_) => unreachable!("object literals are not lowered"),
    }
}

fn emit_binary(
    cx: &mut JitContext<'_>,
    lhs: Box<Expression>,
    rhs: Box<Expression>,
    helper: &'static str,
    res: ClifValue,
) {
    let op1 = cx.new_scratch();
    emit_expression(cx, lhs, op1);

    // From here until the combine call, `op1` holds a live value; early
    // exits emitted inside the right operand must release it.
    cx.live_scratch.push(op1);
    emit_expression(cx, rhs, res);

    let code = cx.call_eval(helper, &[op1, res]).expect("binary helpers return a code");
    cx.live_scratch.pop();
    emit_drop(cx, op1);
    emit_code_check(cx, code);
}

/// Lower one node. `Err` hands the node back for interpreter fallback;
/// [`jit_supported`] decides which arm runs, so the two must stay in
/// sync.
fn compile_node(
    expr: Box<Expression>,
    cx: &mut JitContext<'_>,
    res: ClifValue,
) -> std::result::Result<(), Box<Expression>> {
    if !jit_supported(&expr) {
        let mut expr = expr;
        wrap_fallback_children(&mut expr);
        return Err(expr);
    }

    match *expr {
        Expression::Literal { value, .. } => {
            emit_new_value(cx, &value, res);
            Ok(())
        }

        Expression::Negate { operand, .. } => {
            emit_expression(cx, operand, res);
            let code = cx.call_eval("value_negate", &[res]).expect("negate returns a code");
            emit_code_check(cx, code);
            Ok(())
        }

        Expression::LogicalNegate { operand, .. } => {
            emit_expression(cx, operand, res);
            cx.call_eval("value_logical_negate", &[res]);
            Ok(())
        }

        Expression::Add { lhs, rhs, .. } => Ok(emit_binary(cx, lhs, rhs, "value_add", res)),
        Expression::Subtract { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_subtract", res))
        }
        Expression::Multiply { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_multiply", res))
        }
        Expression::Divide { lhs, rhs, .. } => Ok(emit_binary(cx, lhs, rhs, "value_divide", res)),
        Expression::Modulo { lhs, rhs, .. } => Ok(emit_binary(cx, lhs, rhs, "value_modulo", res)),
        Expression::Xor { lhs, rhs, .. } => Ok(emit_binary(cx, lhs, rhs, "value_xor", res)),
        Expression::BinaryAnd { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_binary_and", res))
        }
        Expression::BinaryOr { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_binary_or", res))
        }
        Expression::ShiftLeft { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_shift_left", res))
        }
        Expression::ShiftRight { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_shift_right", res))
        }
        Expression::Equal { lhs, rhs, .. } => Ok(emit_binary(cx, lhs, rhs, "value_equal", res)),
        Expression::NotEqual { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_not_equal", res))
        }
        Expression::LessThan { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_less_than", res))
        }
        Expression::GreaterThan { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_greater_than", res))
        }
        Expression::LessThanOrEqual { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_less_than_or_equal", res))
        }
        Expression::GreaterThanOrEqual { lhs, rhs, .. } => {
            Ok(emit_binary(cx, lhs, rhs, "value_greater_than_or_equal", res))
        }

        Expression::LogicalAnd { lhs, rhs, .. } => {
            emit_short_circuit(cx, lhs, rhs, true, res);
            Ok(())
        }

        Expression::LogicalOr { lhs, rhs, .. } => {
            emit_short_circuit(cx, lhs, rhs, false, res);
            Ok(())
        }

        Expression::Conditional {
            condition,
            true_branch,
            false_branch,
            ..
        } => {
            emit_expression(cx, condition, res);
            let t = cx
                .call_eval("value_is_true", &[res])
                .expect("is_true returns a flag");

            let then_block = cx.eval.create_block();
            let else_block = cx.eval.create_block();
            let after_block = cx.eval.create_block();
            cx.eval.ins().brif(t, then_block, &[], else_block, &[]);

            cx.eval.switch_to_block(then_block);
            cx.eval.seal_block(then_block);
            emit_drop(cx, res);
            emit_expression(cx, true_branch, res);
            cx.eval.ins().jump(after_block, &[]);

            cx.eval.switch_to_block(else_block);
            cx.eval.seal_block(else_block);
            emit_drop(cx, res);
            match false_branch {
                Some(false_branch) => emit_expression(cx, false_branch, res),
                None => emit_new_value(cx, &Value::Empty, res),
            }
            cx.eval.ins().jump(after_block, &[]);

            cx.eval.switch_to_block(after_block);
            cx.eval.seal_block(after_block);
            Ok(())
        }

        Expression::While {
            condition, body, ..
        } => {
            let header = cx.eval.create_block();
            cx.eval.ins().jump(header, &[]);
            // Not sealed yet; the back edge is still to come.
            cx.eval.switch_to_block(header);

            emit_expression(cx, condition, res);
            let t = cx
                .call_eval("value_is_true", &[res])
                .expect("is_true returns a flag");

            let body_block = cx.eval.create_block();
            let exit_block = cx.eval.create_block();
            cx.eval.ins().brif(t, body_block, &[], exit_block, &[]);

            cx.eval.switch_to_block(body_block);
            cx.eval.seal_block(body_block);
            emit_drop(cx, res);
            emit_expression(cx, body, res);
            emit_drop(cx, res);
            cx.eval.ins().jump(header, &[]);
            cx.eval.seal_block(header);

            cx.eval.switch_to_block(exit_block);
            cx.eval.seal_block(exit_block);
            emit_drop(cx, res);
            emit_new_value(cx, &Value::Empty, res);
            Ok(())
        }

        Expression::Return { operand, .. } => {
            emit_expression(cx, operand, res);
            emit_live_scratch_drops(cx);
            let code = cx.eval.ins().iconst(types::I32, CODE_RETURN as i64);
            cx.eval.ins().return_(&[code]);

            // Anything emitted after an unconditional return lands in a
            // dead block.
            let dead = cx.eval.create_block();
            cx.eval.switch_to_block(dead);
            cx.eval.seal_block(dead);
            Ok(())
        }

        Expression::Array { items, .. } => {
            cx.call_eval("new_array", &[res]);
            let item_slot = cx.new_scratch();
            for item in items {
                emit_expression(cx, Box::new(item), item_slot);
                cx.call_eval("array_add", &[res, item_slot]);
                emit_drop(cx, item_slot);
            }
            Ok(())
        }

        Expression::Dict { items, .. } => {
            // Inline only; non-inline bodies stay interpreted because the
            // self-swap could not be restored across an early return.
            if items.is_empty() {
                emit_new_value(cx, &Value::Empty, res);
                return Ok(());
            }

            let mut first = true;
            for item in items {
                if !first {
                    emit_drop(cx, res);
                }
                first = false;
                emit_expression(cx, Box::new(item), res);
            }
            Ok(())
        }

        Expression::GetScope { scope, .. } => {
            let frame = cx.frame;
            match scope {
                ScopeSpecifier::Local => cx.call_eval("scope_local", &[frame, res]),
                ScopeSpecifier::This => cx.call_eval("scope_this", &[frame, res]),
                ScopeSpecifier::Global => cx.call_eval("scope_global", &[res]),
            };
            Ok(())
        }

        _ => unreachable!("jit_supported admits only the lowered node kinds"),
    }
}

/// `and`/`or`: evaluate the left side; only when it does (resp. does
/// not) hold, drop it and evaluate the right side into the same slot.
fn emit_short_circuit(
    cx: &mut JitContext<'_>,
    lhs: Box<Expression>,
    rhs: Box<Expression>,
    evaluate_rhs_when_true: bool,
    res: ClifValue,
) {
    emit_expression(cx, lhs, res);
    let t = cx
        .call_eval("value_is_true", &[res])
        .expect("is_true returns a flag");

    let rhs_block = cx.eval.create_block();
    let after_block = cx.eval.create_block();
    if evaluate_rhs_when_true {
        cx.eval.ins().brif(t, rhs_block, &[], after_block, &[]);
    } else {
        cx.eval.ins().brif(t, after_block, &[], rhs_block, &[]);
    }

    cx.eval.switch_to_block(rhs_block);
    cx.eval.seal_block(rhs_block);
    emit_drop(cx, res);
    emit_expression(cx, rhs, res);
    cx.eval.ins().jump(after_block, &[]);

    cx.eval.switch_to_block(after_block);
    cx.eval.seal_block(after_block);
}

/// Whether evaluating this node can produce a non-Ok result code. Used to
/// keep lowered code equivalent to the interpreter: operand positions
/// whose codes the interpreter discards must not yield codes, because the
/// emitted check would propagate them instead.
fn can_yield_code(expr: &Expression) -> bool {
    match expr {
        Expression::Break { .. } | Expression::Continue { .. } | Expression::Return { .. } => true,

        // The compiled sub-expression is opaque here; assume the worst.
        Expression::Include { .. } => true,
        Expression::Jit(_) => true,

        Expression::Conditional {
            true_branch,
            false_branch,
            ..
        } => {
            can_yield_code(true_branch)
                || false_branch.as_deref().is_some_and(can_yield_code)
        }

        Expression::Dict { items, .. } => items.iter().any(can_yield_code),

        Expression::While { body, .. } | Expression::For { body, .. } => can_yield_code(body),

        Expression::LogicalAnd { lhs, rhs, .. } | Expression::LogicalOr { lhs, rhs, .. } => {
            can_yield_code(lhs) || can_yield_code(rhs)
        }

        _ => false,
    }
}

/// The node kinds [`compile_node`] lowers, with the operand restrictions
/// that keep emission equivalent to interpretation.
fn jit_supported(expr: &Expression) -> bool {
    match expr {
        Expression::Literal { value, .. } => !value.is_object(),

        Expression::Negate { operand, .. }
        | Expression::LogicalNegate { operand, .. }
        | Expression::Return { operand, .. } => !can_yield_code(operand),

        Expression::Add { lhs, rhs, .. }
        | Expression::Subtract { lhs, rhs, .. }
        | Expression::Multiply { lhs, rhs, .. }
        | Expression::Divide { lhs, rhs, .. }
        | Expression::Modulo { lhs, rhs, .. }
        | Expression::Xor { lhs, rhs, .. }
        | Expression::BinaryAnd { lhs, rhs, .. }
        | Expression::BinaryOr { lhs, rhs, .. }
        | Expression::ShiftLeft { lhs, rhs, .. }
        | Expression::ShiftRight { lhs, rhs, .. }
        | Expression::Equal { lhs, rhs, .. }
        | Expression::NotEqual { lhs, rhs, .. }
        | Expression::LessThan { lhs, rhs, .. }
        | Expression::GreaterThan { lhs, rhs, .. }
        | Expression::LessThanOrEqual { lhs, rhs, .. }
        | Expression::GreaterThanOrEqual { lhs, rhs, .. }
        | Expression::LogicalAnd { lhs, rhs, .. }
        | Expression::LogicalOr { lhs, rhs, .. } => {
            !can_yield_code(lhs) && !can_yield_code(rhs)
        }

        Expression::Conditional { condition, .. } => !can_yield_code(condition),

        Expression::While {
            condition, body, ..
        } => !can_yield_code(condition) && !can_yield_code(body),

        Expression::Array { items, .. } => !items.iter().any(can_yield_code),

        Expression::Dict { inline, .. } => *inline,

        Expression::GetScope { .. } => true,

        _ => false,
    }
}

/// For nodes that stay interpreted: compile each child expression as an
/// independent sub-tree where possible, so nested arithmetic still runs
/// natively under an interpreted parent.
fn wrap_fallback_children(expr: &mut Expression) {
    match expr {
        Expression::Negate { operand, .. }
        | Expression::LogicalNegate { operand, .. }
        | Expression::Return { operand, .. } => jit_replace(operand),

        Expression::Add { lhs, rhs, .. }
        | Expression::Subtract { lhs, rhs, .. }
        | Expression::Multiply { lhs, rhs, .. }
        | Expression::Divide { lhs, rhs, .. }
        | Expression::Modulo { lhs, rhs, .. }
        | Expression::Xor { lhs, rhs, .. }
        | Expression::BinaryAnd { lhs, rhs, .. }
        | Expression::BinaryOr { lhs, rhs, .. }
        | Expression::ShiftLeft { lhs, rhs, .. }
        | Expression::ShiftRight { lhs, rhs, .. }
        | Expression::Equal { lhs, rhs, .. }
        | Expression::NotEqual { lhs, rhs, .. }
        | Expression::LessThan { lhs, rhs, .. }
        | Expression::GreaterThan { lhs, rhs, .. }
        | Expression::LessThanOrEqual { lhs, rhs, .. }
        | Expression::GreaterThanOrEqual { lhs, rhs, .. }
        | Expression::LogicalAnd { lhs, rhs, .. }
        | Expression::LogicalOr { lhs, rhs, .. }
        | Expression::In { lhs, rhs, .. }
        | Expression::NotIn { lhs, rhs, .. } => {
            jit_replace(lhs);
            jit_replace(rhs);
        }

        Expression::Set { target, value, .. } => {
            jit_replace(target);
            jit_replace(value);
        }

        Expression::Indexer { parent, index, .. } => {
            jit_replace(parent);
            jit_replace(index);
        }

        Expression::FunctionCall { callee, .. } => jit_replace(callee),

        Expression::Conditional {
            condition,
            true_branch,
            false_branch,
            ..
        } => {
            jit_replace(condition);
            jit_replace(true_branch);
            if let Some(false_branch) = false_branch {
                jit_replace(false_branch);
            }
        }

        Expression::While {
            condition, body, ..
        } => {
            jit_replace(condition);
            jit_replace(body);
        }

        Expression::For {
            iterable, body, ..
        } => {
            jit_replace(iterable);
            jit_replace(body);
        }

        Expression::Array { items, .. } | Expression::Dict { items, .. } => {
            for item in items {
                jit_replace_expr(item);
            }
        }

        Expression::Throw { message, .. } => jit_replace(message),

        Expression::Import { name, .. } => jit_replace(name),

        Expression::Include {
            path,
            pattern,
            name,
            ..
        } => {
            jit_replace(path);
            if let Some(pattern) = pattern {
                jit_replace(pattern);
            }
            if let Some(name) = name {
                jit_replace(name);
            }
        }

        Expression::Function { closed_vars, .. }
        | Expression::Apply { closed_vars, .. }
        | Expression::Object { closed_vars, .. } => {
            if let Some(closed_vars) = closed_vars {
                for (_, expr) in closed_vars.iter_mut() {
                    jit_replace_expr(expr);
                }
            }
        }

        _ => {}
    }
}

fn jit_replace(slot: &mut Box<Expression>) {
    jit_replace_expr(slot.as_mut());
}

/// Try to compile one child in place. Unsupported children are restored
/// untouched (apart from their own recursively compiled children).
fn jit_replace_expr(slot: &mut Expression) {
    if matches!(slot, Expression::Jit(_)) {
        return;
    }

    let old = std::mem::replace(
        slot,
        Expression::Break {
            di: DebugInfo::default(),
        },
    );

    match JitExpression::new(Box::new(old)) {
        Ok(jit) => *slot = Expression::Jit(jit),
        Err(JitError::Unsupported(expr)) => *slot = *expr,
        Err(JitError::Codegen(message)) => {
            // The tree was partially consumed by emission; surface the
            // failure at evaluation time instead of silently misbehaving.
            *slot = Expression::Throw {
                message: Box::new(make_literal(format!("JIT compilation failed: {}", message))),
                incomplete: false,
                di: DebugInfo::default(),
            };
        }
    }
}
