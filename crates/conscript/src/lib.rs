//! Conscript - an embeddable expression engine for monitoring
//! configuration scripts.
//!
//! Conscript evaluates the dynamically-typed expression language used to
//! describe monitoring objects, templates, apply rules and imperative
//! config fragments. The embedding application builds ASTs (the parser is
//! its concern) and hands them to the engine, which owns evaluation
//! semantics: the value model, scope and import resolution, sandboxing,
//! bounded recursion, and an optional JIT backend.
//!
//! # Features
//!
//! - **Dynamic value model**: empty, booleans, IEEE-754 numbers, shared
//!   strings, and shared heap objects (arrays, dictionaries, functions,
//!   constructible types)
//! - **Sandbox mode**: assignments, loops, template resolution, includes
//!   and library loading are refused for untrusted expressions
//! - **Bounded evaluation**: a thread-local frame stack with a recursion
//!   limit of 300
//! - **Breakpoint bus**: a reentrancy-guarded broadcast fired for script
//!   errors and explicit breakpoint nodes
//! - **JIT lowering** (feature `jit`): a cranelift-based backend compiles
//!   a subset of node kinds to native code, falling back to the
//!   interpreter per node
//!
//! # Quick Start
//!
//! ```
//! use conscript::{make_literal, Expression, ScriptFrame, Value};
//!
//! // 2 + 3 * 4
//! let expr = Expression::Add {
//!     lhs: Box::new(make_literal(2.0)),
//!     rhs: Box::new(Expression::Multiply {
//!         lhs: Box::new(make_literal(3.0)),
//!         rhs: Box::new(make_literal(4.0)),
//!         di: Default::default(),
//!     }),
//!     di: Default::default(),
//! };
//!
//! let frame = ScriptFrame::new();
//! let result = expr.evaluate(&frame, None).unwrap();
//! assert_eq!(result.value, Value::Number(14.0));
//! ```
//!
//! # Sandboxing
//!
//! ```
//! use conscript::{make_literal, ErrorKind, Expression, ScriptFrame, SetOp};
//!
//! let assignment = Expression::Set {
//!     target: Box::new(Expression::Variable {
//!         name: "x".into(),
//!         di: Default::default(),
//!     }),
//!     op: SetOp::Literal,
//!     value: Box::new(make_literal(1.0)),
//!     di: Default::default(),
//! };
//!
//! let frame = ScriptFrame::new();
//! frame.set_sandboxed(true);
//! let err = assignment.evaluate(&frame, None).unwrap_err();
//! assert_eq!(err.kind, ErrorKind::SandboxViolation);
//! ```

pub mod config;
mod debug;
mod error;
mod expression;
mod frame;
mod globals;
pub mod operators;
mod ops;
mod value;

#[cfg(feature = "jit")]
mod jit;

pub use debug::{DebugHint, DebugInfo};
pub use error::{ErrorKind, Result, ScriptError};
pub use expression::{
    bind_to_scope, make_indexer, make_literal, BreakpointSubscription, Expression,
    ExpressionResult, IncludeKind, ResultCode, ScopeSpecifier, SetOp,
};
pub use frame::{ScriptFrame, MAX_STACK_DEPTH};
pub use globals::ScriptGlobal;
pub use value::{time_constant_equals, Array, Dictionary, Function, Object, Type, Value};

#[cfg(feature = "jit")]
pub use jit::{JitError, JitExpression};
