use std::error::Error as StdError;

use thiserror::Error;

use crate::debug::DebugInfo;

/// Classifies a [`ScriptError`] without parsing its message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A plain script-level error (`throw`, bad template reference, ...).
    Script,
    /// The evaluation stack exceeded its depth limit.
    RecursionTooDeep,
    /// A forbidden operation was attempted in sandbox mode.
    SandboxViolation,
    /// A free name could not be resolved.
    UndefinedVariable,
    /// An operator was applied to operands it is not defined for.
    Arithmetic,
    /// A value had the wrong shape for the operation.
    TypeMismatch,
    /// The expression cannot be lowered to native code.
    JitUnsupported,
}

/// The error produced by evaluating an expression.
///
/// Carries the source location of the node that raised it, the
/// `incomplete` flag (used by REPL-style hosts to distinguish "give me
/// more input" from a terminal error), and an optional nested cause when
/// a host-side failure was wrapped at a collaborator boundary.
#[derive(Debug, Error)]
#[error("{}", render(.message, .location))]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: DebugInfo,
    pub incomplete: bool,
    #[source]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

fn render(message: &str, location: &DebugInfo) -> String {
    if location.is_empty() {
        message.to_string()
    } else {
        format!("{} ({})", message, location)
    }
}

impl ScriptError {
    pub fn new(message: impl Into<String>, location: DebugInfo) -> Self {
        ScriptError {
            kind: ErrorKind::Script,
            message: message.into(),
            location,
            incomplete: false,
            cause: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    pub fn recursion_too_deep() -> Self {
        ScriptError::new(
            "Stack overflow while evaluating expression: Recursion level too deep.",
            DebugInfo::default(),
        )
        .with_kind(ErrorKind::RecursionTooDeep)
    }

    pub fn sandbox(message: impl Into<String>, location: DebugInfo) -> Self {
        ScriptError::new(message, location).with_kind(ErrorKind::SandboxViolation)
    }

    pub fn undefined_variable(name: &str, location: DebugInfo) -> Self {
        ScriptError::new(
            format!("Tried to access undefined variable: '{}'", name),
            location,
        )
        .with_kind(ErrorKind::UndefinedVariable)
    }

    pub fn arithmetic(message: impl Into<String>, location: DebugInfo) -> Self {
        ScriptError::new(message, location).with_kind(ErrorKind::Arithmetic)
    }

    pub fn type_mismatch(message: impl Into<String>, location: DebugInfo) -> Self {
        ScriptError::new(message, location).with_kind(ErrorKind::TypeMismatch)
    }

    /// Wrap a host-side failure from a collaborator call, keeping the
    /// original error as the nested cause.
    pub fn wrap(cause: Box<dyn StdError + Send + Sync>, location: DebugInfo) -> Self {
        ScriptError {
            kind: ErrorKind::Script,
            message: format!("Error while evaluating expression: {}", cause),
            location,
            incomplete: false,
            cause: Some(cause),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
