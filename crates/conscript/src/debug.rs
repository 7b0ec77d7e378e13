//! Source locations and per-field debug annotations.

use std::fmt;
use std::sync::Arc;

use crate::value::{Dictionary, Value};

/// The source region an AST node was parsed from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub path: Arc<str>,
    pub first_line: u32,
    pub first_column: u32,
    pub last_line: u32,
    pub last_column: u32,
}

impl DebugInfo {
    pub fn new(
        path: impl AsRef<str>,
        first_line: u32,
        first_column: u32,
        last_line: u32,
        last_column: u32,
    ) -> Self {
        DebugInfo {
            path: Arc::from(path.as_ref()),
            first_line,
            first_column,
            last_line,
            last_column,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.first_line == 0
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}:{}",
            self.path, self.first_line, self.first_column, self.last_line, self.last_column
        )
    }
}

/// A mutable tree of annotations recorded while evaluating object bodies.
///
/// Debuggers and config tooling use it to answer "where was this field
/// last assigned". The tree is backed by nested dictionaries so it can be
/// handed to scripts as a plain value; handles are cheap to clone and
/// children are created on first access.
#[derive(Clone, Debug, Default)]
pub struct DebugHint {
    hints: Dictionary,
}

impl DebugHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// The annotation node for a child field, created if absent.
    pub fn child(&self, name: &str) -> DebugHint {
        let properties = match self.hints.get("properties").as_dictionary() {
            Some(dict) => dict.clone(),
            None => {
                let dict = Dictionary::new();
                self.hints.insert("properties", dict.clone().into());
                dict
            }
        };

        let child = match properties.get(name).as_dictionary() {
            Some(dict) => dict.clone(),
            None => {
                let dict = Dictionary::new();
                properties.insert(name, dict.clone().into());
                dict
            }
        };

        DebugHint { hints: child }
    }

    /// Record a message (such as `"="` for an assignment) at a location.
    pub fn add_message(&self, message: &str, location: &DebugInfo) {
        let messages = match self.hints.get("messages").as_array() {
            Some(arr) => arr.clone(),
            None => {
                let arr = crate::value::Array::new();
                self.hints.insert("messages", arr.clone().into());
                arr
            }
        };

        messages.add(
            vec![
                Value::string(message),
                Value::string(&*location.path),
                Value::from(location.first_line as i64),
                Value::from(location.first_column as i64),
                Value::from(location.last_line as i64),
                Value::from(location.last_column as i64),
            ]
            .into(),
        );
    }

    /// The annotation tree as a script value.
    pub fn to_value(&self) -> Value {
        self.hints.clone().into()
    }
}
