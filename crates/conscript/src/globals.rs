//! The process-wide script-global registry.
//!
//! Top-level names live in one shared dictionary created on first use.
//! Initialisation also registers the base namespaces (`System`, `Types`,
//! `Deprecated`) both as globals and as entries of the import chain, so
//! free names resolve through them.

use once_cell::sync::Lazy;

use crate::debug::DebugInfo;
use crate::error::ScriptError;
use crate::frame::ScriptFrame;
use crate::value::{Dictionary, Type, Value};

static GLOBALS: Lazy<Dictionary> = Lazy::new(|| {
    let globals = Dictionary::new();

    let system = Dictionary::new();
    globals.insert("System", system.clone().into());
    ScriptFrame::add_import(system);

    let types = Dictionary::new();
    types.insert(
        "Array",
        Type::new("Array", |args| Ok(args.to_vec().into())).into(),
    );
    types.insert(
        "Dictionary",
        Type::new("Dictionary", |args| {
            if args.is_empty() {
                Ok(Dictionary::new().into())
            } else {
                Err(ScriptError::type_mismatch(
                    "The Dictionary constructor takes no arguments",
                    DebugInfo::default(),
                ))
            }
        })
        .into(),
    );
    globals.insert("Types", types.clone().into());
    ScriptFrame::add_import(types);

    let deprecated = Dictionary::new();
    globals.insert("Deprecated", deprecated.clone().into());
    ScriptFrame::add_import(deprecated);

    globals
});

/// Accessors for the shared top-level scope.
pub struct ScriptGlobal;

impl ScriptGlobal {
    /// The globals dictionary itself; the default `self` of a new frame.
    pub fn globals() -> Dictionary {
        GLOBALS.clone()
    }

    /// Missing names read as [`Value::Empty`].
    pub fn get(name: &str) -> Value {
        GLOBALS.get(name)
    }

    pub fn set(name: &str, value: Value) {
        GLOBALS.insert(name, value);
    }

    pub fn exists(name: &str) -> bool {
        GLOBALS.has(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_namespaces_exist() {
        assert!(ScriptGlobal::exists("System"));
        assert!(ScriptGlobal::exists("Types"));
        assert!(ScriptGlobal::exists("Deprecated"));
    }

    #[test]
    fn test_set_then_get() {
        ScriptGlobal::set("globals_rs_marker", Value::Number(17.0));
        assert_eq!(ScriptGlobal::get("globals_rs_marker"), Value::Number(17.0));
        assert_eq!(ScriptGlobal::get("globals_rs_absent"), Value::Empty);
    }

    #[test]
    fn test_builtin_array_type_constructs() {
        let types = ScriptGlobal::get("Types");
        let array_type = types.as_dictionary().unwrap().get("Array");
        let ty = array_type.as_type().unwrap();
        let built = ty
            .construct(&[Value::Number(1.0), Value::string("x")])
            .unwrap();
        assert_eq!(built.as_array().unwrap().len(), 2);
    }
}
