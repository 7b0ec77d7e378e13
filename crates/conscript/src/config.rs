//! Registries for configuration objects and the pluggable host hooks.
//!
//! The engine itself never reads files or loads libraries: `include`
//! directives are compiled into sub-expressions by a host-registered
//! [`ConfigCompiler`], and `library` statements go through the registered
//! library loader. Objects and apply rules produced by evaluation land in
//! process-wide registries the host instantiates from.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::debug::DebugInfo;
use crate::error::{Result, ScriptError};
use crate::expression::Expression;
use crate::value::Dictionary;

type HostResult<T> = std::result::Result<T, Box<dyn StdError + Send + Sync>>;

/// A configuration object or template produced by an `object` definition,
/// holding its body expression for later instantiation and for `import`
/// resolution.
#[derive(Debug)]
pub struct ConfigItem {
    type_name: String,
    name: String,
    abstract_: bool,
    zone: String,
    package: String,
    ignore_on_error: bool,
    filter: Option<Arc<Expression>>,
    scope: Dictionary,
    expression: Arc<Expression>,
    debug_info: DebugInfo,
}

impl ConfigItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        type_name: &str,
        name: &str,
        abstract_: bool,
        zone: &str,
        package: &str,
        ignore_on_error: bool,
        filter: Option<Arc<Expression>>,
        scope: Dictionary,
        expression: Arc<Expression>,
        debug_info: DebugInfo,
    ) -> Self {
        ConfigItem {
            type_name: type_name.to_string(),
            name: name.to_string(),
            abstract_,
            zone: zone.to_string(),
            package: package.to_string(),
            ignore_on_error,
            filter,
            scope,
            expression,
            debug_info,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_abstract(&self) -> bool {
        self.abstract_
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn ignore_on_error(&self) -> bool {
        self.ignore_on_error
    }

    pub fn filter(&self) -> Option<&Arc<Expression>> {
        self.filter.as_ref()
    }

    pub fn scope(&self) -> &Dictionary {
        &self.scope
    }

    pub fn expression(&self) -> &Arc<Expression> {
        &self.expression
    }

    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    pub fn get_by_type_and_name(type_name: &str, name: &str) -> Option<Arc<ConfigItem>> {
        ITEMS
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(type_name.to_string(), name.to_string()))
            .cloned()
    }
}

static ITEMS: Lazy<RwLock<HashMap<(String, String), Arc<ConfigItem>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a config item; duplicate (type, name) is an error.
pub fn register_item(item: ConfigItem) -> Result<Arc<ConfigItem>> {
    let key = (item.type_name.clone(), item.name.clone());
    let mut items = ITEMS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if items.contains_key(&key) {
        return Err(ScriptError::new(
            format!(
                "An object with type '{}' and name '{}' already exists",
                key.0, key.1
            ),
            item.debug_info.clone(),
        ));
    }

    let item = Arc::new(item);
    items.insert(key, Arc::clone(&item));
    Ok(item)
}

pub fn remove_item(type_name: &str, name: &str) -> Option<Arc<ConfigItem>> {
    ITEMS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&(type_name.to_string(), name.to_string()))
}

/// An `apply` rule recorded for later instantiation by the host.
#[derive(Debug)]
pub struct ApplyRule {
    pub type_name: String,
    pub target_type: String,
    pub name: String,
    pub filter: Option<Arc<Expression>>,
    pub package: String,
    pub fk_var: Option<String>,
    pub fv_var: Option<String>,
    pub f_term: Option<Arc<Expression>>,
    pub scope: Dictionary,
    pub ignore_on_error: bool,
    pub expression: Arc<Expression>,
    pub debug_info: DebugInfo,
}

impl ApplyRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        type_name: &str,
        target_type: &str,
        name: &str,
        filter: Option<Arc<Expression>>,
        package: &str,
        fk_var: Option<&str>,
        fv_var: Option<&str>,
        f_term: Option<Arc<Expression>>,
        scope: Dictionary,
        ignore_on_error: bool,
        expression: Arc<Expression>,
        debug_info: DebugInfo,
    ) -> Self {
        ApplyRule {
            type_name: type_name.to_string(),
            target_type: target_type.to_string(),
            name: name.to_string(),
            filter,
            package: package.to_string(),
            fk_var: fk_var.map(str::to_string),
            fv_var: fv_var.map(str::to_string),
            f_term,
            scope,
            ignore_on_error,
            expression,
            debug_info,
        }
    }
}

static APPLY_RULES: Lazy<RwLock<Vec<Arc<ApplyRule>>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn add_apply_rule(rule: ApplyRule) {
    APPLY_RULES
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(Arc::new(rule));
}

/// All recorded apply rules for a source type.
pub fn apply_rules_for_type(type_name: &str) -> Vec<Arc<ApplyRule>> {
    APPLY_RULES
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .filter(|rule| rule.type_name == type_name)
        .cloned()
        .collect()
}

/// The host side of `include` directives: turns a resolved include into a
/// freshly built expression the engine then evaluates and drops.
pub trait ConfigCompiler: Send + Sync {
    fn handle_include(
        &self,
        relative_base: &str,
        path: &str,
        search_includes: bool,
        zone: &str,
        package: &str,
        debug_info: &DebugInfo,
    ) -> HostResult<Box<Expression>>;

    fn handle_include_recursive(
        &self,
        relative_base: &str,
        path: &str,
        pattern: &str,
        zone: &str,
        package: &str,
        debug_info: &DebugInfo,
    ) -> HostResult<Box<Expression>>;

    fn handle_include_zones(
        &self,
        relative_base: &str,
        name: &str,
        path: &str,
        pattern: &str,
        package: &str,
        debug_info: &DebugInfo,
    ) -> HostResult<Box<Expression>>;
}

static COMPILER: Lazy<RwLock<Option<Arc<dyn ConfigCompiler>>>> =
    Lazy::new(|| RwLock::new(None));

pub fn set_compiler(compiler: impl ConfigCompiler + 'static) {
    *COMPILER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(compiler));
}

pub(crate) fn compiler() -> Option<Arc<dyn ConfigCompiler>> {
    COMPILER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

type LibraryLoader = dyn Fn(&str) -> HostResult<()> + Send + Sync;

static LIBRARY_LOADER: Lazy<RwLock<Option<Arc<LibraryLoader>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the hook behind `library` statements.
pub fn set_library_loader(loader: impl Fn(&str) -> HostResult<()> + Send + Sync + 'static) {
    *LIBRARY_LOADER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(loader));
}

pub(crate) fn load_extension_library(path: &str) -> HostResult<()> {
    let loader = LIBRARY_LOADER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();

    match loader {
        Some(loader) => loader(path),
        None => Err(format!("Cannot load extension library '{}': no loader registered", path).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::make_literal;
    use crate::value::Value;

    fn item(type_name: &str, name: &str) -> ConfigItem {
        ConfigItem::new(
            type_name,
            name,
            false,
            "",
            "_etc",
            false,
            None,
            Dictionary::new(),
            Arc::new(make_literal(Value::Empty)),
            DebugInfo::default(),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        register_item(item("Host", "config-rs-web01")).unwrap();
        let found = ConfigItem::get_by_type_and_name("Host", "config-rs-web01").unwrap();
        assert_eq!(found.type_name(), "Host");
        assert_eq!(found.package(), "_etc");
        remove_item("Host", "config-rs-web01");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        register_item(item("Host", "config-rs-dup")).unwrap();
        let err = register_item(item("Host", "config-rs-dup")).unwrap_err();
        assert!(err.message.contains("already exists"));
        remove_item("Host", "config-rs-dup");
    }

    #[test]
    fn test_apply_rules_filtered_by_type() {
        add_apply_rule(ApplyRule::new(
            "Service",
            "Host",
            "config-rs-ping",
            None,
            "_etc",
            None,
            None,
            None,
            Dictionary::new(),
            false,
            Arc::new(make_literal(Value::Empty)),
            DebugInfo::default(),
        ));

        let rules = apply_rules_for_type("Service");
        assert!(rules.iter().any(|rule| rule.name == "config-rs-ping"));
        assert!(apply_rules_for_type("NoSuchType").is_empty());
    }

    #[test]
    fn test_library_loader_unset_errors() {
        let err = load_extension_library("config_rs_no_loader").unwrap_err();
        assert!(err.to_string().contains("no loader registered"));
    }
}
