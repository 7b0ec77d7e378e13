//! The dynamic value model shared by the interpreter and the JIT.
//!
//! A [`Value`] is a tagged sum over the five shapes a configuration script
//! can produce: the empty value, booleans, IEEE-754 numbers, immutable
//! shared strings, and references to heap objects (arrays, dictionaries,
//! functions and constructible types). Heap objects are cheaply clonable
//! shared handles; cloning a `Value` never deep-copies a container.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::expression::Expression;

/// A dynamically-typed script value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The unit value; also what missing dictionary fields read as.
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Object(Object),
}

/// A reference to a heap object.
#[derive(Clone, Debug)]
pub enum Object {
    Array(Array),
    Dictionary(Dictionary),
    Function(Function),
    Type(Type),
}

impl Object {
    /// Identity comparison: two handles are equal iff they point at the
    /// same heap allocation.
    pub fn ptr_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Array(a), Object::Array(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Object::Dictionary(a), Object::Dictionary(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Object::Function(a), Object::Function(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Object::Type(a), Object::Type(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }

    fn addr(&self) -> usize {
        match self {
            Object::Array(a) => Arc::as_ptr(&a.0) as usize,
            Object::Dictionary(d) => Arc::as_ptr(&d.0) as usize,
            Object::Function(f) => Arc::as_ptr(&f.0) as usize,
            Object::Type(t) => Arc::as_ptr(&t.0) as usize,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Array(_) => "array",
            Object::Dictionary(_) => "dictionary",
            Object::Function(_) => "function",
            Object::Type(_) => "type",
        }
    }
}

fn relock<'a, T>(
    guard: std::result::Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // A panic while a container was locked leaves the data usable for
    // scripts; recover the guard instead of propagating the poison.
    guard.unwrap_or_else(PoisonError::into_inner)
}

/// An ordered sequence of values.
#[derive(Clone, Debug, Default)]
pub struct Array(Arc<Mutex<Vec<Value>>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Array(Arc::new(Mutex::new(items)))
    }

    pub fn len(&self) -> usize {
        relock(self.0.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, value: Value) {
        relock(self.0.lock()).push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        relock(self.0.lock()).get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        let mut items = relock(self.0.lock());
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        relock(self.0.lock()).iter().any(|item| item == value)
    }

    /// Copy of the current contents; iteration never holds the lock.
    pub fn snapshot(&self) -> Vec<Value> {
        relock(self.0.lock()).clone()
    }

    pub fn shallow_clone(&self) -> Array {
        Array::from_vec(self.snapshot())
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Array::from_vec(iter.into_iter().collect())
    }
}

/// An insertion-ordered mapping from strings to values.
#[derive(Clone, Debug, Default)]
pub struct Dictionary(Arc<Mutex<IndexMap<String, Value>>>);

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        relock(self.0.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &str) -> bool {
        relock(self.0.lock()).contains_key(key)
    }

    /// Missing keys read as [`Value::Empty`].
    pub fn get(&self, key: &str) -> Value {
        relock(self.0.lock()).get(key).cloned().unwrap_or_default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        relock(self.0.lock()).insert(key.into(), value);
    }

    pub fn keys(&self) -> Vec<String> {
        relock(self.0.lock()).keys().cloned().collect()
    }

    /// Ordered copy of the current entries.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        relock(self.0.lock())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn shallow_clone(&self) -> Dictionary {
        let copy = Dictionary::new();
        {
            let mut target = relock(copy.0.lock());
            for (k, v) in relock(self.0.lock()).iter() {
                target.insert(k.clone(), v.clone());
            }
        }
        copy
    }

    /// Whether two handles refer to the same dictionary.
    pub fn ptr_eq(&self, other: &Dictionary) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this dictionary. Intended for tests that
    /// verify evaluation releases every handle it clones.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// A callable script function: parameter names, a captured environment,
/// and a shared body expression.
#[derive(Clone, Debug)]
pub struct Function(Arc<FunctionData>);

#[derive(Debug)]
pub(crate) struct FunctionData {
    pub params: Vec<String>,
    pub env: Option<Dictionary>,
    pub side_effect_free: bool,
    pub body: Arc<Expression>,
}

impl Function {
    pub fn new(
        params: Vec<String>,
        env: Option<Dictionary>,
        side_effect_free: bool,
        body: Arc<Expression>,
    ) -> Self {
        Function(Arc::new(FunctionData {
            params,
            env,
            side_effect_free,
            body,
        }))
    }

    pub fn params(&self) -> &[String] {
        &self.0.params
    }

    pub fn env(&self) -> Option<&Dictionary> {
        self.0.env.as_ref()
    }

    /// Whether the function may be called from sandboxed expressions.
    pub fn is_side_effect_free(&self) -> bool {
        self.0.side_effect_free
    }

    pub fn body(&self) -> &Arc<Expression> {
        &self.0.body
    }
}

type Constructor = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// A constructible type: calling it as a function invokes the constructor.
#[derive(Clone)]
pub struct Type(Arc<TypeData>);

struct TypeData {
    name: String,
    constructor: Box<Constructor>,
}

impl Type {
    pub fn new(
        name: impl Into<String>,
        constructor: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Type(Arc::new(TypeData {
            name: name.into(),
            constructor: Box::new(constructor),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn construct(&self, args: &[Value]) -> Result<Value> {
        (self.0.constructor)(args)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type").field("name", &self.0.name).finish()
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(obj) => obj.type_name(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Truthiness: false for Empty, `false`, `0`, `""` and empty
    /// containers are truthy (only the null-ish shapes are false).
    pub fn is_true(&self) -> bool {
        match self {
            Value::Empty => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Object(Object::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Value::Object(Object::Dictionary(d)) => Some(d),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Object(Object::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&Type> {
        match self {
            Value::Object(Object::Type(t)) => Some(t),
            _ => None,
        }
    }

    fn tag_rank(&self) -> u8 {
        match self {
            Value::Empty => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
        }
    }

    /// Total order over all values: by tag rank first, then by value
    /// within a tag (objects order by address).
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Empty, Value::Empty) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Object(a), Value::Object(b)) => a.addr().cmp(&b.addr()),
            _ => self.tag_rank().cmp(&other.tag_rank()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Object(Object::Array(arr)) => {
                write!(f, "[")?;
                for (i, item) in arr.snapshot().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(Object::Dictionary(dict)) => {
                write!(f, "{{")?;
                for (i, (key, value)) in dict.snapshot().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Object(Object::Function(_)) => write!(f, "<function>"),
            Value::Object(Object::Type(t)) => write!(f, "<type {}>", t.name()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Empty => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Object(Object::Array(arr)) => {
                let items = arr.snapshot();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(Object::Dictionary(dict)) => {
                let entries = dict.snapshot();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in &entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Object(Object::Function(_)) => serializer.serialize_str("<function>"),
            Value::Object(Object::Type(t)) => serializer.serialize_str(t.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl From<Array> for Value {
    fn from(arr: Array) -> Self {
        Value::Object(Object::Array(arr))
    }
}

impl From<Dictionary> for Value {
    fn from(dict: Dictionary) -> Self {
        Value::Object(Object::Dictionary(dict))
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::Object(Object::Function(func))
    }
}

impl From<Type> for Value {
    fn from(ty: Type) -> Self {
        Value::Object(Object::Type(ty))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Object(Object::Array(Array::from_vec(items)))
    }
}

/// Render a value as JSON for diagnostics.
pub(crate) fn json_encode(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Compare two strings in constant time with respect to their contents.
///
/// Both sides are hashed with SHA-256 and the digests are XOR-accumulated
/// over their full length with no early exit, so the comparison time does
/// not depend on where the inputs diverge. Intended for credential-like
/// data.
pub fn time_constant_equals(a: &str, b: &str) -> bool {
    let digest_a = Sha256::digest(a.as_bytes());
    let digest_b = Sha256::digest(b.as_bytes());

    let mut diff = 0u8;
    for (x, y) in digest_a.iter().zip(digest_b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}
