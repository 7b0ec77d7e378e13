//! Evaluation frames, the thread-local frame stack, and the import chain.
//!
//! A [`ScriptFrame`] is one activation of evaluation: a `self` value, an
//! optional `locals` dictionary, a sandbox flag, and a bounded depth
//! counter. Creating a frame pushes it onto the calling thread's frame
//! stack, inheriting the parent's current depth and sandbox flag;
//! dropping it pops and asserts it was the top. Evaluation is strictly
//! nested, so the assertion only fires on a real misuse.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Result, ScriptError};
use crate::globals::ScriptGlobal;
use crate::value::{Dictionary, Value};

/// Evaluation refuses to nest deeper than this many expression levels.
pub const MAX_STACK_DEPTH: u32 = 300;

#[derive(Debug)]
struct FrameInner {
    self_: RefCell<Value>,
    locals: RefCell<Option<Dictionary>>,
    sandboxed: Cell<bool>,
    depth: Cell<u32>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Rc<FrameInner>>> = const { RefCell::new(Vec::new()) };
}

/// The import chain: an ordered snapshot of namespace dictionaries
/// consulted when resolving free names. Replaced copy-on-write so readers
/// iterate a consistent snapshot without holding any lock.
static IMPORTS: Lazy<RwLock<Arc<Vec<Dictionary>>>> =
    Lazy::new(|| RwLock::new(Arc::new(Vec::new())));

/// One activation of script evaluation.
///
/// The handle is not `Clone`; the only way to obtain a second handle to a
/// live frame is [`ScriptFrame::current_frame`], which returns a
/// non-owning view that does not pop on drop.
#[derive(Debug)]
pub struct ScriptFrame {
    inner: Rc<FrameInner>,
    owns_stack_slot: bool,
}

impl ScriptFrame {
    /// A frame whose `self` is the script-globals dictionary.
    pub fn new() -> Self {
        Self::with_self(ScriptGlobal::globals().into())
    }

    /// A frame evaluating against an explicit `self` value.
    pub fn with_self(self_: Value) -> Self {
        let inner = Rc::new(FrameInner {
            self_: RefCell::new(self_),
            locals: RefCell::new(None),
            sandboxed: Cell::new(false),
            depth: Cell::new(0),
        });

        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(parent) = frames.last() {
                inner.sandboxed.set(parent.sandboxed.get());
                inner.depth.set(parent.depth.get());
            }
            frames.push(Rc::clone(&inner));
        });

        ScriptFrame {
            inner,
            owns_stack_slot: true,
        }
    }

    /// A non-owning view of the frame currently on top of this thread's
    /// stack, if any.
    pub fn current_frame() -> Option<ScriptFrame> {
        FRAMES.with(|frames| frames.borrow().last().cloned()).map(|inner| ScriptFrame {
            inner,
            owns_stack_slot: false,
        })
    }

    pub fn increase_stack_depth(&self) -> Result<()> {
        let depth = self.inner.depth.get();
        if depth + 1 > MAX_STACK_DEPTH {
            return Err(ScriptError::recursion_too_deep());
        }
        self.inner.depth.set(depth + 1);
        Ok(())
    }

    pub fn decrease_stack_depth(&self) {
        let depth = self.inner.depth.get();
        self.inner.depth.set(depth.saturating_sub(1));
    }

    pub fn depth(&self) -> u32 {
        self.inner.depth.get()
    }

    pub fn self_(&self) -> Value {
        self.inner.self_.borrow().clone()
    }

    pub fn set_self(&self, value: Value) {
        *self.inner.self_.borrow_mut() = value;
    }

    /// Exchange `self` with another value in place; used by object-body
    /// evaluation which must restore the original on every exit path.
    pub fn swap_self(&self, value: &mut Value) {
        std::mem::swap(&mut *self.inner.self_.borrow_mut(), value);
    }

    pub fn has_locals(&self) -> bool {
        self.inner.locals.borrow().is_some()
    }

    /// The locals dictionary, created on first access.
    pub fn locals(&self) -> Dictionary {
        let mut locals = self.inner.locals.borrow_mut();
        match &*locals {
            Some(dict) => dict.clone(),
            None => {
                let dict = Dictionary::new();
                *locals = Some(dict.clone());
                dict
            }
        }
    }

    pub fn set_locals(&self, locals: Dictionary) {
        *self.inner.locals.borrow_mut() = Some(locals);
    }

    pub fn sandboxed(&self) -> bool {
        self.inner.sandboxed.get()
    }

    pub fn set_sandboxed(&self, sandboxed: bool) {
        self.inner.sandboxed.set(sandboxed);
    }

    /// The current import-chain snapshot.
    pub fn imports() -> Arc<Vec<Dictionary>> {
        IMPORTS
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish a new import-chain snapshot with `import` appended.
    /// Readers holding the previous snapshot are not disturbed.
    pub fn add_import(import: Dictionary) {
        let mut guard = IMPORTS
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut copy = (**guard).clone();
        copy.push(import);
        *guard = Arc::new(copy);
    }
}

impl Default for ScriptFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScriptFrame {
    fn drop(&mut self) {
        if !self.owns_stack_slot {
            return;
        }
        FRAMES.with(|frames| {
            let top = frames
                .borrow_mut()
                .pop()
                .expect("script frame stack underflow");
            assert!(
                Rc::ptr_eq(&top, &self.inner),
                "script frame popped out of order"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_limit_boundary() {
        let frame = ScriptFrame::new();
        for _ in 0..MAX_STACK_DEPTH {
            frame.increase_stack_depth().unwrap();
        }
        assert_eq!(frame.depth(), MAX_STACK_DEPTH);
        let err = frame.increase_stack_depth().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::RecursionTooDeep);
        // The failed increment did not change the counter.
        assert_eq!(frame.depth(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_child_inherits_depth_and_sandbox() {
        let parent = ScriptFrame::new();
        parent.set_sandboxed(true);
        for _ in 0..5 {
            parent.increase_stack_depth().unwrap();
        }

        let child = ScriptFrame::with_self(Value::Empty);
        assert_eq!(child.depth(), 5);
        assert!(child.sandboxed());
        drop(child);
        drop(parent);
    }

    #[test]
    fn test_current_frame_is_the_top() {
        let outer = ScriptFrame::new();
        {
            let inner = ScriptFrame::with_self(Value::Number(1.0));
            let current = ScriptFrame::current_frame().unwrap();
            assert_eq!(current.self_(), inner.self_());
        }
        let current = ScriptFrame::current_frame().unwrap();
        assert_eq!(current.self_(), outer.self_());
    }

    #[test]
    fn test_locals_created_lazily() {
        let frame = ScriptFrame::new();
        assert!(!frame.has_locals());
        frame.locals().insert("x", Value::Number(1.0));
        assert!(frame.has_locals());
        assert_eq!(frame.locals().get("x"), Value::Number(1.0));
    }

    #[test]
    fn test_imports_are_copy_on_write() {
        let before = ScriptFrame::imports();
        let marker = Dictionary::new();
        marker.insert("frame_rs_import_marker", Value::Bool(true));
        ScriptFrame::add_import(marker);

        // The old snapshot is untouched; a fresh one sees the addition.
        assert!(!before
            .iter()
            .any(|dict| dict.has("frame_rs_import_marker")));
        assert!(ScriptFrame::imports()
            .iter()
            .any(|dict| dict.has("frame_rs_import_marker")));
    }
}
