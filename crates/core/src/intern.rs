//! String interning.
//!
//! The original VM locates an existing interned `String` by comparing
//! `(chars, length, hash)` against every live entry of the general hash
//! table, since it has no other way to look a string up before it owns a
//! handle to it. In Rust there's a direct way to do the same lookup — a
//! content-keyed map — so the interner here is a `HashMap<Box<str>,
//! ObjHandle>` rather than a second open-addressed probe sequence; it
//! preserves the one invariant that matters — one `String` object per
//! distinct payload — without reimplementing `findEntry` a second time for
//! a key type the generic [`crate::Table`] can't address.

use crate::object::{Heap, Object};
use crate::value::ObjHandle;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Interner {
    handles: HashMap<Box<str>, ObjHandle>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle of the single `String` object for `s`, allocating
    /// it on `heap` the first time `s` is seen.
    pub fn intern(&mut self, heap: &mut Heap, s: &str) -> ObjHandle {
        if let Some(handle) = self.handles.get(s) {
            return *handle;
        }
        let handle = heap.alloc(Object::String(s.into()));
        self.handles.insert(s.into(), handle);
        handle
    }

    pub fn get(&self, s: &str) -> Option<ObjHandle> {
        self.handles.get(s).copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "hello");
        let b = interner.intern(&mut heap, "hello");
        assert_eq!(a, b);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn distinct_strings_get_distinct_handles() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "foo");
        let b = interner.intern(&mut heap, "bar");
        assert_ne!(a, b);
    }
}
