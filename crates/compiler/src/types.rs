//! Compile-time type stack: mirrors the runtime value stack one entry per
//! value, so each arithmetic/comparison/cast opcode can be monomorphized
//! against the operand types already known at compile time.
//!
//! The compiler tracks, alongside the bytecode it is emitting, the tag each
//! value on the eventual runtime stack will carry. This lets a single
//! source-level `+` be monomorphized to `ADD_INT`/`ADD_DOUBLE`/`ADD_POINTER`/
//! `ADD_OBJECT` without a runtime type check. Palladium's stack effects are
//! never row-polymorphic: every function's parameter and return tags are
//! declared, not inferred.

use pd_core::ValueTag;
use std::fmt;

/// The compile-time type stack threaded through expression compilation.
#[derive(Debug, Clone, Default)]
pub struct TypeStack(Vec<ValueTag>);

impl TypeStack {
    pub fn new() -> Self {
        TypeStack(Vec::new())
    }

    pub fn push(&mut self, tag: ValueTag) {
        self.0.push(tag);
    }

    pub fn pop(&mut self) -> Option<ValueTag> {
        self.0.pop()
    }

    pub fn peek(&self) -> Option<&ValueTag> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Truncate back to `len`, used when unwinding a failed expression so a
    /// single bad statement doesn't desynchronize the type stack for the
    /// rest of panic-mode recovery.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl fmt::Display for TypeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        write!(f, "]")
    }
}

/// The declared signature of a function or builtin: parameter tags in
/// declaration order, plus an optional return tag (`None` = `void`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValueTag>,
    pub return_tag: Option<ValueTag>,
    /// When set, `params`' tags are only consulted for arity (how many
    /// arguments), not for matching — `stl.tostr` is the one native that
    /// accepts any of Integer/Double/Bool/Character, which a single fixed
    /// `ValueTag` can't express.
    pub any_params: bool,
}

impl Signature {
    pub fn new(params: Vec<ValueTag>, return_tag: Option<ValueTag>) -> Self {
        Signature {
            params,
            return_tag,
            any_params: false,
        }
    }

    /// Like [`Signature::new`], but argument tags are not checked against
    /// `params` — only their count.
    pub fn new_any_params(params: Vec<ValueTag>, return_tag: Option<ValueTag>) -> Self {
        Signature {
            params,
            return_tag,
            any_params: true,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> ")?;
        match &self.return_tag {
            Some(t) => write!(f, "{t}"),
            None => write!(f, "void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_roundtrips() {
        let mut stack = TypeStack::new();
        stack.push(ValueTag::Integer);
        stack.push(ValueTag::Double);
        assert_eq!(stack.pop(), Some(ValueTag::Double));
        assert_eq!(stack.pop(), Some(ValueTag::Integer));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn truncate_unwinds_to_a_prior_depth() {
        let mut stack = TypeStack::new();
        stack.push(ValueTag::Integer);
        let mark = stack.len();
        stack.push(ValueTag::Bool);
        stack.push(ValueTag::String);
        stack.truncate(mark);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.peek(), Some(&ValueTag::Integer));
    }

    #[test]
    fn signature_display() {
        let sig = Signature::new(vec![ValueTag::Integer, ValueTag::Double], Some(ValueTag::Bool));
        assert_eq!(sig.to_string(), "(int, double) -> bool");
    }
}
