//! Compiler configuration — the one extension seam a host embedding
//! `pd-compiler` gets: declared native-global signatures, not FFI
//! manifests or optimization levels.

use crate::types::Signature;
use pd_core::ValueTag;
use std::collections::HashMap;

/// A native global's declared signature, registered before compilation so
/// the compiler can type-check calls to it the same way it type-checks
/// calls to a Palladium-defined `fun`. Builtins are never embedded as raw
/// pointers into the bytecode, so a call needs this side table to know
/// what it's calling.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Builtin globals available by name at program start, e.g. `clock`.
    globals: HashMap<Box<str>, Signature>,
    /// Signatures of builtin-typed fields on a named struct template, e.g.
    /// `stl.write`, keyed by `(template name, field name)`. Needed because
    /// [`ValueTag::Builtin`] carries no signature of its own — a struct
    /// field only records its declared tag, not an arity/return-tag pair —
    /// so calls reached through `stl.<field>(...)` are checked against this
    /// side table instead of the field's own (signature-less) tag.
    struct_field_signatures: HashMap<(Box<str>, Box<str>), Signature>,
    /// Declared fields of builtin structs, e.g. `stl`, in declaration order.
    struct_templates: HashMap<Box<str>, Vec<(Box<str>, ValueTag)>>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig {
            globals: HashMap::new(),
            struct_field_signatures: HashMap::new(),
            struct_templates: HashMap::new(),
        }
    }

    /// The configuration the CLI and test harness use by default: the
    /// `stl` struct and the top-level `clock()` global.
    pub fn with_standard_library() -> Self {
        let mut config = Self::new();
        config.with_builtin("clock", Signature::new(vec![], Some(ValueTag::Integer)));

        let ptr_string = ValueTag::Pointer(Box::new(ValueTag::String));
        config.with_struct_template(
            "stl",
            vec![
                ("argc".into(), ValueTag::Integer),
                ("argv".into(), ptr_string),
                ("pi".into(), ValueTag::Double),
                ("E".into(), ValueTag::Double),
                ("write".into(), ValueTag::Builtin),
                ("tostr".into(), ValueTag::Builtin),
                ("square".into(), ValueTag::Builtin),
                ("atoi".into(), ValueTag::Builtin),
                ("readint".into(), ValueTag::Builtin),
            ],
        );
        config.with_struct_field_signature("stl", "write", Signature::new(vec![ValueTag::String], None));
        // tostr accepts any of Integer/Double/Bool/Character; the
        // placeholder param tag only fixes the arity at one.
        config.with_struct_field_signature(
            "stl",
            "tostr",
            Signature::new_any_params(vec![ValueTag::Integer], Some(ValueTag::String)),
        );
        config.with_struct_field_signature(
            "stl",
            "square",
            Signature::new(vec![ValueTag::Integer], Some(ValueTag::Integer)),
        );
        config.with_struct_field_signature(
            "stl",
            "atoi",
            Signature::new(vec![ValueTag::String], Some(ValueTag::Integer)),
        );
        config.with_struct_field_signature("stl", "readint", Signature::new(vec![], Some(ValueTag::Integer)));
        config
    }

    pub fn with_builtin(&mut self, name: impl Into<Box<str>>, signature: Signature) -> &mut Self {
        self.globals.insert(name.into(), signature);
        self
    }

    pub fn with_struct_template(
        &mut self,
        name: impl Into<Box<str>>,
        fields: Vec<(Box<str>, ValueTag)>,
    ) -> &mut Self {
        self.struct_templates.insert(name.into(), fields);
        self
    }

    pub fn with_struct_field_signature(
        &mut self,
        template: impl Into<Box<str>>,
        field: impl Into<Box<str>>,
        signature: Signature,
    ) -> &mut Self {
        self.struct_field_signatures.insert((template.into(), field.into()), signature);
        self
    }

    pub fn builtin_signature(&self, name: &str) -> Option<&Signature> {
        self.globals.get(name)
    }

    pub fn builtins(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.globals.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn struct_templates(&self) -> impl Iterator<Item = (&str, &[(Box<str>, ValueTag)])> {
        self.struct_templates.iter().map(|(k, v)| (k.as_ref(), v.as_slice()))
    }

    pub fn struct_field_signature(&self, template: &str, field: &str) -> Option<&Signature> {
        self.struct_field_signatures.get(&(template.into(), field.into()))
    }
}
