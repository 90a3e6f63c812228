//! Standard-library wiring: the script-visible `stl` struct and its native
//! functions.
//!
//! `original_source/src/builtins.c`'s `initBuiltins` does this with two bare
//! `tableSet` calls (`clock`, `p_square`) directly into the VM's globals
//! table. Palladium grows that into a whole `stl` struct instance plus a
//! top-level `clock`; this module is the runtime counterpart, building that
//! instance once at VM start and installing it the same way — straight
//! `Table::set` calls into the globals the compiled chunk's `GLOBAL_GET`s
//! already expect.

use pd_core::{
    fnv1a_hash, Address, BuiltinFn, BuiltinHost, BuiltinObj, Heap, Object, ObjHandle, PointeeTag, StructObj, Table,
    Value,
};
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value_display;

/// I/O the VM's opcodes and native builtins both go through: a captured
/// writer (so tests can assert on stdout instead of the real console) and
/// real stdin for `readint`.
pub struct Host<W: Write> {
    writer: W,
}

impl<W: Write> Host<W> {
    pub fn new(writer: W) -> Self {
        Host { writer }
    }

    pub fn print_line(&mut self, s: &str) {
        let _ = writeln!(self.writer, "{s}");
    }

    pub fn write_raw(&mut self, s: &str) {
        let _ = write!(self.writer, "{s}");
    }

    pub fn read_line(&mut self) -> String {
        let mut buf = String::new();
        let _ = io::stdin().read_line(&mut buf);
        buf.trim_end_matches(['\n', '\r']).to_string()
    }

    pub fn unix_time(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }
}

/// Find an already-interned `String` object equal to `s`, or allocate one.
///
/// The compiler's own [`pd_core::Interner`] already populated `heap` with a
/// `String` object for every identifier the compiled chunk's `GLOBAL_GET`s
/// name — including `stl` and `clock`, if the script mentions them. The
/// globals [`Table`] is keyed by `ObjHandle` identity, so installing the
/// standard library under a *different* handle for the same text would
/// desync it from those compiled references. Searching the heap for a
/// content match (rather than allocating unconditionally) is what keeps the
/// two in agreement.
fn find_or_intern(heap: &mut Heap, s: &str) -> ObjHandle {
    for i in 0..heap.len() as u32 {
        let handle = ObjHandle(i);
        if heap.get(handle).as_string() == Some(s) {
            return handle;
        }
    }
    heap.alloc(Object::String(s.into()))
}

fn native_clock(host: &mut dyn BuiltinHost, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Integer(host.unix_time() as i32))
}

fn native_write(host: &mut dyn BuiltinHost, args: &[Value]) -> Result<Value, String> {
    let Some(Value::Object(handle)) = args.first() else {
        return Err("stl.write expects a string argument".to_string());
    };
    let s = host.heap().get(*handle).as_string().ok_or("stl.write expects a string argument")?.to_string();
    host.write_raw(&s);
    Ok(Value::Null)
}

fn native_tostr(host: &mut dyn BuiltinHost, args: &[Value]) -> Result<Value, String> {
    let value = args.first().copied().ok_or("stl.tostr expects one argument")?;
    let rendered = value_display::display(&value, host.heap());
    Ok(Value::Object(host.intern(&rendered)))
}

fn native_square(_host: &mut dyn BuiltinHost, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Integer(i)) => Ok(Value::Integer(i.wrapping_mul(*i))),
        _ => Err("stl.square expects an integer argument".to_string()),
    }
}

/// `atoi`: leading optional `-`, then digits, stopping at the first
/// non-digit (the classic C `atoi` convention — unparseable input yields 0,
/// not an error, matching `original_source/src/compiler.c`'s own use of
/// `atoi` for integer literals).
fn native_atoi(host: &mut dyn BuiltinHost, args: &[Value]) -> Result<Value, String> {
    let Some(Value::Object(handle)) = args.first() else {
        return Err("stl.atoi expects a string argument".to_string());
    };
    let s = host.heap().get(*handle).as_string().ok_or("stl.atoi expects a string argument")?.to_string();
    let mut chars = s.trim_start().chars().peekable();
    let negative = matches!(chars.peek(), Some('-')) && {
        chars.next();
        true
    };
    let mut value: i32 = 0;
    for c in chars {
        match c.to_digit(10) {
            Some(d) => value = value.wrapping_mul(10).wrapping_add(d as i32),
            None => break,
        }
    }
    Ok(Value::Integer(if negative { value.wrapping_neg() } else { value }))
}

fn native_readint(host: &mut dyn BuiltinHost, _args: &[Value]) -> Result<Value, String> {
    let line = host.read_line();
    Ok(Value::Integer(line.trim().parse().unwrap_or(0)))
}

fn alloc_builtin(heap: &mut Heap, name: &str, func: BuiltinFn) -> ObjHandle {
    let name_handle = heap.alloc(Object::String(name.into()));
    heap.alloc(Object::Builtin(BuiltinObj {
        name: name_handle,
        arity: 0,
        return_tag: None,
        arg_tags: Vec::new(),
        func,
    }))
}

/// The struct template the compiler declared for `stl`
/// (`pd_compiler::config::CompilerConfig::with_standard_library`), looked
/// up by name rather than assumed to sit at a fixed heap slot.
fn find_struct_template(heap: &Heap, name: &str) -> Option<ObjHandle> {
    for i in 0..heap.len() as u32 {
        let handle = ObjHandle(i);
        if let Object::StructTemplate(t) = heap.get(handle) {
            if heap.get(t.name).as_string() == Some(name) {
                return Some(handle);
            }
        }
    }
    None
}

/// Build the `stl` struct instance and the top-level `clock` global, and
/// install both into `globals` under the same handles the compiled chunk's
/// `GLOBAL_GET`s already reference.
///
/// `script_args` becomes `stl.argc`/`stl.argv` — everything on the command
/// line after the source file path.
pub fn install_standard_library(heap: &mut Heap, globals: &mut Table, script_args: &[String]) {
    let clock_handle = alloc_builtin(heap, "clock", native_clock);
    let clock_name = find_or_intern(heap, "clock");
    globals.set(clock_name, fnv1a_hash(b"clock"), Value::Object(clock_handle));

    let Some(template_handle) = find_struct_template(heap, "stl") else {
        // The script never declared/used `stl` (e.g. a config without the
        // standard library) — nothing further to install.
        return;
    };

    let arg_handles: Vec<Value> = script_args.iter().map(|a| Value::Object(heap.alloc(Object::String(a.as_str().into())))).collect();
    let argv_memory = heap.alloc(Object::Memory(arg_handles));
    let argv_value = Value::Pointer {
        addr: Address::Memory { handle: argv_memory, index: 0 },
        pointee: PointeeTag::String,
    };

    let write_handle = Value::Object(alloc_builtin(heap, "write", native_write));
    let tostr_handle = Value::Object(alloc_builtin(heap, "tostr", native_tostr));
    let square_handle = Value::Object(alloc_builtin(heap, "square", native_square));
    let atoi_handle = Value::Object(alloc_builtin(heap, "atoi", native_atoi));
    let readint_handle = Value::Object(alloc_builtin(heap, "readint", native_readint));

    let field_order: Vec<(Box<str>, pd_core::ValueTag)> = match heap.get(template_handle) {
        Object::StructTemplate(t) => t.fields.clone(),
        _ => unreachable!("find_struct_template only returns StructTemplate handles"),
    };

    let mut cells = vec![Value::Null; field_order.len()];
    for (index, (name, _)) in field_order.iter().enumerate() {
        cells[index] = match name.as_ref() {
            "argc" => Value::Integer(script_args.len() as i32),
            "argv" => argv_value,
            "pi" => Value::Double(std::f64::consts::PI),
            "E" => Value::Double(std::f64::consts::E),
            "write" => write_handle,
            "tostr" => tostr_handle,
            "square" => square_handle,
            "atoi" => atoi_handle,
            "readint" => readint_handle,
            _ => Value::Null,
        };
    }
    let memory_handle = heap.alloc(Object::Memory(cells));
    let struct_handle = heap.alloc(Object::Struct(StructObj {
        template: template_handle,
        memory: memory_handle,
    }));

    let stl_name = find_or_intern(heap, "stl");
    globals.set(stl_name, fnv1a_hash(b"stl"), Value::Object(struct_handle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::Object;

    #[test]
    fn clock_is_reachable_under_the_handle_globalget_already_uses() {
        let mut heap = Heap::new();
        // Simulate the compiler having already interned "clock" for a
        // `GLOBAL_GET` in the compiled chunk.
        let compiled_handle = heap.alloc(Object::String("clock".into()));
        let mut globals = Table::new();
        install_standard_library(&mut heap, &mut globals, &[]);
        assert!(globals.get(compiled_handle, fnv1a_hash(b"clock")).is_some());
    }

    #[test]
    fn no_stl_template_skips_installation_without_panicking() {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        install_standard_library(&mut heap, &mut globals, &[]);
        let name = find_or_intern(&mut heap, "stl");
        assert!(globals.get(name, fnv1a_hash(b"stl")).is_none());
    }
}
