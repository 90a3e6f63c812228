//! The bytecode interpreter.
//!
//! A straightforward fetch-decode-execute loop over a `Vec<Value>` operand
//! stack and a `Vec<CallFrame>` call stack, grounded in `vm.c`'s `run()` for
//! the instructions that survive unchanged (arithmetic, unary, equality,
//! constants, print) and designed fresh, in the same dispatch style, for
//! everything `vm.c`'s snapshot predates: globals, locals, jumps, calls, and
//! structs.

use crate::builtins::Host;
use crate::error::RuntimeError;
use crate::value_display;
use pd_core::{fnv1a_hash, Address, Heap, Object, ObjHandle, OpCode, PointeeTag, StructObj, Table, Value};
use std::io::Write;
use tracing::{debug, trace, warn};

const FRAME_MAX: usize = 64;
/// Frame depth at which `call()` starts warning before the hard `FRAME_MAX`
/// cutoff, so a runaway recursion shows up in logs before it aborts the run.
const FRAME_WARN_THRESHOLD: usize = FRAME_MAX - 8;

struct CallFrame {
    function: ObjHandle,
    ip: usize,
    slot_base: usize,
}

/// The running machine: value stack, call stack, globals, and the shared
/// heap the compiler already populated with interned strings, struct
/// templates, and function objects.
pub struct Vm<W: Write> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Declared tag of every global, by name handle — lets `GLOBAL_GET`
    /// transparently follow a write-back pointer left by `&global` the same
    /// way locals do.
    global_tags: std::collections::HashMap<ObjHandle, pd_core::ValueTag>,
    host: Host<W>,
}

/// The outcome of a whole-program run: `Ok(())` on a clean `RETURN` from the
/// top-level script, `Err` carrying the fault and unwound call trace.
pub type VmResult = Result<(), RuntimeError>;

impl<W: Write> Vm<W> {
    pub fn new(heap: Heap, writer: W) -> Self {
        Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            global_tags: std::collections::HashMap::new(),
            host: Host::new(writer),
        }
    }

    /// Record each global's declared tag (`pd_compiler::CompileArtifact::global_tags`),
    /// consulted by `GLOBAL_GET` to transparently dereference a write-back
    /// pointer left by `&global` the same way `LOCAL_GET` does for locals.
    pub fn load_global_tags(&mut self, tags: impl IntoIterator<Item = (ObjHandle, pd_core::ValueTag)>) {
        self.global_tags.extend(tags);
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Build the `stl` struct instance and `clock` global and install them
    /// into this VM's globals table. `script_args` becomes `stl.argc`/
    /// `stl.argv`.
    pub fn install_standard_library(&mut self, script_args: &[String]) {
        crate::builtins::install_standard_library(&mut self.heap, &mut self.globals, script_args);
    }

    /// Allocate a fresh `String` object for `s`. Unlike global lookups
    /// (keyed by handle identity in [`Table`]), a builtin-constructed string
    /// like `stl.tostr`'s output is never looked up by name, so it doesn't
    /// need to match a pre-existing handle the way `install_standard_library`'s
    /// globals do.
    pub fn intern(&mut self, s: &str) -> ObjHandle {
        self.heap.alloc(Object::String(s.into()))
    }

    pub fn define_global(&mut self, name: ObjHandle, value: Value) {
        let hash = self.global_hash(name);
        self.globals.set(name, hash, value);
    }

    /// Globals are keyed by `ObjHandle` identity in [`Table::find_slot`], but
    /// hashed by the name's bytes — recomputed here rather than cached,
    /// since a handle's string content never changes after interning.
    fn global_hash(&self, name: ObjHandle) -> u32 {
        fnv1a_hash(self.heap.get(name).as_string().unwrap_or("").as_bytes())
    }

    fn function(&self, handle: ObjHandle) -> &pd_core::FunctionObj {
        match self.heap.get(handle) {
            Object::Function(f) => f,
            other => panic!("frame function handle did not name a Function object: {:?}", other.kind_name()),
        }
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("at least one active frame");
        self.function(frame.function).chunk.line_at(frame.ip.saturating_sub(1))
    }

    fn trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|f| {
                let name = self.function(f.function).name;
                self.heap.get(name).as_string().unwrap_or("?").to_string()
            })
            .collect()
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let line = self.current_line();
        debug!(line, %message, "runtime error");
        RuntimeError::new(line, message, self.trace())
    }

    /// Run the program starting from `script`, a top-level `FunctionObj`
    /// already pushed into the heap by the caller.
    pub fn run(&mut self, script: ObjHandle) -> VmResult {
        debug!("starting VM run");
        self.frames.push(CallFrame {
            function: script,
            ip: 0,
            slot_base: 0,
        });
        self.execute()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("active frame");
        let byte = self.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, index: u8) -> Value {
        let frame = self.frames.last().expect("active frame");
        self.function(frame.function).chunk.constants[index as usize]
    }

    fn slot_base(&self) -> usize {
        self.frames.last().expect("active frame").slot_base
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| self.error("value stack underflow"))
    }

    fn peek(&self, back: usize) -> Result<Value, RuntimeError> {
        self.stack
            .get(self.stack.len().wrapping_sub(1 + back))
            .copied()
            .ok_or_else(|| self.error("value stack underflow"))
    }

    fn read_address(&self, addr: &Address) -> Result<Value, RuntimeError> {
        match addr {
            Address::Stack(i) => self.stack.get(*i).copied().ok_or_else(|| self.error("dangling stack pointer")),
            Address::Memory { handle, index } => match self.heap.get(*handle) {
                Object::Reference(v) => Ok(*v),
                Object::Memory(cells) => cells.get(*index).copied().ok_or_else(|| self.error("pointer out of bounds")),
                _ => Err(self.error("pointer does not reference a value cell")),
            },
        }
    }

    fn write_address(&mut self, addr: &Address, value: Value) -> Result<(), RuntimeError> {
        match addr {
            Address::Stack(i) => {
                if let Some(slot) = self.stack.get_mut(*i) {
                    *slot = value;
                    Ok(())
                } else {
                    Err(self.error("dangling stack pointer"))
                }
            }
            Address::Memory { handle, index } => match self.heap.get_mut(*handle) {
                Object::Reference(v) => {
                    *v = value;
                    Ok(())
                }
                Object::Memory(cells) => {
                    if let Some(slot) = cells.get_mut(*index) {
                        *slot = value;
                        Ok(())
                    } else {
                        Err(self.error("pointer out of bounds"))
                    }
                }
                _ => Err(self.error("pointer does not reference a value cell")),
            },
        }
    }

    fn pointee_tag_of(&self, value: &Value) -> PointeeTag {
        match value {
            Value::Null => PointeeTag::Null,
            Value::Integer(_) => PointeeTag::Integer,
            Value::Double(_) => PointeeTag::Double,
            Value::Bool(_) => PointeeTag::Bool,
            Value::Character(_) => PointeeTag::Character,
            Value::Pointer { .. } => PointeeTag::Object,
            Value::Object(handle) => match self.heap.get(*handle) {
                Object::String(_) => PointeeTag::String,
                _ => PointeeTag::Object,
            },
        }
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(x), Value::Integer(y)) => x == y,
            (Value::Double(x), Value::Double(y)) => x == y,
            (Value::Integer(x), Value::Double(y)) | (Value::Double(y), Value::Integer(x)) => x as f64 == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Character(x), Value::Character(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => {
                x == y || self.heap.get(x).as_string().is_some() && self.heap.get(x).as_string() == self.heap.get(y).as_string()
            }
            (Value::Pointer { addr: a, .. }, Value::Pointer { addr: b, .. }) => a == b,
            _ => false,
        }
    }

    fn execute(&mut self) -> VmResult {
        loop {
            if self.frames.is_empty() {
                return Ok(());
            }
            let byte = self.read_byte();
            let Some(op) = OpCode::from_u8(byte) else {
                return Err(self.error("unrecognized opcode"));
            };

            match op {
                OpCode::Return => {
                    // An empty stack here is expected for a void function or
                    // a script with nothing left to pop, not a fault.
                    let result = self.stack.pop().unwrap_or(Value::Null);
                    let frame = self.frames.pop().expect("checked non-empty");
                    trace!(depth = self.frames.len(), "RETURN");
                    self.stack.truncate(frame.slot_base.saturating_sub(1).max(0));
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Null => self.push(Value::Null),
                OpCode::NullPointer => self.push(Value::Pointer {
                    addr: Address::Stack(usize::MAX),
                    pointee: PointeeTag::Null,
                }),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(self.error("stack underflow on SWAP"));
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                OpCode::ConstantInt
                | OpCode::ConstantDouble
                | OpCode::ConstantBool
                | OpCode::ConstantCharacter
                | OpCode::ConstantString => {
                    let index = self.read_byte();
                    let value = self.read_constant(index);
                    self.push(value);
                }

                OpCode::AddInt => self.binary_int(|a, b| a.wrapping_add(b))?,
                OpCode::SubInt => self.binary_int(|a, b| a.wrapping_sub(b))?,
                OpCode::MulInt => self.binary_int(|a, b| a.wrapping_mul(b))?,
                OpCode::DivInt => {
                    let b = self.pop_int()?;
                    let a = self.pop_int()?;
                    if b == 0 {
                        return Err(self.error("division by zero"));
                    }
                    self.push(Value::Integer(a.wrapping_div(b)));
                }
                OpCode::AddDouble => self.binary_double(|a, b| a + b)?,
                OpCode::SubDouble => self.binary_double(|a, b| a - b)?,
                OpCode::MulDouble => self.binary_double(|a, b| a * b)?,
                OpCode::DivDouble => self.binary_double(|a, b| a / b)?,
                OpCode::AddPointer => self.pointer_offset(1)?,
                OpCode::SubPointer => self.pointer_offset(-1)?,
                OpCode::AddObject => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let (Value::Object(ha), Value::Object(hb)) = (a, b) else {
                        return Err(self.error("ADD_OBJECT requires two string operands"));
                    };
                    let sa = self.heap.get(ha).as_string().ok_or_else(|| self.error("ADD_OBJECT operand is not a string"))?;
                    let sb = self.heap.get(hb).as_string().ok_or_else(|| self.error("ADD_OBJECT operand is not a string"))?;
                    let joined = format!("{sa}{sb}");
                    let handle = self.heap.alloc(Object::String(joined.into_boxed_str()));
                    self.push(Value::Object(handle));
                }

                OpCode::GreaterInt => self.compare_int(|a, b| a > b)?,
                OpCode::GreaterDouble => self.compare_double(|a, b| a > b)?,
                OpCode::GreaterEqualInt => self.compare_int(|a, b| a >= b)?,
                OpCode::GreaterEqualDouble => self.compare_double(|a, b| a >= b)?,
                OpCode::LessInt => self.compare_int(|a, b| a < b)?,
                OpCode::LessDouble => self.compare_double(|a, b| a < b)?,
                OpCode::LessEqualInt => self.compare_int(|a, b| a <= b)?,
                OpCode::LessEqualDouble => self.compare_double(|a, b| a <= b)?,
                OpCode::Equality => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(self.values_equal(a, b)));
                }
                OpCode::NotBool => {
                    let Value::Bool(b) = self.pop()? else {
                        return Err(self.error("NOT_BOOL requires a boolean operand"));
                    };
                    self.push(Value::Bool(!b));
                }

                OpCode::NegateInt => {
                    let v = self.pop_int()?;
                    self.push(Value::Integer(v.wrapping_neg()));
                }
                OpCode::NegateDouble => {
                    let Value::Double(v) = self.pop()? else {
                        return Err(self.error("NEGATE_DOUBLE requires a double operand"));
                    };
                    self.push(Value::Double(-v));
                }
                OpCode::NotNumber => {
                    let value = self.pop()?;
                    let truthy = match value {
                        Value::Integer(i) => i > 0,
                        Value::Double(d) => d > 0.0,
                        _ => return Err(self.error("NOT_NUMBER requires a numeric operand")),
                    };
                    self.push(Value::Bool(!truthy));
                }
                OpCode::HeapReference => {
                    let value = self.pop()?;
                    let pointee = self.pointee_tag_of(&value);
                    let handle = self.heap.alloc(Object::Reference(value));
                    self.push(Value::Pointer {
                        addr: Address::Memory { handle, index: 0 },
                        pointee,
                    });
                }
                OpCode::StackReference => {
                    return Err(self.error("STACK_REFERENCE is reserved and never emitted"));
                }
                OpCode::Dereference => {
                    let Value::Pointer { addr, .. } = self.pop()? else {
                        return Err(self.error("DEREFERENCE requires a pointer operand"));
                    };
                    let value = self.read_address(&addr)?;
                    self.push(value);
                }

                OpCode::ArithmeticCastIntDouble => {
                    let v = self.pop_int()?;
                    self.push(Value::Double(v as f64));
                }
                OpCode::ArithmeticCastDoubleInt => {
                    let Value::Double(v) = self.pop()? else {
                        return Err(self.error("cast expects a double operand"));
                    };
                    self.push(Value::Integer(v as i32));
                }
                OpCode::ArithmeticCastCharInt => {
                    let Value::Character(c) = self.pop()? else {
                        return Err(self.error("cast expects a char operand"));
                    };
                    self.push(Value::Integer(c as i32));
                }
                OpCode::ArithmeticCastCharDouble => {
                    let Value::Character(c) = self.pop()? else {
                        return Err(self.error("cast expects a char operand"));
                    };
                    self.push(Value::Double(c as f64));
                }
                OpCode::ArithmeticCastIntChar => {
                    let v = self.pop_int()?;
                    self.push(Value::Character(v as u8));
                }
                OpCode::PointerCast => {
                    let tag_byte = self.read_byte();
                    let pointee = PointeeTag::from_u8(tag_byte).ok_or_else(|| self.error("invalid pointee tag operand"))?;
                    let Value::Pointer { addr, .. } = self.pop()? else {
                        return Err(self.error("POINTER_CAST requires a pointer operand"));
                    };
                    self.push(Value::Pointer { addr, pointee });
                }
                OpCode::ObjectCast => {
                    let index = self.read_byte();
                    let template = self.read_constant(index);
                    let Value::Object(template_handle) = template else {
                        return Err(self.error("OBJECT_CAST constant is not a struct template"));
                    };
                    let Value::Object(instance_handle) = self.pop()? else {
                        return Err(self.error("OBJECT_CAST requires a struct operand"));
                    };
                    let memory = match self.heap.get(instance_handle) {
                        Object::Struct(s) => s.memory,
                        _ => return Err(self.error("OBJECT_CAST operand is not a struct instance")),
                    };
                    let recast = self.heap.alloc(Object::Struct(StructObj {
                        template: template_handle,
                        memory,
                    }));
                    self.push(Value::Object(recast));
                }
                OpCode::ObjectCastPtr => {
                    let _index = self.read_byte();
                    let Value::Pointer { addr, .. } = self.pop()? else {
                        return Err(self.error("OBJECT_CAST_PTR requires a pointer operand"));
                    };
                    self.push(Value::Pointer { addr, pointee: PointeeTag::Object });
                }

                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    let Value::Bool(cond) = self.peek(0)? else {
                        return Err(self.error("branch condition is not a boolean"));
                    };
                    if !cond {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16();
                    let Value::Bool(cond) = self.peek(0)? else {
                        return Err(self.error("branch condition is not a boolean"));
                    };
                    if cond {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }

                OpCode::GlobalDefine => {
                    let index = self.read_byte();
                    let Value::Object(name) = self.read_constant(index) else {
                        return Err(self.error("GLOBAL_DEFINE name constant is not a string"));
                    };
                    let value = self.pop()?;
                    let hash = self.global_hash(name);
                    self.globals.set(name, hash, value);
                }
                OpCode::GlobalSet => {
                    let index = self.read_byte();
                    let Value::Object(name) = self.read_constant(index) else {
                        return Err(self.error("GLOBAL_SET name constant is not a string"));
                    };
                    let value = self.peek(0)?;
                    let hash = self.global_hash(name);
                    if !self.globals.contains(name, hash) {
                        return Err(self.error("assignment to undefined global"));
                    }
                    self.globals.set(name, hash, value);
                }
                OpCode::GlobalGet => {
                    let index = self.read_byte();
                    let Value::Object(name) = self.read_constant(index) else {
                        return Err(self.error("GLOBAL_GET name constant is not a string"));
                    };
                    let hash = self.global_hash(name);
                    let value = self.globals.get(name, hash).ok_or_else(|| self.error("undefined global variable"))?;
                    let declared = self.global_tags.get(&name).cloned();
                    let resolved = match (&value, declared) {
                        (Value::Pointer { addr, .. }, Some(tag)) if !tag.is_pointer() => self.read_address(addr)?,
                        _ => value,
                    };
                    self.push(resolved);
                }
                OpCode::LocalSet => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0)?;
                    let base = self.slot_base();
                    let idx = base + slot;
                    if idx >= self.stack.len() {
                        self.stack.resize(idx + 1, Value::Null);
                    }
                    self.stack[idx] = value;
                }
                OpCode::LocalGet => {
                    let slot = self.read_byte() as usize;
                    let base = self.slot_base();
                    let idx = base + slot;
                    let stored = self.stack.get(idx).copied().ok_or_else(|| self.error("local slot out of range"))?;
                    let declared = self.local_declared_tag(slot);
                    let resolved = match (&stored, declared) {
                        (Value::Pointer { addr, .. }, Some(tag)) if !tag.is_pointer() => self.read_address(addr)?,
                        _ => stored,
                    };
                    self.push(resolved);
                }

                OpCode::StructGet => {
                    let index = self.read_byte();
                    let Value::Object(name) = self.read_constant(index) else {
                        return Err(self.error("STRUCT_GET name constant is not a string"));
                    };
                    let field_name = self.heap.get(name).as_string().ok_or_else(|| self.error("field name is not a string"))?.to_string();
                    let Value::Object(instance) = self.pop()? else {
                        return Err(self.error("STRUCT_GET requires a struct operand"));
                    };
                    let value = self.struct_field(instance, &field_name)?;
                    self.push(value);
                }
                OpCode::StructSet => {
                    let index = self.read_byte();
                    let Value::Object(name) = self.read_constant(index) else {
                        return Err(self.error("STRUCT_SET name constant is not a string"));
                    };
                    let field_name = self.heap.get(name).as_string().ok_or_else(|| self.error("field name is not a string"))?.to_string();
                    let value = self.pop()?;
                    let Value::Object(instance) = self.pop()? else {
                        return Err(self.error("STRUCT_SET requires a struct operand"));
                    };
                    self.set_struct_field(instance, &field_name, value)?;
                    self.push(value);
                }
                OpCode::ModuleGet | OpCode::ModuleSet | OpCode::Import => {
                    return Err(self.error("module namespace is not supported"));
                }
                OpCode::Assign => {
                    let value = self.pop()?;
                    let Value::Pointer { addr, .. } = self.pop()? else {
                        return Err(self.error("ASSIGN requires a pointer operand"));
                    };
                    self.write_address(&addr, value)?;
                    self.push(value);
                }

                OpCode::Print => {
                    let value = self.pop()?;
                    let text = value_display::display(&value, &self.heap);
                    self.host.print_line(&text);
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call(arg_count)?;
                }

                OpCode::Nop => {}
            }
        }
    }

    fn local_declared_tag(&self, slot: usize) -> Option<pd_core::ValueTag> {
        let frame = self.frames.last()?;
        self.function(frame.function).local_tags.get(slot).cloned()
    }

    fn pop_int(&mut self) -> Result<i32, RuntimeError> {
        match self.pop()? {
            Value::Integer(i) => Ok(i),
            _ => Err(self.error("expected an int operand")),
        }
    }

    fn binary_int(&mut self, f: impl Fn(i32, i32) -> i32) -> Result<(), RuntimeError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Integer(f(a, b)));
        Ok(())
    }

    fn binary_double(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Value::Double(a), Value::Double(b)) = (a, b) else {
            return Err(self.error("expected double operands"));
        };
        self.push(Value::Double(f(a, b)));
        Ok(())
    }

    fn compare_int(&mut self, f: impl Fn(i32, i32) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Bool(f(a, b)));
        Ok(())
    }

    fn compare_double(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Value::Double(a), Value::Double(b)) = (a, b) else {
            return Err(self.error("expected double operands"));
        };
        self.push(Value::Bool(f(a, b)));
        Ok(())
    }

    fn pointer_offset(&mut self, sign: i64) -> Result<(), RuntimeError> {
        let delta = self.pop_int()?;
        let Value::Pointer { addr, pointee } = self.pop()? else {
            return Err(self.error("pointer arithmetic requires a pointer operand"));
        };
        let shifted = sign * delta as i64;
        let new_addr = match addr {
            Address::Stack(i) => Address::Stack((i as i64 + shifted).max(0) as usize),
            Address::Memory { handle, index } => Address::Memory {
                handle,
                index: (index as i64 + shifted).max(0) as usize,
            },
        };
        self.push(Value::Pointer { addr: new_addr, pointee });
        Ok(())
    }

    fn struct_field(&self, instance: ObjHandle, field: &str) -> Result<Value, RuntimeError> {
        let StructObj { template, memory } = match self.heap.get(instance) {
            Object::Struct(s) => *s,
            _ => return Err(self.error("field access on a non-struct value")),
        };
        let index = match self.heap.get(template) {
            Object::StructTemplate(t) => t.field_index(field).ok_or_else(|| self.error("unknown struct field"))?,
            _ => return Err(self.error("struct instance names a non-template handle")),
        };
        match self.heap.get(memory) {
            Object::Memory(cells) => cells.get(index).copied().ok_or_else(|| self.error("struct field index out of range")),
            _ => Err(self.error("struct backing store is not a Memory object")),
        }
    }

    fn set_struct_field(&mut self, instance: ObjHandle, field: &str, value: Value) -> Result<(), RuntimeError> {
        let StructObj { template, memory } = match self.heap.get(instance) {
            Object::Struct(s) => *s,
            _ => return Err(self.error("field access on a non-struct value")),
        };
        let index = match self.heap.get(template) {
            Object::StructTemplate(t) => t.field_index(field).ok_or_else(|| self.error("unknown struct field"))?,
            _ => return Err(self.error("struct instance names a non-template handle")),
        };
        match self.heap.get_mut(memory) {
            Object::Memory(cells) => {
                if let Some(slot) = cells.get_mut(index) {
                    *slot = value;
                    Ok(())
                } else {
                    Err(self.error("struct field index out of range"))
                }
            }
            _ => Err(self.error("struct backing store is not a Memory object")),
        }
    }

    fn call(&mut self, arg_count: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(arg_count)?;
        let Value::Object(handle) = callee else {
            return Err(self.error("cannot call a non-callable value"));
        };
        match self.heap.get(handle).kind_name() {
            "function" => {
                if self.frames.len() >= FRAME_MAX {
                    return Err(self.error("call stack overflow"));
                }
                if self.frames.len() >= FRAME_WARN_THRESHOLD {
                    warn!(depth = self.frames.len(), max = FRAME_MAX, "call stack approaching FRAME_MAX");
                }
                let arity = self.function(handle).arity;
                if arity != arg_count {
                    return Err(self.error("wrong number of arguments"));
                }
                let slot_base = self.stack.len() - arg_count;
                trace!(arg_count, depth = self.frames.len() + 1, "CALL");
                self.frames.push(CallFrame { function: handle, ip: 0, slot_base });
                Ok(())
            }
            "builtin" => {
                let args: Vec<Value> = self.stack.split_off(self.stack.len() - arg_count);
                self.pop()?; // the builtin handle itself
                let Object::Builtin(b) = self.heap.get(handle).clone() else {
                    unreachable!("kind_name already confirmed Builtin");
                };
                let result = (b.func)(&mut self.host_view(), &args).map_err(|msg| self.error(msg))?;
                self.push(result);
                Ok(())
            }
            _ => Err(self.error("cannot call a non-callable value")),
        }
    }

    fn host_view(&mut self) -> HostView<'_, W> {
        HostView { heap: &mut self.heap, host: &mut self.host }
    }
}

/// Adapter implementing [`pd_core::BuiltinHost`] over the VM's heap and I/O
/// host while the main `&mut self` borrow is held by [`Vm::call`].
struct HostView<'a, W: Write> {
    heap: &'a mut Heap,
    host: &'a mut Host<W>,
}

impl<'a, W: Write> pd_core::BuiltinHost for HostView<'a, W> {
    fn heap_mut(&mut self) -> &mut Heap {
        self.heap
    }

    fn heap(&self) -> &Heap {
        self.heap
    }

    fn intern(&mut self, s: &str) -> ObjHandle {
        self.heap.alloc(Object::String(s.into()))
    }

    fn print_line(&mut self, s: &str) {
        self.host.print_line(s);
    }

    fn read_line(&mut self) -> String {
        self.host.read_line()
    }

    fn unix_time(&self) -> i64 {
        self.host.unix_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_core::{Chunk, FunctionObj};

    fn make_script(chunk: Chunk) -> (Heap, ObjHandle) {
        let mut heap = Heap::new();
        let name = heap.alloc(Object::String("script".into()));
        let function = FunctionObj {
            name,
            arity: 0,
            return_tag: None,
            local_tags: Vec::new(),
            chunk,
        };
        let handle = heap.alloc(Object::Function(function));
        (heap, handle)
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Integer(3)).unwrap();
        let b = chunk.add_constant(Value::Integer(4)).unwrap();
        chunk.write_op(OpCode::ConstantInt, 1);
        chunk.write_byte(a, 1);
        chunk.write_op(OpCode::ConstantInt, 1);
        chunk.write_byte(b, 1);
        chunk.write_op(OpCode::AddInt, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Return, 1);

        let (heap, handle) = make_script(chunk);
        let mut out = Vec::new();
        let mut vm = Vm::new(heap, &mut out);
        vm.run(handle).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "7\n");
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Integer(1)).unwrap();
        let b = chunk.add_constant(Value::Integer(0)).unwrap();
        chunk.write_op(OpCode::ConstantInt, 5);
        chunk.write_byte(a, 5);
        chunk.write_op(OpCode::ConstantInt, 5);
        chunk.write_byte(b, 5);
        chunk.write_op(OpCode::DivInt, 5);
        chunk.write_op(OpCode::Return, 5);

        let (heap, handle) = make_script(chunk);
        let mut out = Vec::new();
        let mut vm = Vm::new(heap, &mut out);
        let err = vm.run(handle).unwrap_err();
        assert_eq!(err.line, 5);
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn integer_arithmetic_wraps_at_32_bits() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Integer(i32::MAX)).unwrap();
        let b = chunk.add_constant(Value::Integer(1)).unwrap();
        chunk.write_op(OpCode::ConstantInt, 1);
        chunk.write_byte(a, 1);
        chunk.write_op(OpCode::ConstantInt, 1);
        chunk.write_byte(b, 1);
        chunk.write_op(OpCode::AddInt, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Return, 1);

        let (heap, handle) = make_script(chunk);
        let mut out = Vec::new();
        let mut vm = Vm::new(heap, &mut out);
        vm.run(handle).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{}\n", i32::MIN));
    }
}
