//! Single-pass Pratt compiler: parses and emits bytecode in the same walk.
//!
//! A tag-driven compile-time [`TypeStack`] mirrors the runtime value
//! stack one entry per value, consulted to monomorphize every
//! arithmetic/comparison/cast opcode the parselets below emit.

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::types::{Signature, TypeStack};
use pd_core::{Chunk, FunctionObj, Heap, Interner, ObjHandle, Object, OpCode, StructTemplateObj, Value, ValueTag};
use std::collections::HashMap;
use tracing::debug;

/// A declared local variable slot.
struct Local {
    name: Box<str>,
    /// `-1` between declaration and initializer completion (forbids
    /// self-referential reads); otherwise the scope depth it was declared
    /// at.
    depth: i32,
    tag: ValueTag,
}

/// Per-function compilation state: the chunk being built, its locals, and
/// its scope depth. Palladium has no closures, so nested `fun` bodies get
/// a brand new `FuncState` rather than capturing the enclosing one.
struct FuncState {
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    return_tag: Option<ValueTag>,
}

impl FuncState {
    fn new(return_tag: Option<ValueTag>) -> Self {
        FuncState {
            chunk: Chunk::new(),
            locals: Vec::new(),
            scope_depth: 0,
            return_tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! - & *
    Call,       // ( ) .
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

fn get_rule(kind: TokenKind) -> (Option<ParseFn>, Option<ParseFn>, Precedence) {
    use TokenKind::*;
    match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash => (None, Some(Compiler::binary), Precedence::Factor),
        Star => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Factor),
        Ampersand => (Some(Compiler::unary), None, Precedence::Unary),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual => (None, Some(Compiler::binary), Precedence::Equality),
        EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater => (None, Some(Compiler::binary), Precedence::Comparison),
        GreaterEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        Less => (None, Some(Compiler::binary), Precedence::Comparison),
        LessEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        StringLiteral => (Some(Compiler::string), None, Precedence::None),
        IntLiteral => (Some(Compiler::integer), None, Precedence::None),
        DoubleLiteral => (Some(Compiler::double), None, Precedence::None),
        CharLiteral => (Some(Compiler::character), None, Precedence::None),
        True | False | Null => (Some(Compiler::literal), None, Precedence::None),
        And => (None, Some(Compiler::and_), Precedence::And),
        Or => (None, Some(Compiler::or_), Precedence::Or),
        As => (None, Some(Compiler::cast), Precedence::Unary),
        _ => (None, None, Precedence::None),
    }
}

/// What `compile` hands back: the top-level script [`FunctionObj`] plus the
/// heap it and every compile-time-allocated object (interned strings,
/// struct templates, nested function objects) live in. The VM takes
/// ownership of both at load time.
pub struct CompileArtifact {
    pub function: FunctionObj,
    pub heap: Heap,
    /// Declared tag of every global, keyed by the interned name handle its
    /// `GLOBAL_GET`/`GLOBAL_SET` operands reference. Lets the VM tell a
    /// plain global slot apart from one currently holding a write-back
    /// pointer, the same role `FunctionObj::local_tags` plays for locals
    /// (`Compiler::write_back_alias`).
    pub global_tags: Vec<(ObjHandle, ValueTag)>,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    type_stack: TypeStack,
    heap: Heap,
    interner: Interner,
    globals: HashMap<Box<str>, ValueTag>,
    function_signatures: HashMap<Box<str>, Signature>,
    struct_templates: HashMap<Box<str>, ObjHandle>,
    struct_fields: HashMap<Box<str>, Vec<(Box<str>, ValueTag)>>,
    config: CompilerConfig,
    funcs: Vec<FuncState>,
    /// Set by `dot()` when the just-parsed field is builtin-typed, so the
    /// following `call()` can recover its declared signature (a struct
    /// field only records its tag, not an arity/return pair).
    pending_call_name: Option<Box<str>>,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, config: CompilerConfig) -> Self {
        let eof = Token {
            kind: TokenKind::Eof,
            lexeme: "".into(),
            line: 1,
        };
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            previous: eof.clone(),
            current: eof,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            type_stack: TypeStack::new(),
            heap: Heap::new(),
            interner: Interner::new(),
            globals: HashMap::new(),
            function_signatures: HashMap::new(),
            struct_templates: HashMap::new(),
            struct_fields: HashMap::new(),
            config,
            funcs: vec![FuncState::new(None)],
            pending_call_name: None,
        };
        for (name, sig) in compiler.config.builtins() {
            compiler.globals.insert(name.into(), ValueTag::Builtin);
            compiler.function_signatures.insert(name.into(), sig.clone());
        }
        let templates: Vec<(Box<str>, Vec<(Box<str>, ValueTag)>)> = compiler
            .config
            .struct_templates()
            .map(|(name, fields)| (name.into(), fields.to_vec()))
            .collect();
        for (name, fields) in templates {
            compiler.declare_struct_template(&name, fields);
        }
        compiler
    }

    // --- token stream ---

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.line, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous.line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        debug!(line, message, "compile error");
        self.errors.push(CompileError::new(line, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Void
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Ret => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- emission helpers ---

    fn func(&self) -> &FuncState {
        self.funcs.last().expect("at least one func state")
    }

    fn func_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("at least one func state")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func_mut().chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.func_mut().chunk.emit_jump_placeholder(op, line)
    }

    fn patch_jump(&mut self, placeholder: usize) {
        if let Err(message) = self.func_mut().chunk.patch_jump(placeholder) {
            self.error_at_previous(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(message) = self.func_mut().chunk.emit_loop(loop_start, line) {
            self.error_at_previous(&message);
        }
    }

    fn add_constant(&mut self, value: Value) -> u8 {
        match self.func_mut().chunk.add_constant(value) {
            Ok(index) => index,
            Err(message) => {
                self.error_at_previous(&message);
                0
            }
        }
    }

    fn intern(&mut self, s: &str) -> ObjHandle {
        self.interner.intern(&mut self.heap, s)
    }

    /// Add (or reuse) a constant-pool entry naming `s`, for `GLOBAL_*` /
    /// `STRUCT_*` name operands.
    fn make_name_constant(&mut self, s: &str) -> u8 {
        let handle = self.intern(s);
        if let Some(index) = self
            .func()
            .chunk
            .constants
            .iter()
            .position(|v| matches!(v, Value::Object(h) if *h == handle))
        {
            return index as u8;
        }
        self.add_constant(Value::Object(handle))
    }

    // --- scope / locals ---

    fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func_mut().scope_depth -= 1;
        let depth = self.func().scope_depth;
        while let Some(local) = self.func().locals.last() {
            if local.depth > depth {
                self.emit_op(OpCode::Pop);
                self.type_stack.pop();
                self.func_mut().locals.pop();
            } else {
                break;
            }
        }
    }

    fn resolve_local(&self, name: &str) -> Option<(usize, ValueTag)> {
        for (i, local) in self.func().locals.iter().enumerate().rev() {
            if local.name.as_ref() == name {
                return Some((i, local.tag.clone()));
            }
        }
        None
    }

    fn add_local(&mut self, name: Box<str>, tag: ValueTag) {
        if self.func().scope_depth == 0 {
            self.error_at_previous("Cannot declare local variables at the top level.");
            return;
        }
        let depth = self.func().scope_depth;
        for local in self.func().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.as_ref() == name.as_ref() {
                self.error_at_previous("Cannot declare two variables with the same name.");
                return;
            }
        }
        self.func_mut().locals.push(Local { name, depth: -1, tag });
    }

    fn mark_local_initialized(&mut self) {
        let depth = self.func().scope_depth;
        if let Some(local) = self.func_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn declare_struct_template(&mut self, name: &str, fields: Vec<(Box<str>, ValueTag)>) {
        let name_handle = self.intern(name);
        let template = StructTemplateObj {
            name: name_handle,
            fields: fields.clone(),
        };
        let handle = self.heap.alloc(Object::StructTemplate(template));
        self.struct_templates.insert(name.into(), handle);
        self.struct_fields.insert(name.into(), fields);
        self.globals.insert(name.into(), ValueTag::Struct(name.into()));
    }

    // --- expression parsing ---

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).0 else {
            self.error_at_previous("Expected expression.");
            return;
        };
        let can_assign = prec <= Precedence::Assignment;
        prefix(self, can_assign);

        while prec <= get_rule(self.current.kind).2 {
            self.advance();
            let infix = get_rule(self.previous.kind).1.expect("infix rule for consumed operator");
            infix(self, can_assign);
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.error_at_previous("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn integer(&mut self, _can_assign: bool) {
        // Manual wrapping decimal parse: an overlong literal wraps at 32
        // bits, two's-complement, the same as runtime int arithmetic.
        let mut value: i32 = 0;
        for b in self.previous.lexeme.bytes() {
            value = value.wrapping_mul(10).wrapping_add((b - b'0') as i32);
        }
        let index = self.add_constant(Value::Integer(value));
        self.emit_op_operand(OpCode::ConstantInt, index);
        self.type_stack.push(ValueTag::Integer);
    }

    fn double(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        let index = self.add_constant(Value::Double(value));
        self.emit_op_operand(OpCode::ConstantDouble, index);
        self.type_stack.push(ValueTag::Double);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Null => {
                self.emit_op(OpCode::Null);
                self.type_stack.push(ValueTag::Null);
            }
            _ => {
                let b = self.previous.kind == TokenKind::True;
                let index = self.add_constant(Value::Bool(b));
                self.emit_op_operand(OpCode::ConstantBool, index);
                self.type_stack.push(ValueTag::Bool);
            }
        }
    }

    fn character(&mut self, _can_assign: bool) {
        let byte = self.previous.lexeme.as_bytes().get(1).copied().unwrap_or(0);
        let index = self.add_constant(Value::Character(byte));
        self.emit_op_operand(OpCode::ConstantCharacter, index);
        self.type_stack.push(ValueTag::Character);
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme.clone();
        let content = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern(content);
        let index = self.add_constant(Value::Object(handle));
        self.emit_op_operand(OpCode::ConstantString, index);
        self.type_stack.push(ValueTag::String);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after grouping.");
    }

    fn unary(&mut self, can_assign: bool) {
        let operator = self.previous.kind;
        match operator {
            TokenKind::Minus => {
                self.parse_precedence(Precedence::Unary);
                match self.type_stack.pop() {
                    Some(ValueTag::Integer) => {
                        self.emit_op(OpCode::NegateInt);
                        self.type_stack.push(ValueTag::Integer);
                    }
                    Some(ValueTag::Double) => {
                        self.emit_op(OpCode::NegateDouble);
                        self.type_stack.push(ValueTag::Double);
                    }
                    _ => self.error_at_previous("Cannot negate non-numeric value."),
                }
            }
            TokenKind::Bang => {
                self.parse_precedence(Precedence::Unary);
                match self.type_stack.pop() {
                    Some(ValueTag::Integer) | Some(ValueTag::Double) => self.emit_op(OpCode::NotNumber),
                    Some(ValueTag::Bool) => self.emit_op(OpCode::NotBool),
                    _ => self.error_at_previous("Cannot negate non-numeric/boolean value."),
                }
                self.type_stack.push(ValueTag::Bool);
            }
            TokenKind::Ampersand => self.unary_ampersand(),
            TokenKind::Star => self.unary_deref(can_assign),
            _ => self.error_at_previous("Unary operator expected."),
        }
    }

    /// `&x`: allocates a heap `Reference` around the popped value. When the
    /// operand is a bare variable, the reference is written back into that
    /// variable's own storage, so mutation through the resulting pointer
    /// (`ASSIGN`) is visible through the original name too.
    fn unary_ampersand(&mut self) {
        if self.check(TokenKind::Identifier) {
            let name = self.current.lexeme.clone();
            self.advance();
            self.variable(false);
            if self.check(TokenKind::LeftParen) || self.check(TokenKind::Dot) {
                while Precedence::Unary <= get_rule(self.current.kind).2 {
                    self.advance();
                    let infix = get_rule(self.previous.kind).1.expect("infix rule");
                    infix(self, false);
                }
                let inner = self.type_stack.pop().unwrap_or(ValueTag::Null);
                self.emit_op(OpCode::HeapReference);
                self.type_stack.push(ValueTag::Pointer(Box::new(inner)));
                return;
            }
            let inner = self.type_stack.pop().unwrap_or(ValueTag::Null);
            self.emit_op(OpCode::HeapReference);
            self.write_back_alias(&name);
            self.type_stack.push(ValueTag::Pointer(Box::new(inner)));
        } else {
            self.parse_precedence(Precedence::Unary);
            let inner = self.type_stack.pop().unwrap_or(ValueTag::Null);
            self.emit_op(OpCode::HeapReference);
            self.type_stack.push(ValueTag::Pointer(Box::new(inner)));
        }
    }

    /// Writes the just-allocated `Reference` back into the variable it was
    /// taken from, so mutation through the resulting pointer is visible
    /// under the original name too. Works for both locals and globals:
    /// `LOCAL_GET`/`GLOBAL_GET` each recover the
    /// slot's declared tag (`FunctionObj::local_tags` /
    /// `CompileArtifact::global_tags`) and transparently dereference a
    /// stored pointer when the declared tag itself isn't a pointer type.
    fn write_back_alias(&mut self, name: &str) {
        if let Some((slot, _)) = self.resolve_local(name) {
            self.emit_op_operand(OpCode::LocalSet, slot as u8);
        } else if matches!(
            self.globals.get(name),
            Some(ValueTag::Function | ValueTag::Builtin | ValueTag::Struct(_) | ValueTag::StructTemplate(_))
        ) {
            // `&funcname`/`&structname` without a following call or field
            // access: the name resolves through `self.globals` too, but it
            // isn't a plain variable slot, so there's nothing to alias back
            // into — leave the global untouched.
        } else if self.globals.contains_key(name) {
            let index = self.make_name_constant(name);
            self.emit_op_operand(OpCode::GlobalSet, index);
        }
    }

    /// `*p`: a read (`DEREFERENCE`) unless immediately followed by `=`, in
    /// which case it's an assignment-through-reference (`ASSIGN`).
    fn unary_deref(&mut self, can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        let operand = self.type_stack.pop().unwrap_or(ValueTag::Null);
        let inner = match operand {
            ValueTag::Pointer(t) | ValueTag::Reference(t) => *t,
            _ => {
                self.error_at_previous("Cannot dereference a non-pointer value.");
                ValueTag::Null
            }
        };
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            let rhs = self.type_stack.pop().unwrap_or(ValueTag::Null);
            if rhs != inner {
                self.error_at_previous("Cannot assign value of different type through reference.");
            }
            self.emit_op(OpCode::Assign);
            self.type_stack.push(inner);
        } else {
            self.emit_op(OpCode::Dereference);
            self.type_stack.push(inner);
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule_prec = get_rule(operator).2;
        self.parse_precedence(rule_prec.next());

        let after = self.type_stack.pop().unwrap_or(ValueTag::Null);
        let before = self.type_stack.pop().unwrap_or(ValueTag::Null);

        match operator {
            TokenKind::Plus => {
                if before == ValueTag::String && after == ValueTag::String {
                    self.emit_op(OpCode::AddObject);
                    self.type_stack.push(ValueTag::String);
                } else {
                    self.binary_num_or_pointer(before, after, OpCode::AddInt, OpCode::AddDouble, OpCode::AddPointer);
                }
            }
            TokenKind::Minus => {
                self.binary_num_or_pointer(before, after, OpCode::SubInt, OpCode::SubDouble, OpCode::SubPointer)
            }
            TokenKind::Star => self.binary_num(before, after, OpCode::MulInt, OpCode::MulDouble),
            TokenKind::Slash => self.binary_num(before, after, OpCode::DivInt, OpCode::DivDouble),
            TokenKind::Greater => self.binary_bool(before, after, OpCode::GreaterInt, OpCode::GreaterDouble),
            TokenKind::GreaterEqual => {
                self.binary_bool(before, after, OpCode::GreaterEqualInt, OpCode::GreaterEqualDouble)
            }
            TokenKind::Less => self.binary_bool(before, after, OpCode::LessInt, OpCode::LessDouble),
            TokenKind::LessEqual => self.binary_bool(before, after, OpCode::LessEqualInt, OpCode::LessEqualDouble),
            TokenKind::EqualEqual => self.binary_eq(before, after, false),
            TokenKind::BangEqual => self.binary_eq(before, after, true),
            _ => unreachable!("binary() invoked for non-binary token"),
        }
    }

    fn binary_num_or_pointer(
        &mut self,
        before: ValueTag,
        after: ValueTag,
        int_op: OpCode,
        double_op: OpCode,
        pointer_op: OpCode,
    ) {
        match (&before, &after) {
            (ValueTag::Integer, ValueTag::Integer) => {
                self.emit_op(int_op);
                self.type_stack.push(ValueTag::Integer);
            }
            (ValueTag::Double, ValueTag::Double) => {
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            (ValueTag::Integer, ValueTag::Double) => {
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            (ValueTag::Double, ValueTag::Integer) => {
                self.emit_op(OpCode::Swap);
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(OpCode::Swap);
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            (ValueTag::Pointer(_), ValueTag::Integer) => {
                self.emit_op(pointer_op);
                self.type_stack.push(before);
            }
            (ValueTag::Integer, ValueTag::Pointer(_)) => {
                self.emit_op(OpCode::Swap);
                self.emit_op(pointer_op);
                self.type_stack.push(after);
            }
            _ => self.error_at_previous("Binary operator invalid for given values."),
        }
    }

    fn binary_num(&mut self, before: ValueTag, after: ValueTag, int_op: OpCode, double_op: OpCode) {
        match (before, after) {
            (ValueTag::Integer, ValueTag::Integer) => {
                self.emit_op(int_op);
                self.type_stack.push(ValueTag::Integer);
            }
            (ValueTag::Double, ValueTag::Double) => {
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            (ValueTag::Integer, ValueTag::Double) => {
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            (ValueTag::Double, ValueTag::Integer) => {
                self.emit_op(OpCode::Swap);
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(OpCode::Swap);
                self.emit_op(double_op);
                self.type_stack.push(ValueTag::Double);
            }
            _ => self.error_at_previous("Binary operator invalid for given values."),
        }
    }

    fn binary_bool(&mut self, before: ValueTag, after: ValueTag, int_op: OpCode, double_op: OpCode) {
        match (before, after) {
            (ValueTag::Integer, ValueTag::Integer) => self.emit_op(int_op),
            (ValueTag::Double, ValueTag::Double) => self.emit_op(double_op),
            (ValueTag::Integer, ValueTag::Double) => {
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(double_op);
            }
            (ValueTag::Double, ValueTag::Integer) => {
                self.emit_op(OpCode::Swap);
                self.emit_op(OpCode::ArithmeticCastIntDouble);
                self.emit_op(OpCode::Swap);
                self.emit_op(double_op);
            }
            _ => {
                self.error_at_previous("Binary operator invalid for given values.");
                return;
            }
        }
        self.type_stack.push(ValueTag::Bool);
    }

    fn binary_eq(&mut self, before: ValueTag, after: ValueTag, negate: bool) {
        let ok = before == after || (before.is_numeric() && after.is_numeric());
        if !ok {
            self.error_at_previous("Cannot compare values of different type.");
        }
        self.emit_op(OpCode::Equality);
        if negate {
            self.emit_op(OpCode::NotBool);
        }
        self.type_stack.push(ValueTag::Bool);
    }

    fn and_(&mut self, _can_assign: bool) {
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("'and' operator must be used with boolean operands.");
        }
        let jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("'and' operator must be used with boolean operands.");
        }
        self.patch_jump(jump);
        self.type_stack.push(ValueTag::Bool);
    }

    fn or_(&mut self, _can_assign: bool) {
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("'or' operator must be used with boolean operands.");
        }
        let jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("'or' operator must be used with boolean operands.");
        }
        self.patch_jump(jump);
        self.type_stack.push(ValueTag::Bool);
    }

    fn cast(&mut self, _can_assign: bool) {
        let target = match self.parse_type_annotation() {
            Some(t) => t,
            None => return,
        };
        let source = self.type_stack.pop().unwrap_or(ValueTag::Null);
        match (&source, &target) {
            (ValueTag::Integer, ValueTag::Double) => self.emit_op(OpCode::ArithmeticCastIntDouble),
            (ValueTag::Double, ValueTag::Integer) => self.emit_op(OpCode::ArithmeticCastDoubleInt),
            (ValueTag::Character, ValueTag::Integer) => self.emit_op(OpCode::ArithmeticCastCharInt),
            (ValueTag::Character, ValueTag::Double) => self.emit_op(OpCode::ArithmeticCastCharDouble),
            (ValueTag::Integer, ValueTag::Character) => self.emit_op(OpCode::ArithmeticCastIntChar),
            (ValueTag::Pointer(_), ValueTag::Pointer(inner)) | (ValueTag::Reference(_), ValueTag::Pointer(inner)) => {
                let pointee = pd_core::PointeeTag::from_tag(inner);
                self.emit_op_operand(OpCode::PointerCast, pointee.to_u8());
            }
            (ValueTag::Struct(_), ValueTag::Struct(name)) => {
                if let Some(handle) = self.struct_templates.get(name.as_ref()).copied() {
                    let index = self.add_constant(Value::Object(handle));
                    self.emit_op_operand(OpCode::ObjectCast, index);
                } else {
                    self.error_at_previous("Unknown struct template in cast.");
                }
            }
            _ if source == target => {}
            _ => self.error_at_previous("Unsupported cast between these types."),
        }
        self.type_stack.push(target);
    }

    /// Parses a type annotation: a base keyword (`int`, `double`, `bool`,
    /// `char`, `str`, or an identifier naming a struct template) followed
    /// by zero or more `*` suffixes wrapping it in `Pointer`.
    fn parse_type_annotation(&mut self) -> Option<ValueTag> {
        let mut tag = match self.current.kind {
            TokenKind::IntType => ValueTag::Integer,
            TokenKind::DoubleType => ValueTag::Double,
            TokenKind::BoolType => ValueTag::Bool,
            TokenKind::CharType => ValueTag::Character,
            TokenKind::StrType => ValueTag::String,
            TokenKind::Void => ValueTag::Null,
            TokenKind::Identifier if self.struct_fields.contains_key(self.current.lexeme.as_ref()) => {
                ValueTag::Struct(self.current.lexeme.clone())
            }
            _ => {
                self.error_at_current("Expected a type name.");
                return None;
            }
        };
        self.advance();
        while self.match_tok(TokenKind::Star) {
            tag = ValueTag::Pointer(Box::new(tag));
        }
        Some(tag)
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        if let Some((slot, tag)) = self.resolve_local(name) {
            if can_assign && self.match_tok(TokenKind::Equal) {
                self.expression();
                let rhs = self.type_stack.pop().unwrap_or(ValueTag::Null);
                if rhs != tag {
                    self.error_at_previous("Cannot assign value of different type.");
                }
                self.emit_op_operand(OpCode::LocalSet, slot as u8);
                self.type_stack.push(tag);
            } else {
                self.emit_op_operand(OpCode::LocalGet, slot as u8);
                self.type_stack.push(tag);
            }
            return;
        }

        let index = self.make_name_constant(name);
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            let rhs = self.type_stack.pop().unwrap_or(ValueTag::Null);
            match self.globals.get(name).cloned() {
                Some(tag) => {
                    if rhs != tag {
                        self.error_at_previous("Cannot assign value of different type.");
                    }
                    self.emit_op_operand(OpCode::GlobalSet, index);
                    self.type_stack.push(tag);
                }
                None => self.error_at_previous("Cannot assign to undeclared variable."),
            }
        } else {
            match self.globals.get(name).cloned() {
                Some(tag) => {
                    self.emit_op_operand(OpCode::GlobalGet, index);
                    if matches!(tag, ValueTag::Function | ValueTag::Builtin) {
                        self.pending_call_name = Some(name.into());
                    }
                    self.type_stack.push(tag);
                }
                None => self.error_at_previous("Referenced variable is undefined."),
            }
        }
    }

    /// `base.field` — struct field access (`STRUCT_GET`/`STRUCT_SET`), or a
    /// call through a builtin-typed field (`stl.write(...)`).
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected field name after '.'.");
        let field = self.previous.lexeme.clone();
        let base_tag = self.type_stack.pop().unwrap_or(ValueTag::Null);
        let ValueTag::Struct(template_name) = &base_tag else {
            self.error_at_previous("Field access on a non-struct value.");
            self.type_stack.push(ValueTag::Null);
            return;
        };
        let template_name = template_name.clone();
        let field_tag = self
            .struct_fields
            .get(template_name.as_ref())
            .and_then(|fields| fields.iter().find(|(n, _)| n.as_ref() == field.as_ref()))
            .map(|(_, t)| t.clone());
        let Some(field_tag) = field_tag else {
            self.error_at_previous("Unknown struct field.");
            self.type_stack.push(ValueTag::Null);
            return;
        };
        let name_index = self.make_name_constant(&field);

        if can_assign && field_tag != ValueTag::Builtin && self.match_tok(TokenKind::Equal) {
            self.expression();
            let rhs = self.type_stack.pop().unwrap_or(ValueTag::Null);
            if rhs != field_tag {
                self.error_at_previous("Cannot assign value of different type to field.");
            }
            self.emit_op_operand(OpCode::StructSet, name_index);
            self.type_stack.push(field_tag);
        } else {
            self.emit_op_operand(OpCode::StructGet, name_index);
            if field_tag == ValueTag::Builtin {
                if let Some(sig) = self.config.struct_field_signature(&template_name, &field).cloned() {
                    self.function_signatures.insert(format!("{template_name}.{field}").into(), sig);
                    self.type_stack.push(ValueTag::Builtin);
                    self.pending_call_name = Some(format!("{template_name}.{field}").into());
                    return;
                }
            }
            self.type_stack.push(field_tag);
        }
    }

    /// `callee(args...)`.
    fn call(&mut self, _can_assign: bool) {
        let signature = self.pending_call_name.take().and_then(|n| self.function_signatures.get(n.as_ref()).cloned());
        let callee_tag = self.type_stack.pop().unwrap_or(ValueTag::Null);
        if callee_tag != ValueTag::Function && callee_tag != ValueTag::Builtin {
            self.error_at_previous("Cannot call a non-callable value.");
        }

        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                let arg_tag = self.type_stack.pop().unwrap_or(ValueTag::Null);
                if let Some(sig) = &signature {
                    if let Some(expected) = sig.params.get(arg_count as usize) {
                        if !sig.any_params && expected != &arg_tag {
                            self.error_at_previous("Argument type does not match declared parameter type.");
                        }
                    } else {
                        self.error_at_previous("Too many arguments.");
                    }
                }
                arg_count += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");

        if let Some(sig) = &signature {
            if sig.params.len() != arg_count as usize {
                self.error_at_previous("Wrong number of arguments.");
            }
        }

        self.emit_op_operand(OpCode::Call, arg_count);
        // A call always leaves exactly one value on the runtime stack —
        // `Value::Null` for a void callee, same as a function's implicit
        // `ret;` (see `ret_statement`) — so the type stack must mirror that
        // with a tag here too, or a later statement's unconditional `POP`
        // would desynchronize the two.
        let result_tag = signature.and_then(|s| s.return_tag).unwrap_or(ValueTag::Null);
        self.type_stack.push(result_tag);
    }

    // --- statements ---

    fn print_statement(&mut self) {
        self.expression();
        self.type_stack.pop();
        self.consume(TokenKind::Semicolon, "Expected ';' after print statement.");
        self.emit_op(OpCode::Print);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("Expected boolean condition.");
        }
        self.consume(TokenKind::RightParen, "Expected ')' after if condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_tok(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.func().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        if self.type_stack.pop() != Some(ValueTag::Bool) {
            self.error_at_previous("Expected boolean condition.");
        }
        self.consume(TokenKind::RightParen, "Expected ')' after while condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");

        if self.match_tok(TokenKind::Semicolon) {
            // no initializer
        } else {
            self.declaration();
        }

        let mut loop_start = self.func().chunk.code.len();
        let mut exit_jump: Option<usize> = None;

        if !self.match_tok(TokenKind::Semicolon) {
            self.expression();
            self.type_stack.pop();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.func().chunk.code.len();
            self.expression();
            self.type_stack.pop();
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");

        self.statement();
        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn ret_statement(&mut self) {
        if self.match_tok(TokenKind::Semicolon) {
            if self.func().return_tag.is_some() {
                self.error_at_previous("Expected a return value.");
            }
            // Mirror the implicit `Null; Return` appended after every
            // function body (`fun_declaration`) so `RETURN` always has a
            // real value to pop, not whatever happens to be on top of the
            // stack (a local, an argument) at this early-exit point.
            self.emit_op(OpCode::Null);
            self.emit_op(OpCode::Return);
            return;
        }
        self.expression();
        let tag = self.type_stack.pop().unwrap_or(ValueTag::Null);
        match &self.func().return_tag {
            Some(expected) if expected == &tag => {}
            Some(_) => self.error_at_previous("Return value does not match declared return type."),
            None => self.error_at_previous("Void function cannot return a value."),
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
        self.emit_op(OpCode::Return);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.type_stack.pop();
        self.consume(TokenKind::Semicolon, "Expect ';' following expression.");
        self.emit_op(OpCode::Pop);
    }

    fn statement(&mut self) {
        if self.match_tok(TokenKind::Print) {
            self.print_statement();
        } else if self.match_tok(TokenKind::If) {
            self.if_statement();
        } else if self.match_tok(TokenKind::While) {
            self.while_statement();
        } else if self.match_tok(TokenKind::For) {
            self.for_statement();
        } else if self.match_tok(TokenKind::Ret) {
            self.ret_statement();
        } else if self.match_tok(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    // --- declarations ---

    fn var_declaration(&mut self, mut tag: ValueTag) {
        while self.match_tok(TokenKind::Star) {
            tag = ValueTag::Pointer(Box::new(tag));
        }
        self.consume(TokenKind::Identifier, "Expected variable name.");
        let name: Box<str> = self.previous.lexeme.clone();
        let name_index = self.make_name_constant(&name);

        if self.match_tok(TokenKind::Equal) {
            self.expression();
            let init_tag = self.type_stack.pop().unwrap_or(ValueTag::Null);
            if init_tag != tag {
                self.error_at_previous("Initializer does not match declared type.");
            }
        } else {
            self.emit_op(OpCode::Null);
        }

        if self.func().scope_depth == 0 {
            if self.globals.contains_key(&name) {
                self.error_at_previous("Global variable already defined.");
            }
            self.globals.insert(name.clone(), tag);
            self.emit_op_operand(OpCode::GlobalDefine, name_index);
        } else {
            self.add_local(name.clone(), tag.clone());
            let slot = self.func().locals.len() - 1;
            self.emit_op_operand(OpCode::LocalSet, slot as u8);
            self.mark_local_initialized();
            self.type_stack.push(tag);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration.");
    }

    fn struct_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected struct name.");
        let name: Box<str> = self.previous.lexeme.clone();
        self.consume(TokenKind::LeftBrace, "Expected '{' before struct body.");
        let mut fields = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let Some(field_tag) = self.parse_type_annotation() else {
                break;
            };
            self.consume(TokenKind::Identifier, "Expected field name.");
            let field_name: Box<str> = self.previous.lexeme.clone();
            fields.push((field_name, field_tag));
            self.consume(TokenKind::Semicolon, "Expected ';' after field declaration.");
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after struct body.");
        self.declare_struct_template(&name, fields);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected function name.");
        let name: Box<str> = self.previous.lexeme.clone();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        let mut params: Vec<(Box<str>, ValueTag)> = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let Some(param_tag) = self.parse_type_annotation() else {
                    break;
                };
                self.consume(TokenKind::Identifier, "Expected parameter name.");
                params.push((self.previous.lexeme.clone(), param_tag));
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");

        let return_tag = if self.match_tok(TokenKind::TildeArrow) {
            self.parse_type_annotation()
        } else {
            None
        };
        let return_tag = return_tag.and_then(|t| if t == ValueTag::Null { None } else { Some(t) });

        let signature = Signature::new(params.iter().map(|(_, t)| t.clone()).collect(), return_tag.clone());
        self.globals.insert(name.clone(), ValueTag::Function);
        self.function_signatures.insert(name.clone(), signature);

        self.funcs.push(FuncState::new(return_tag));
        self.begin_scope();
        for (param_name, param_tag) in &params {
            self.add_local(param_name.clone(), param_tag.clone());
            self.mark_local_initialized();
        }

        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();
        self.emit_op(OpCode::Null);
        self.emit_op(OpCode::Return);

        let finished = self.funcs.pop().expect("pushed func state");
        let name_handle = self.intern(&name);
        let function = FunctionObj {
            name: name_handle,
            arity: params.len(),
            return_tag: finished.return_tag,
            local_tags: finished.locals.iter().map(|l| l.tag.clone()).collect(),
            chunk: finished.chunk,
        };
        let handle = self.heap.alloc(Object::Function(function));
        let obj_index = self.add_constant(Value::Object(handle));
        self.emit_op_operand(OpCode::ConstantString, obj_index);
        let name_index = self.make_name_constant(&name);
        self.emit_op_operand(OpCode::GlobalDefine, name_index);
    }

    fn declaration(&mut self) {
        if self.match_tok(TokenKind::IntType) {
            self.var_declaration(ValueTag::Integer);
        } else if self.match_tok(TokenKind::DoubleType) {
            self.var_declaration(ValueTag::Double);
        } else if self.match_tok(TokenKind::BoolType) {
            self.var_declaration(ValueTag::Bool);
        } else if self.match_tok(TokenKind::CharType) {
            self.var_declaration(ValueTag::Character);
        } else if self.match_tok(TokenKind::StrType) {
            self.var_declaration(ValueTag::String);
        } else if self.match_tok(TokenKind::Struct) {
            self.struct_declaration();
        } else if self.match_tok(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn finish(mut self) -> Result<CompileArtifact, Vec<CompileError>> {
        while self.current.kind != TokenKind::Eof {
            self.declaration();
        }
        self.emit_op(OpCode::Return);

        if self.had_error {
            return Err(self.errors);
        }

        let name_handle = self.intern("script");
        let top = self.funcs.pop().expect("top-level func state");
        let function = FunctionObj {
            name: name_handle,
            arity: 0,
            return_tag: None,
            local_tags: top.locals.iter().map(|l| l.tag.clone()).collect(),
            chunk: top.chunk,
        };
        let global_tags = self
            .globals
            .iter()
            .filter_map(|(name, tag)| self.interner.get(name).map(|handle| (handle, tag.clone())))
            .collect();
        Ok(CompileArtifact {
            function,
            heap: self.heap,
            global_tags,
        })
    }
}

pub fn compile(source: &str, config: CompilerConfig) -> Result<CompileArtifact, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, config);
    compiler.advance();
    compiler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use pd_core::OpCode;

    fn compile_ok(src: &str) -> CompileArtifact {
        compile(src, CompilerConfig::with_standard_library()).unwrap_or_else(|errs| {
            panic!("compile errors: {errs:?}");
        })
    }

    #[test]
    fn arithmetic_precedence_emits_expected_opcodes() {
        let artifact = compile_ok("print 1 + 2 * 3;");
        let code = &artifact.function.chunk.code;
        assert_eq!(
            code.as_slice(),
            &[
                OpCode::ConstantInt as u8,
                0,
                OpCode::ConstantInt as u8,
                1,
                OpCode::ConstantInt as u8,
                2,
                OpCode::MulInt as u8,
                OpCode::AddInt as u8,
                OpCode::Print as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn chunk_always_ends_with_return() {
        let artifact = compile_ok("");
        assert_eq!(artifact.function.chunk.code, vec![OpCode::Return as u8]);
    }

    #[test]
    fn global_roundtrip_and_assignment() {
        let artifact = compile_ok("int x = 41; x = x + 1; print x;");
        assert!(artifact.function.chunk.code.contains(&(OpCode::GlobalDefine as u8)));
        assert!(artifact.function.chunk.code.contains(&(OpCode::GlobalSet as u8)));
    }

    #[test]
    fn undeclared_global_assignment_is_a_compile_error() {
        let errs = compile("x = 1;", CompilerConfig::with_standard_library()).unwrap_err();
        assert!(!errs.is_empty());
    }

    #[test]
    fn duplicate_local_in_same_scope_errors() {
        let errs = compile("{ int x = 1; int x = 2; }", CompilerConfig::with_standard_library()).unwrap_err();
        assert!(!errs.is_empty());
    }

    #[test]
    fn type_mismatch_on_initializer_errors() {
        let errs = compile("int x = true;", CompilerConfig::with_standard_library()).unwrap_err();
        assert!(!errs.is_empty());
    }
}
