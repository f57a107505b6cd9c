//! Single-pass compiler: scans, parses and emits bytecode in one walk.
//!
//! The parser is a Pratt parser with a match-based rule table. Each function
//! being compiled gets its own context on a stack (enclosing functions stay
//! below it); classes get a parallel stack so `this.name` can tell private
//! members from public ones at compile time.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt::Write;
use std::rc::Rc;

use thiserror::Error;

use crate::chunk::{Chunk, OpCode};
use crate::heap::{Function, Heap, Object, Table};
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;

/// Compilation failed; every diagnostic was already printed to stderr.
#[derive(Debug, Error)]
#[error("compilation failed with {} diagnostic(s)", .diagnostics.len())]
pub struct CompileError {
    /// The formatted diagnostics, in the order they were reported.
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    BitShift,   // << >>
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Exponent,   // **
    Subscript,  // []
    Call,       // . ()
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
            Comparison => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => BitShift,
            BitShift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Exponent,
            Exponent => Subscript,
            Subscript => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn infix_precedence(typ: TokenType) -> Precedence {
    use TokenType::*;
    match typ {
        LeftParen | Dot => Precedence::Call,
        LeftBracket => Precedence::Subscript,
        Power => Precedence::Exponent,
        Star | Slash | Modulo => Precedence::Factor,
        Plus | Minus | PlusPlus | MinusMinus => Precedence::Term,
        ShiftLeft | ShiftRight => Precedence::BitShift,
        BitAnd => Precedence::BitAnd,
        BitXor => Precedence::BitXor,
        BitOr => Precedence::BitOr,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Lambda,
}

#[derive(Debug)]
struct Local {
    name: String,
    // -1 marks "declared but not yet initialized"
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

// Per-function compilation state. The innermost function under compilation
// is the top of the parser's context stack.
#[derive(Debug)]
struct Context {
    kind: FunctionKind,
    chunk: Chunk,
    arity: usize,
    name: Option<crate::heap::ObjRef>,
    last_call: bool,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

#[derive(Debug, Default)]
struct ClassContext {
    private_variables: HashSet<String>,
}

#[derive(Debug)]
struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,
    contexts: Vec<Context>,
    classes: Vec<ClassContext>,
    loop_start: Option<usize>,
    loop_scope_depth: i32,
    library: crate::heap::ObjRef,
    heap: &'ctx mut Heap,
    globals: &'ctx Table,
}

const MAX_PARAMETERS: usize = 30;
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles a source text into a `Function` object owned by `library`.
/// `globals` is the VM's table of native globals; names found in it compile
/// to a read-only fast path.
pub fn compile(
    source: &str,
    library: crate::heap::ObjRef,
    heap: &mut Heap,
    globals: &Table,
) -> Result<crate::heap::ObjRef, CompileError> {
    let placeholder = Token {
        typ: TokenType::Eof,
        raw: Cow::Borrowed(""),
        line: 0,
    };
    let mut parser = Parser {
        scanner: Scanner::new(source),
        current: placeholder.clone(),
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        contexts: Vec::new(),
        classes: Vec::new(),
        loop_start: None,
        loop_scope_depth: 0,
        library,
        heap,
        globals,
    };
    parser.push_context(FunctionKind::Script);
    parser.advance();
    while !parser.matches(TokenType::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_context();
    if parser.had_error {
        Err(CompileError {
            diagnostics: parser.diagnostics,
        })
    } else {
        Ok(function)
    }
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    // ---- token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current.clone();
        while let Some(token) = self.scanner.next_token() {
            if token.typ == TokenType::Error {
                let message = token.raw.to_string();
                let token = token.clone();
                self.report(&token, &message);
            } else {
                self.current = token;
                return;
            }
        }
        // scanner exhausted; current stays at Eof
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.current.typ == typ {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    // ---- diagnostics ----

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.report(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.report(&token, message);
    }

    fn report(&mut self, token: &Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let mut diagnostic = format!("\n{}::", self.library_name());
        match token.typ {
            TokenType::Eof => {
                let _ = write!(diagnostic, " at the end of line {}", token.line);
            }
            TokenType::Error => {}
            _ => {
                let _ = write!(diagnostic, "{} | {}", token.line, token.raw);
            }
        }
        let _ = write!(diagnostic, "\n    -> {}\n", message);
        eprint!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
        self.had_error = true;
    }

    fn library_name(&self) -> String {
        match self.heap.get(self.library) {
            Object::Library(library) => self
                .heap
                .as_string(library.name)
                .map(|s| s.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            use TokenType::*;
            match self.current.typ {
                Class | Define | Let | For | Break | If | While | Use | Return | Private
                | Assert => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- contexts ----

    fn context(&self) -> &Context {
        self.contexts.last().expect("context stack is never empty")
    }

    fn context_mut(&mut self) -> &mut Context {
        self.contexts
            .last_mut()
            .expect("context stack is never empty")
    }

    fn push_context(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Script => None,
            FunctionKind::Lambda => Some(self.heap.intern("unknown")),
            _ => {
                let text = self.previous.raw.to_string();
                Some(self.heap.intern(&text))
            }
        };
        // Slot zero belongs to the callee; methods name it `this`.
        let slot_zero = Local {
            name: if kind == FunctionKind::Function {
                String::new()
            } else {
                "this".to_string()
            },
            depth: 0,
            is_captured: false,
        };
        self.contexts.push(Context {
            kind,
            chunk: Chunk::new(),
            arity: 0,
            name,
            last_call: false,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn end_context(&mut self) -> (crate::heap::ObjRef, Vec<CompilerUpvalue>) {
        self.emit_return();
        let context = self.contexts.pop().expect("context stack is never empty");
        #[cfg(feature = "trace")]
        if !self.had_error {
            let title = context
                .name
                .and_then(|n| self.heap.as_string(n).map(|s| s.to_string()))
                .unwrap_or_else(|| self.library_name());
            context.chunk.disassemble(&title, self.heap);
        }
        let upvalues = context.upvalues;
        let function = Function {
            arity: context.arity,
            upvalue_count: upvalues.len(),
            chunk: Rc::new(context.chunk),
            name: context.name,
            library: self.library,
        };
        (self.heap.alloc(Object::Function(function)), upvalues)
    }

    fn begin_scope(&mut self) {
        self.context_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.context_mut().scope_depth -= 1;
        loop {
            let op = {
                let context = self.context();
                match context.locals.last() {
                    Some(local) if local.depth > context.scope_depth => {
                        if local.is_captured {
                            OpCode::CloseUpvalue
                        } else {
                            OpCode::Pop
                        }
                    }
                    _ => break,
                }
            };
            self.emit_op(op);
            self.context_mut().locals.pop();
        }
    }

    // ---- emission ----

    fn chunk_len(&self) -> usize {
        self.context().chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.context_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.context().kind == FunctionKind::Initializer {
            self.emit_op_operand(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::None);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.context_mut().chunk.add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_operand(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 skips the operand bytes themselves
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.context_mut().chunk;
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    // ---- variable resolution ----

    fn resolve_local(&mut self, ctx: usize, name: &str) -> Option<u8> {
        for i in (0..self.contexts[ctx].locals.len()).rev() {
            if self.contexts[ctx].locals[i].name == name {
                if self.contexts[ctx].locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, ctx: usize, name: &str) -> Option<u8> {
        if ctx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ctx - 1, name) {
            self.contexts[ctx - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ctx - 1, name) {
            return Some(self.add_upvalue(ctx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, ctx: usize, index: u8, is_local: bool) -> u8 {
        let candidate = CompilerUpvalue { index, is_local };
        if let Some(existing) = self.contexts[ctx]
            .upvalues
            .iter()
            .position(|u| *u == candidate)
        {
            return existing as u8;
        }
        if self.contexts[ctx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in one function.");
            return 0;
        }
        self.contexts[ctx].upvalues.push(candidate);
        (self.contexts[ctx].upvalues.len() - 1) as u8
    }

    fn add_local(&mut self, name: String) {
        if self.context().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in one function.");
            return;
        }
        self.context_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.context().scope_depth == 0 {
            return;
        }
        let name = self.previous.raw.to_string();
        let mut duplicate = false;
        {
            let context = self.context();
            for local in context.locals.iter().rev() {
                if local.depth != -1 && local.depth < context.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a defined variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.context().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.raw.to_string();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.context().scope_depth == 0 {
            return;
        }
        let depth = self.context().scope_depth;
        if let Some(local) = self.context_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8, is_private: bool) {
        if self.context().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if is_private {
            self.emit_op_operand(OpCode::PrivateDefine, global);
        } else {
            self.emit_op_operand(OpCode::DefineLibrary, global);
        }
    }

    // Compile-time registration of a private top-level name, so later
    // references in this module resolve to the private ops.
    fn set_private_value(&mut self, name: &str) {
        let key = self.heap.intern(name);
        if let Object::Library(library) = self.heap.get_mut(self.library) {
            library.private_values.insert(key, Value::None);
        }
    }

    fn library_private_contains(&self, key: crate::heap::ObjRef) -> bool {
        match self.heap.get(self.library) {
            Object::Library(library) => library.private_values.contains_key(&key),
            _ => false,
        }
    }

    fn set_private_property(&mut self, name: &str) {
        if let Some(class) = self.classes.last_mut() {
            class.private_variables.insert(name.to_string());
        }
    }

    fn class_private_contains(&self, name: &str) -> bool {
        self.classes
            .last()
            .map_or(false, |class| class.private_variables.contains(name))
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        let prefix_type = self.previous.typ;
        if !self.prefix(prefix_type, can_assign) {
            self.error("Expected a valid expression.");
            return;
        }
        while precedence <= infix_precedence(self.current.typ) {
            // the infix rule gets the token before the operator, so `.` can
            // see whether the receiver expression was `this`
            let before_operator = self.previous.clone();
            self.advance();
            let typ = self.previous.typ;
            self.infix(typ, can_assign, before_operator);
        }
        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, typ: TokenType, can_assign: bool) -> bool {
        use TokenType::*;
        match typ {
            LeftParen => self.grouping(),
            LeftBracket => self.list(),
            Minus | Bang => self.unary(),
            Identifier => self.variable(can_assign),
            String => self.string(),
            Number => self.number(),
            True | False | None => self.literal(),
            Lambda => self.lambda(),
            This => self.this_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, typ: TokenType, can_assign: bool, before_operator: Token<'src>) {
        use TokenType::*;
        match typ {
            LeftParen => self.call(),
            Dot => self.dot(can_assign, before_operator),
            LeftBracket => self.subscript(can_assign),
            PlusPlus => self.emit_op(OpCode::Increment),
            MinusMinus => self.emit_op(OpCode::Decrement),
            And => self.and_operator(),
            Or => self.or_operator(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expected a ')' after the expression.");
        self.context_mut().last_call = false;
    }

    fn literal(&mut self) {
        match self.previous.typ {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::None => self.emit_op(OpCode::None),
            _ => return,
        }
        self.context_mut().last_call = false;
    }

    fn number(&mut self) {
        let raw = self.previous.raw.replace('_', "");
        let parsed = if raw.starts_with("0x") || raw.starts_with("0X") {
            i64::from_str_radix(&raw[2..], 16).map(|n| n as f64).ok()
        } else if raw.starts_with("0o") || raw.starts_with("0O") {
            i64::from_str_radix(&raw[2..], 8).map(|n| n as f64).ok()
        } else {
            raw.parse().ok()
        };
        match parsed {
            Some(value) => self.emit_constant(Value::Number(value)),
            None => self.error("Number literal is too large."),
        }
    }

    fn string(&mut self) {
        let refined = refine(&self.previous.raw);
        let interned = self.heap.intern(&refined);
        self.emit_constant(Value::Obj(interned));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.clone();
        self.named_variable(name, can_assign);
        self.context_mut().last_call = false;
    }

    fn this_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use the keyword 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let text = name.raw.to_string();
        let top = self.contexts.len() - 1;
        let (get_op, set_op, arg, can_assign) = if let Some(slot) = self.resolve_local(top, &text)
        {
            (OpCode::GetLocal, OpCode::SetLocal, slot, can_assign)
        } else if let Some(slot) = self.resolve_upvalue(top, &text) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot, can_assign)
        } else {
            let arg = self.identifier_constant(&text);
            let key = self.heap.intern(&text);
            if self.globals.contains_key(&key) {
                // native globals are read-only
                (OpCode::GetGlobal, OpCode::GetGlobal, arg, false)
            } else if self.library_private_contains(key) {
                (OpCode::PrivateGet, OpCode::PrivateSet, arg, can_assign)
            } else {
                (OpCode::GetLibrary, OpCode::SetLibrary, arg, can_assign)
            }
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op_operand(set_op, arg);
        } else if can_assign && self.matches(TokenType::PlusPlus) {
            self.named_variable(name, false);
            self.emit_op(OpCode::Increment);
            self.emit_op_operand(set_op, arg);
        } else if can_assign && self.matches(TokenType::MinusMinus) {
            self.named_variable(name, false);
            self.emit_op(OpCode::Decrement);
            self.emit_op_operand(set_op, arg);
        } else {
            self.emit_op_operand(get_op, arg);
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.emit_op(OpCode::Not),
            TokenType::Minus => self.emit_op(OpCode::Negate),
            _ => return,
        }
        self.context_mut().last_call = false;
    }

    fn binary(&mut self) {
        let operator = self.previous.typ;
        self.parse_precedence(infix_precedence(operator).next());
        use TokenType::*;
        match operator {
            BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            EqualEqual => self.emit_op(OpCode::Equal),
            Greater => self.emit_op(OpCode::Greater),
            GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            Less => self.emit_op(OpCode::Less),
            LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            Plus => self.emit_op(OpCode::Add),
            Minus => self.emit_op(OpCode::Subtract),
            Star => self.emit_op(OpCode::Multiply),
            Slash => self.emit_op(OpCode::Divide),
            Modulo => self.emit_op(OpCode::Modulo),
            Power => self.emit_op(OpCode::Power),
            BitAnd => self.emit_op(OpCode::BitAnd),
            BitOr => self.emit_op(OpCode::BitOr),
            BitXor => self.emit_op(OpCode::BitXor),
            ShiftLeft => self.emit_op(OpCode::ShiftLeft),
            ShiftRight => self.emit_op(OpCode::ShiftRight),
            _ => return,
        }
        self.context_mut().last_call = false;
    }

    fn and_operator(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
        self.context_mut().last_call = false;
    }

    fn or_operator(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
        self.context_mut().last_call = false;
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_operand(OpCode::Call, arg_count);
        self.context_mut().last_call = true;
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_PARAMETERS {
                    self.error("Can't have more than 30 arguments within a function.");
                }
                arg_count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected a ')' after arguments.");
        arg_count as u8
    }

    fn dot(&mut self, can_assign: bool, before_operator: Token<'src>) {
        self.consume(TokenType::Identifier, "Expected a property name after '.'");
        let name_text = self.previous.raw.to_string();
        let name = self.identifier_constant(&name_text);

        let is_private =
            before_operator.typ == TokenType::This && self.class_private_contains(&name_text);

        if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            let op = if is_private {
                OpCode::InvokePrivate
            } else {
                OpCode::Invoke
            };
            self.emit_op_operand(op, arg_count);
            self.emit_byte(name);
            self.context_mut().last_call = false;
            return;
        }

        let (get_no_pop, get, set) = if is_private {
            (
                OpCode::PrivateGetPropertyNoPop,
                OpCode::PrivatePropertyGet,
                OpCode::PrivatePropertySet,
            )
        } else {
            (
                OpCode::GetPropertyNoPop,
                OpCode::GetProperty,
                OpCode::SetProperty,
            )
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op_operand(set, name);
        } else if can_assign && self.matches(TokenType::PlusPlus) {
            self.emit_op_operand(get_no_pop, name);
            self.emit_op(OpCode::Increment);
            self.emit_op_operand(set, name);
        } else if can_assign && self.matches(TokenType::MinusMinus) {
            self.emit_op_operand(get_no_pop, name);
            self.emit_op(OpCode::Decrement);
            self.emit_op_operand(set, name);
        } else {
            self.emit_op_operand(get, name);
        }
        self.context_mut().last_call = false;
    }

    fn subscript(&mut self, can_assign: bool) {
        self.parse_precedence(Precedence::Or);
        self.consume(
            TokenType::RightBracket,
            "Expected a closing ']' after the index value.",
        );
        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreSubscript);
        } else if can_assign && self.matches(TokenType::PlusPlus) {
            self.emit_ops(OpCode::IndexSubscriptNoPop, OpCode::Increment);
            self.emit_op(OpCode::StoreSubscript);
        } else if can_assign && self.matches(TokenType::MinusMinus) {
            self.emit_ops(OpCode::IndexSubscriptNoPop, OpCode::Decrement);
            self.emit_op(OpCode::StoreSubscript);
        } else {
            self.emit_op(OpCode::IndexSubscript);
        }
        self.context_mut().last_call = false;
    }

    fn list(&mut self) {
        let mut count = 0usize;
        if !self.check(TokenType::RightBracket) {
            loop {
                if self.check(TokenType::RightBracket) {
                    break;
                }
                self.parse_precedence(Precedence::Or);
                if count == u8::MAX as usize {
                    self.error("Cannot have more than 255 items in a list.");
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(
            TokenType::RightBracket,
            "Expected a closing ']' at the list's end.",
        );
        self.emit_op_operand(OpCode::BuildList, count as u8);
        self.context_mut().last_call = false;
    }

    fn lambda(&mut self) {
        self.push_context(FunctionKind::Lambda);
        self.begin_scope();
        self.consume(
            TokenType::LeftParen,
            "Expected a '(' after the 'lambda' keyword.",
        );
        self.function_parameters();
        self.consume(TokenType::RightParen, "Expected a ')'.");
        self.consume(TokenType::Arrow, "Expected an arrow ('->') after ')'.");
        if self.matches(TokenType::LeftBrace) {
            self.block();
        } else {
            self.expression();
            self.emit_op(OpCode::Return);
        }
        self.finish_function();
    }

    // ---- functions, methods, classes ----

    fn function_parameters(&mut self) {
        if self.check(TokenType::RightParen) {
            return;
        }
        loop {
            self.context_mut().arity += 1;
            if self.context().arity > MAX_PARAMETERS {
                self.error_at_current("Can't have more than 30 parameters.");
            }
            let constant = self.parse_variable("Expected a parameter name or ')'.");
            self.define_variable(constant, false);
            if !self.matches(TokenType::Comma) {
                break;
            }
        }
    }

    fn body(&mut self) {
        self.function_parameters();
        self.consume(TokenType::RightParen, "Expected a ')'.");
        self.consume(TokenType::LeftBrace, "Expected a '{' after the closing ')'.");
        self.block();
        self.finish_function();
    }

    // Wraps up the innermost context: emits Closure in the enclosing chunk,
    // followed by the finished function's own upvalue descriptors.
    fn finish_function(&mut self) {
        let (function, upvalues) = self.end_context();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_operand(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_context(kind);
        self.consume(TokenType::LeftParen, "Expected a '(' after function name.");
        self.begin_scope();
        self.body();
    }

    fn method(&mut self, is_private: bool) {
        self.consume(TokenType::Identifier, "Expected a method name.");
        let name_text = self.previous.raw.to_string();
        let constant = self.identifier_constant(&name_text);

        let kind = if name_text == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        if is_private {
            self.set_private_property(&name_text);
            self.emit_op_operand(OpCode::PrivateMethod, constant);
        } else {
            self.emit_op_operand(OpCode::Method, constant);
        }
    }

    fn class_declaration(&mut self, is_private: bool) {
        self.consume(TokenType::Identifier, "Expected a class name.");
        let class_name = self.previous.clone();
        let name_text = class_name.raw.to_string();
        let name_constant = self.identifier_constant(&name_text);
        self.declare_variable();

        self.classes.push(ClassContext::default());

        self.emit_op_operand(OpCode::Class, name_constant);
        if is_private {
            self.set_private_value(&name_text);
        }
        self.define_variable(name_constant, is_private);

        self.named_variable(class_name, false);
        self.consume(
            TokenType::LeftBrace,
            "Expected an opening '{' before the class body.",
        );
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            let private_method = self.matches(TokenType::Private);
            self.method(private_method);
        }
        self.consume(
            TokenType::RightBrace,
            "Expected a closing '}' after the class body.",
        );
        self.emit_op(OpCode::Pop);

        self.classes.pop();
    }

    fn fun_declaration(&mut self, is_private: bool) {
        let global = self.parse_variable("Expected a function name.");
        let name = self.previous.raw.to_string();
        if is_private {
            self.set_private_value(&name);
        }
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global, is_private);
    }

    fn var_declaration(&mut self, is_private: bool) {
        let global = self.parse_variable("Expected a variable name.");
        let name = self.previous.raw.to_string();
        self.consume(TokenType::Equal, "Expected an '=' after the variable name.");
        self.expression();
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after variable declaration.",
        );
        if is_private {
            self.set_private_value(&name);
        }
        self.define_variable(global, is_private);
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration(false);
        } else if self.matches(TokenType::Define) {
            self.fun_declaration(false);
        } else if self.matches(TokenType::Let) {
            self.var_declaration(false);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        self.context_mut().last_call = false;

        if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Use) {
            self.use_statement();
        } else if self.matches(TokenType::If) {
            self.begin_scope();
            self.if_statement();
            self.end_scope();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::Continue) {
            self.continue_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::Private) {
            self.private_statement();
        } else if self.matches(TokenType::Assert) {
            self.assert_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expected a closing '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after the previous expression.",
        );
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.expression();

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        self.begin_scope();

        let mother_start = self.loop_start;
        let mother_depth = self.loop_scope_depth;
        self.loop_start = Some(self.chunk_len());
        self.loop_scope_depth = self.context().scope_depth;

        self.expression();
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.statement();
        if let Some(start) = self.loop_start {
            self.emit_loop(start);
        }

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.break_loop();
        self.loop_start = mother_start;
        self.loop_scope_depth = mother_depth;

        self.end_scope();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Let) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mother_start = self.loop_start;
        let mother_depth = self.loop_scope_depth;
        self.loop_start = Some(self.chunk_len());
        self.loop_scope_depth = self.context().scope_depth;

        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expected a ';' after the loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenType::Semicolon) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);

            if let Some(start) = self.loop_start {
                self.emit_loop(start);
            }
            self.loop_start = Some(increment_start);
            self.patch_jump(body_jump);
        }

        self.statement();
        if let Some(start) = self.loop_start {
            self.emit_loop(start);
        }

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        self.break_loop();
        self.end_scope();

        self.loop_start = mother_start;
        self.loop_scope_depth = mother_depth;
    }

    // Rewrites every Break placeholder emitted since the loop started into a
    // forward Jump targeting the current end of the chunk.
    fn break_loop(&mut self) {
        let start = match self.loop_start {
            Some(start) => start,
            None => return,
        };
        let top = self.contexts.len() - 1;
        let mut i = start;
        while i < self.contexts[top].chunk.code.len() {
            if self.contexts[top].chunk.code[i] == OpCode::Break as u8 {
                self.contexts[top].chunk.code[i] = OpCode::Jump as u8;
                self.patch_jump(i + 1);
                i += 3;
            } else {
                let operands = self.contexts[top].chunk.operand_len(i, self.heap);
                i += 1 + operands;
            }
        }
    }

    fn break_statement(&mut self) {
        if self.loop_start.is_none() {
            self.error("Can't use the keyword 'break' outside of a loop.");
        }
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after the keyword 'break'.",
        );
        self.pop_loop_locals();
        self.emit_jump(OpCode::Break);
    }

    fn continue_statement(&mut self) {
        if self.loop_start.is_none() {
            self.error("Can't use the keyword 'continue' outside of a loop.");
        }
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after keyword 'continue'.",
        );
        self.pop_loop_locals();
        if let Some(start) = self.loop_start {
            self.emit_loop(start);
        }
    }

    // Emits Pops for locals that would go out of scope when jumping out of
    // (or back to the top of) the innermost loop; the locals stay declared,
    // since compilation continues in place.
    fn pop_loop_locals(&mut self) {
        let mut pops = 0;
        for local in self.context().locals.iter().rev() {
            if local.depth <= self.loop_scope_depth {
                break;
            }
            pops += 1;
        }
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }
    }

    fn return_statement(&mut self) {
        if self.context().kind == FunctionKind::Script {
            self.error("Can not return from top-level code.");
        }
        if self.context().kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }

        self.expression();
        self.consume(TokenType::Semicolon, "Expected a ';' after the return value.");

        if self.context().last_call {
            // turn `return f(...)` into a frame-reusing tail call
            let offset = self.chunk_len() - 2;
            self.context_mut().chunk.code[offset] = OpCode::TailCall as u8;
            self.context_mut().last_call = false;
        }
        self.emit_op(OpCode::Return);
    }

    fn assert_statement(&mut self) {
        let fallback = self.heap.intern("No Source.");
        let mut constant = self.make_constant(Value::Obj(fallback));

        self.expression();
        if self.matches(TokenType::Comma) {
            self.consume(
                TokenType::String,
                "Expected an assert error string after the ','.",
            );
            let raw = self.previous.raw.to_string();
            let message = self.heap.intern(&raw[1..raw.len() - 1]);
            constant = self.make_constant(Value::Obj(message));
        }
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after assert's error string.",
        );
        self.emit_op_operand(OpCode::Assert, constant);
    }

    fn private_statement(&mut self) {
        if self.matches(TokenType::Let) {
            self.var_declaration(true);
        } else if self.matches(TokenType::Define) {
            self.fun_declaration(true);
        } else if self.matches(TokenType::Class) {
            self.class_declaration(true);
        } else if self.matches(TokenType::Identifier) {
            if self.classes.is_empty() {
                self.error("Can't create a private property outside of a class.");
                return;
            }
            let name_text = self.previous.raw.to_string();
            let name = self.identifier_constant(&name_text);
            self.emit_op_operand(OpCode::GetLocal, 0);
            self.consume(TokenType::Equal, "Expected an '=' after property name");
            self.expression();
            self.emit_op_operand(OpCode::PrivatePropertySet, name);
            self.emit_op(OpCode::Pop);
            self.set_private_property(&name_text);
            self.consume(
                TokenType::Semicolon,
                "Expected a ';' after the property value.",
            );
        } else {
            self.error_at_current("Expected a declaration after 'private'.");
        }
    }

    fn use_statement(&mut self) {
        if self.matches(TokenType::String) {
            let raw = self.previous.raw.to_string();
            let name = self.heap.intern(&raw[1..raw.len() - 1]);
            let constant = self.make_constant(Value::Obj(name));

            self.emit_op_operand(OpCode::Use, constant);
            self.emit_op(OpCode::Pop);

            if self.matches(TokenType::For) {
                let library = self.parse_variable("Expected an identifier after library's path.");
                self.emit_op(OpCode::UseName);
                self.define_variable(library, false);
            }
        } else {
            self.consume(TokenType::Identifier, "Expected a library's name identifier.");
            let name_text = self.previous.raw.to_string();
            let lib_name = self.identifier_constant(&name_text);
            self.declare_variable();

            match crate::library::native_module_index(&name_text) {
                Some(index) => {
                    self.emit_op_operand(OpCode::UseBuiltin, index);
                    self.emit_byte(lib_name);
                }
                None => self.error("Native library does not exist."),
            }
            self.define_variable(lib_name, false);
        }
        self.consume(
            TokenType::Semicolon,
            "Expected a ';' after the 'use' statement.",
        );
        self.emit_op(OpCode::RecentUse);
    }
}

// Resolves the escape sequences a string literal may carry. The scanner
// hands the literal over raw, quotes included.
fn refine(raw: &str) -> String {
    let inner = &raw[1..raw.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('a') => out.push('\x07'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::Library;

    fn compile_source(source: &str) -> (Result<crate::heap::ObjRef, CompileError>, Heap) {
        let mut heap = Heap::new();
        let name = heap.intern("test");
        let library = heap.alloc(Object::Library(Library {
            name,
            values: Table::new(),
            private_values: Table::new(),
        }));
        let globals = Table::new();
        let result = compile(source, library, &mut heap, &globals);
        (result, heap)
    }

    fn function_chunk(heap: &Heap, r: crate::heap::ObjRef) -> Rc<Chunk> {
        match heap.get(r) {
            Object::Function(f) => Rc::clone(&f.chunk),
            other => panic!("expected a function, got {:?}", other),
        }
    }

    // Finds the first function constant in a chunk, innermost declarations
    // being nested in the script chunk's constant pool.
    fn first_function(heap: &Heap, chunk: &Chunk) -> crate::heap::ObjRef {
        chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("chunk holds no function constant")
    }

    #[test]
    fn top_level_let_defines_a_library_binding() {
        let (result, heap) = compile_source("let x = 1;");
        let chunk = function_chunk(&heap, result.expect("compiles"));
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant as u8,
                1, // "x" was interned into slot 0 first
                OpCode::DefineLibrary as u8,
                0,
                OpCode::None as u8,
                OpCode::Return as u8,
            ],
        );
    }

    #[test]
    fn return_of_a_call_becomes_a_tail_call() {
        let (result, heap) = compile_source("define f() { return f(); }");
        let script = function_chunk(&heap, result.expect("compiles"));
        let inner = function_chunk(&heap, first_function(&heap, &script));
        assert_eq!(
            inner.code,
            vec![
                OpCode::GetLibrary as u8,
                0,
                OpCode::TailCall as u8,
                0,
                OpCode::Return as u8,
                OpCode::None as u8,
                OpCode::Return as u8,
            ],
        );
    }

    #[test]
    fn non_tail_return_keeps_a_plain_call() {
        let (result, heap) = compile_source("define f(n) { return f(n) + 1; }");
        let script = function_chunk(&heap, result.expect("compiles"));
        let inner = function_chunk(&heap, first_function(&heap, &script));
        assert!(inner.code.contains(&(OpCode::Call as u8)));
        assert!(!inner.code.contains(&(OpCode::TailCall as u8)));
    }

    #[test]
    fn parameters_count_into_arity() {
        let (result, heap) = compile_source("define add(a, b) { return a + b; }");
        let script = function_chunk(&heap, result.expect("compiles"));
        let inner = first_function(&heap, &script);
        match heap.get(inner) {
            Object::Function(f) => assert_eq!(f.arity, 2),
            other => panic!("expected a function, got {:?}", other),
        }
    }

    #[test]
    fn lambda_captures_an_upvalue() {
        let (result, heap) =
            compile_source("define outer() { let x = 1; return lambda () -> x; }");
        let script = function_chunk(&heap, result.expect("compiles"));
        let outer = function_chunk(&heap, first_function(&heap, &script));
        let lambda = first_function(&heap, &outer);
        match heap.get(lambda) {
            Object::Function(f) => assert_eq!(f.upvalue_count, 1),
            other => panic!("expected a function, got {:?}", other),
        }
        // the Closure instruction carries one (is_local, index) pair
        let closure_at = outer
            .code
            .iter()
            .position(|b| *b == OpCode::Closure as u8)
            .expect("no closure instruction");
        assert_eq!(outer.operand_len(closure_at, &heap), 3);
    }

    #[test]
    fn break_placeholders_are_rewritten_to_jumps() {
        let (result, heap) = compile_source("while true { break; }");
        let chunk = function_chunk(&heap, result.expect("compiles"));
        let mut offset = 0;
        while offset < chunk.code.len() {
            assert_ne!(chunk.code[offset], OpCode::Break as u8, "unpatched break");
            offset += 1 + chunk.operand_len(offset, &heap);
        }
    }

    #[test]
    fn errors_resynchronize_at_statement_boundaries() {
        let (result, _) = compile_source("let = 1; 1 +;");
        let error = result.expect_err("should not compile");
        assert_eq!(error.diagnostics.len(), 2);
    }

    #[test]
    fn break_outside_a_loop_is_an_error() {
        let (result, _) = compile_source("break;");
        assert!(result.is_err());
    }

    #[test]
    fn private_property_outside_a_class_is_an_error() {
        let (result, _) = compile_source("private x = 1;");
        let error = result.expect_err("should not compile");
        assert!(error.diagnostics[0].contains("outside of a class"));
    }

    #[test]
    fn hex_and_octal_literals_compile_to_numbers() {
        let (result, heap) = compile_source("let a = 0xFF; let b = 0o17; let c = 1_000;");
        let chunk = function_chunk(&heap, result.expect("compiles"));
        assert!(chunk.constants.contains(&Value::Number(255.0)));
        assert!(chunk.constants.contains(&Value::Number(15.0)));
        assert!(chunk.constants.contains(&Value::Number(1000.0)));
    }

    #[test]
    fn oversized_number_literals_are_rejected() {
        let (result, _) = compile_source("let x = 0xFFFF_FFFF_FFFF_FFFF_FFFF;");
        let error = result.expect_err("should not compile");
        assert!(error.diagnostics[0].contains("too large"));
    }

    #[test]
    fn list_literals_stop_at_255_items() {
        let ones = vec!["1"; 255].join(", ");
        let (result, _) = compile_source(&format!("let l = [{}];", ones));
        assert!(result.is_ok());

        let ones = vec!["1"; 256].join(", ");
        let (result, _) = compile_source(&format!("let l = [{}];", ones));
        let error = result.expect_err("should not compile");
        assert!(error.diagnostics[0].contains("255 items"));
    }

    #[test]
    fn string_escapes_are_refined() {
        assert_eq!(refine(r#""a\nb""#), "a\nb");
        assert_eq!(refine(r#"'it\'s'"#), "it's");
        assert_eq!(refine(r#""tab\there""#), "tab\there");
        assert_eq!(refine(r#""keep \q""#), "keep \\q");
    }

    #[test]
    fn assignment_to_a_native_global_is_rejected() {
        let mut heap = Heap::new();
        let name = heap.intern("test");
        let library = heap.alloc(Object::Library(Library {
            name,
            values: Table::new(),
            private_values: Table::new(),
        }));
        let mut globals = Table::new();
        let print_name = heap.intern("print");
        globals.insert(print_name, Value::None);
        let result = compile("print = 1;", library, &mut heap, &globals);
        assert!(result.is_err());
    }
}
