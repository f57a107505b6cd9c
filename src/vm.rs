//! The bytecode virtual machine.
//!
//! A stack machine over [`Chunk`]s. Function calls push [`CallFrame`]s that
//! window the value stack; `return <call>;` reuses the current frame, which
//! keeps self-recursive tail calls at constant depth. Modules are libraries:
//! the `use` instruction resolves a path to source, compiles it into a fresh
//! library and runs its top-level code inline.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::chunk::{Chunk, OpCode};
use crate::compiler::{self, CompileError};
use crate::heap::{
    BoundMethod, Class, Closure, Heap, Instance, Library, NativeFn, ObjRef, Object, Table,
    Upvalue,
};
use crate::value::Value;

/// Deepest allowed call nesting.
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Maps a module path, as written in a `use` statement, to its source text.
pub type Resolver = Box<dyn Fn(&str) -> Option<String>>;

/// Why a program did not run to completion.
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The source did not compile; diagnostics went to stderr.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// The program failed at runtime; the trace went to stderr.
    #[error("runtime error")]
    Runtime,
    /// The VM broke one of its own invariants.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// A bug in the VM or in emitted bytecode, never a user error.
#[derive(Debug, Error)]
pub enum InternalError {
    /// A stack slot was read or popped that was never pushed.
    #[error("value stack underflow")]
    StackUnderflow,
    /// Dispatch ran without an active call frame.
    #[error("no active call frame")]
    NoFrame,
    /// The instruction stream held a byte no opcode decodes to.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// An operand pointed outside the constant pool or upvalue list.
    #[error("operand out of range")]
    BadOperand,
    /// A handle led to an object of the wrong kind.
    #[error("object of an unexpected kind")]
    WrongObject,
}

#[derive(Debug)]
struct CallFrame {
    closure: ObjRef,
    // cached from the closure's function so dispatch never touches the heap
    chunk: Rc<Chunk>,
    library: ObjRef,
    ip: usize,
    base: usize,
}

/// The virtual machine: value stack, call frames, native surfaces and the
/// object heap.
pub struct Vm {
    /// The object heap. Natives allocate and inspect through it.
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    pub(crate) libraries: Table,
    pub(crate) list_methods: Table,
    pub(crate) string_methods: Table,
    pub(crate) number_methods: Table,
    open_upvalues: Vec<ObjRef>,
    recent_library: Option<ObjRef>,
    init_string: ObjRef,
    resolver: Resolver,
}

/// Which native table a definition lands in.
#[derive(Debug, Clone, Copy)]
pub enum NativeTable {
    /// Bare names visible from every module.
    Globals,
    /// Methods on list values.
    Lists,
    /// Methods on string values.
    Strings,
    /// Methods on number values.
    Numbers,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    /// A VM with the native globals, method tables and library registry
    /// installed.
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Table::new(),
            libraries: Table::new(),
            list_methods: Table::new(),
            string_methods: Table::new(),
            number_methods: Table::new(),
            open_upvalues: Vec::new(),
            recent_library: None,
            init_string,
            resolver: Box::new(default_resolver),
        };
        crate::natives::define_globals(&mut vm);
        crate::natives::define_methods(&mut vm);
        crate::natives::load_extras(&mut vm);
        vm
    }

    /// Replaces how `use "path"` finds module source. The default resolver
    /// reads from the filesystem, trying the path as written and then with
    /// a `.ql` extension.
    pub fn set_resolver(&mut self, resolver: Resolver) {
        self.resolver = resolver;
    }

    /// Compiles and runs `source` as the library named `library_name`.
    pub fn interpret(&mut self, source: &str, library_name: &str) -> Result<(), InterpretError> {
        let name = self.heap.intern(library_name);
        let library = self.new_library(name);
        let function = compiler::compile(source, library, &mut self.heap, &self.globals)?;
        let closure = self.heap.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure))?;
        self.call_value(Value::Obj(closure), 0)?;
        self.run()
    }

    // ---- construction helpers for natives and libraries ----

    /// Returns the library registered under `name`, creating and caching an
    /// empty one carrying a `__name__` binding on the first request.
    pub fn new_library(&mut self, name: ObjRef) -> ObjRef {
        if let Some(Value::Obj(existing)) = self.libraries.get(&name) {
            return *existing;
        }
        let library = self.heap.alloc(Object::Library(Library {
            name,
            values: Table::new(),
            private_values: Table::new(),
        }));
        let key = self.heap.intern("__name__");
        if let Object::Library(lib) = self.heap.get_mut(library) {
            lib.values.insert(key, Value::Obj(name));
        }
        self.libraries.insert(name, Value::Obj(library));
        library
    }

    /// Installs a native function in one of the VM's tables.
    pub fn define_native(&mut self, table: NativeTable, name: &str, function: NativeFn) {
        let key = self.heap.intern(name);
        let native = self.heap.alloc(Object::Native(function));
        self.table_mut(table).insert(key, Value::Obj(native));
    }

    /// Installs a native function as a library member.
    pub fn define_library_native(&mut self, library: ObjRef, name: &str, function: NativeFn) {
        let key = self.heap.intern(name);
        let native = self.heap.alloc(Object::Native(function));
        if let Object::Library(lib) = self.heap.get_mut(library) {
            lib.values.insert(key, Value::Obj(native));
        }
    }

    /// Installs a plain value as a library member.
    pub fn define_library_value(&mut self, library: ObjRef, name: &str, value: Value) {
        let key = self.heap.intern(name);
        if let Object::Library(lib) = self.heap.get_mut(library) {
            lib.values.insert(key, value);
        }
    }

    fn table_mut(&mut self, table: NativeTable) -> &mut Table {
        match table {
            NativeTable::Globals => &mut self.globals,
            NativeTable::Lists => &mut self.list_methods,
            NativeTable::Strings => &mut self.string_methods,
            NativeTable::Numbers => &mut self.number_methods,
        }
    }

    // ---- errors ----

    /// Prints the frame trace and `message` to stderr, resets the machine
    /// and returns the error to propagate.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        eprintln!();
        for frame in self.frames.iter().rev() {
            let line = frame
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            let library = match self.heap.get(frame.library) {
                Object::Library(lib) => self
                    .heap
                    .as_string(lib.name)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                _ => String::new(),
            };
            let name = match self.heap.get(frame.closure) {
                Object::Closure(closure) => match self.heap.get(closure.function) {
                    Object::Function(function) => function
                        .name
                        .and_then(|n| self.heap.as_string(n).map(|s| s.to_string())),
                    _ => None,
                },
                _ => None,
            };
            match name {
                Some(name) => eprintln!("{}::{} in {}()", library, line, name),
                None => eprint!("{}::{} in <script>\n    {{-}} ", library, line),
            }
        }
        eprintln!("{}\n", message);
        self.reset_stack();
        InterpretError::Runtime
    }

    /// Reports a runtime failure from native code. The native then returns
    /// [`Value::None`] so the VM aborts the current run.
    pub fn raise(&mut self, message: &str) {
        let _ = self.runtime_error(message);
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---- stack ----

    fn push(&mut self, value: Value) -> Result<(), InterpretError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, InternalError> {
        self.stack.pop().ok_or(InternalError::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Result<Value, InternalError> {
        self.stack
            .iter()
            .rev()
            .nth(distance)
            .copied()
            .ok_or(InternalError::StackUnderflow)
    }

    fn set_top(&mut self, value: Value) -> Result<(), InternalError> {
        let top = self.stack.last_mut().ok_or(InternalError::StackUnderflow)?;
        *top = value;
        Ok(())
    }

    // ---- garbage collection ----

    /// Hands the collector every root the VM knows about.
    pub fn collect_now(&mut self) {
        let mut roots: Vec<ObjRef> = Vec::new();
        for value in &self.stack {
            if let Value::Obj(r) = value {
                roots.push(*r);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure);
            roots.push(frame.library);
        }
        roots.extend(self.open_upvalues.iter().copied());
        for table in [
            &self.globals,
            &self.libraries,
            &self.list_methods,
            &self.string_methods,
            &self.number_methods,
        ] {
            for (&key, &value) in table {
                roots.push(key);
                if let Value::Obj(r) = value {
                    roots.push(r);
                }
            }
        }
        roots.extend(self.recent_library);
        roots.push(self.init_string);
        self.heap.collect(roots);
    }

    fn maybe_collect(&mut self) {
        if self.heap.wants_collection() {
            self.collect_now();
        }
    }

    // ---- calls ----

    fn call(&mut self, closure_ref: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let (arity, chunk, name, library) = match self.heap.get(closure_ref) {
            Object::Closure(closure) => match self.heap.get(closure.function) {
                Object::Function(f) => (f.arity, Rc::clone(&f.chunk), f.name, f.library),
                _ => return Err(InternalError::WrongObject.into()),
            },
            _ => return Err(InternalError::WrongObject.into()),
        };
        if arg_count != arity {
            let plural = if arity == 1 { "argument" } else { "arguments" };
            let name = name
                .and_then(|n| self.heap.as_string(n).map(|s| s.to_string()))
                .unwrap_or_else(|| "script".to_string());
            return Err(self.runtime_error(&format!(
                "Expected {} {} but got {} from '{}' call.",
                arity, plural, arg_count, name
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::StackUnderflow)?;
        self.frames.push(CallFrame {
            closure: closure_ref,
            chunk,
            library,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Re-targets the current frame at the closure under the arguments
    /// instead of pushing a new one.
    fn keep_frame(&mut self, closure_ref: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let (arity, chunk, library) = match self.heap.get(closure_ref) {
            Object::Closure(closure) => match self.heap.get(closure.function) {
                Object::Function(f) => (f.arity, Rc::clone(&f.chunk), f.library),
                _ => return Err(InternalError::WrongObject.into()),
            },
            _ => return Err(InternalError::WrongObject.into()),
        };
        if arg_count != arity {
            return Err(self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        let base = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::StackUnderflow)?;
        let frame = self.frames.last_mut().ok_or(InternalError::NoFrame)?;
        frame.closure = closure_ref;
        frame.chunk = chunk;
        frame.library = library;
        frame.ip = 0;
        frame.base = base;
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        if let Value::Obj(r) = callee {
            enum Kind {
                Bound(Value, ObjRef),
                Class(Option<Value>, Option<ObjRef>),
                Closure,
                Native(NativeFn),
                Other,
            }
            let kind = match self.heap.get(r) {
                Object::BoundMethod(bound) => Kind::Bound(bound.receiver, bound.method),
                Object::Class(class) => {
                    Kind::Class(class.methods.get(&self.init_string).copied(), class.name)
                }
                Object::Closure(_) => Kind::Closure,
                Object::Native(f) => Kind::Native(*f),
                _ => Kind::Other,
            };
            match kind {
                Kind::Bound(receiver, method) => {
                    let slot = self
                        .stack
                        .len()
                        .checked_sub(arg_count + 1)
                        .ok_or(InternalError::StackUnderflow)?;
                    self.stack[slot] = receiver;
                    return self.call(method, arg_count);
                }
                Kind::Class(initializer, class_name) => {
                    let instance = self.heap.alloc(Object::Instance(Instance {
                        class: r,
                        fields: Table::new(),
                        private_fields: Table::new(),
                    }));
                    let slot = self
                        .stack
                        .len()
                        .checked_sub(arg_count + 1)
                        .ok_or(InternalError::StackUnderflow)?;
                    self.stack[slot] = Value::Obj(instance);
                    return match initializer {
                        Some(Value::Obj(init)) => self.call(init, arg_count),
                        _ if arg_count != 0 => {
                            let name = class_name
                                .and_then(|n| self.heap.as_string(n).map(|s| s.to_string()))
                                .unwrap_or_default();
                            Err(self.runtime_error(&format!(
                                "Expected 0 arguments but got {} from '{}' constructure call.",
                                arg_count, name
                            )))
                        }
                        _ => Ok(()),
                    };
                }
                Kind::Closure => return self.call(r, arg_count),
                Kind::Native(native) => {
                    let start = self
                        .stack
                        .len()
                        .checked_sub(arg_count)
                        .ok_or(InternalError::StackUnderflow)?;
                    let args: Vec<Value> = self.stack[start..].to_vec();
                    let result = native(self, &args);
                    if matches!(result, Value::None) {
                        return Err(InterpretError::Runtime);
                    }
                    self.stack.truncate(start - 1);
                    return self.push(result);
                }
                Kind::Other => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    /// Calls a native from a method table; `args[0]` is the receiver.
    fn call_native_method(
        &mut self,
        native: NativeFn,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let start = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::StackUnderflow)?;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let result = native(self, &args);
        if matches!(result, Value::None) {
            return Err(InterpretError::Runtime);
        }
        self.stack.truncate(start);
        self.push(result)
    }

    /// Calls a script-defined entry of a native method table: the receiver
    /// is duplicated to become the closure's first parameter.
    fn call_table_closure(
        &mut self,
        closure: ObjRef,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let pos = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::StackUnderflow)?;
        let receiver = self.stack[pos];
        self.stack.insert(pos, receiver);
        self.call(closure, arg_count + 1)
    }

    fn invoke_from_table(
        &mut self,
        table: NativeTable,
        name: ObjRef,
        arg_count: usize,
        what: &str,
    ) -> Result<(), InterpretError> {
        let entry = self.table_mut(table).get(&name).copied();
        match entry {
            Some(Value::Obj(r)) => match self.heap.get(r) {
                Object::Native(native) => {
                    let native = *native;
                    self.call_native_method(native, arg_count)
                }
                Object::Closure(_) => self.call_table_closure(r, arg_count),
                _ => Err(InternalError::WrongObject.into()),
            },
            _ => {
                let name = self.show_string(name);
                Err(self.runtime_error(&format!(
                    "Undefined method '{}' from {} objects.",
                    name, what
                )))
            }
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count)?;

        if let Value::Number(_) = receiver {
            return self.invoke_from_table(NativeTable::Numbers, name, arg_count, "number");
        }
        if let Value::Obj(r) = receiver {
            enum Kind {
                List,
                String,
                Instance,
                Library,
                Other,
            }
            let kind = match self.heap.get(r) {
                Object::List(_) => Kind::List,
                Object::String(_) => Kind::String,
                Object::Instance(_) => Kind::Instance,
                Object::Library(_) => Kind::Library,
                _ => Kind::Other,
            };
            match kind {
                Kind::List => {
                    return self.invoke_from_table(NativeTable::Lists, name, arg_count, "list")
                }
                Kind::String => {
                    return self.invoke_from_table(NativeTable::Strings, name, arg_count, "string")
                }
                Kind::Instance => return self.invoke_instance(r, name, arg_count),
                Kind::Library => return self.invoke_library(r, name, arg_count),
                Kind::Other => {}
            }
        }
        let typ = self.heap.type_of(receiver);
        Err(self.runtime_error(&format!("Type '{}' can not have methods.", typ)))
    }

    fn invoke_instance(
        &mut self,
        instance: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let (class, field, private_hit, class_name) = match self.heap.get(instance) {
            Object::Instance(inst) => {
                let (private_hit, class_name) = match self.heap.get(inst.class) {
                    Object::Class(class) => {
                        (class.private_methods.contains_key(&name), class.name)
                    }
                    _ => (false, None),
                };
                (
                    inst.class,
                    inst.fields.get(&name).copied(),
                    private_hit,
                    class_name,
                )
            }
            _ => return Err(InternalError::WrongObject.into()),
        };

        if private_hit {
            let name = self.show_string(name);
            let class_name = self.show_optional(class_name);
            return Err(self.runtime_error(&format!(
                "Can't access private property '{}' from '{}'.",
                name, class_name
            )));
        }

        if let Some(value) = field {
            let slot = self
                .stack
                .len()
                .checked_sub(arg_count + 1)
                .ok_or(InternalError::StackUnderflow)?;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }

        let method = match self.heap.get(class) {
            Object::Class(c) => c.methods.get(&name).copied(),
            _ => None,
        };
        match method {
            Some(Value::Obj(closure)) => self.call(closure, arg_count),
            _ => {
                let name = self.show_string(name);
                let class_name = self.show_optional(class_name);
                Err(self.runtime_error(&format!(
                    "Undefined property '{}' from '{}'.",
                    name, class_name
                )))
            }
        }
    }

    fn invoke_library(
        &mut self,
        library: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let (value, library_name) = match self.heap.get(library) {
            Object::Library(lib) => (lib.values.get(&name).copied(), lib.name),
            _ => return Err(InternalError::WrongObject.into()),
        };
        match value {
            Some(value) => self.call_value(value, arg_count),
            None => {
                let name = self.show_string(name);
                let library_name = self.show_string(library_name);
                Err(self.runtime_error(&format!(
                    "Undefined method '{}' from '{}'.",
                    name, library_name
                )))
            }
        }
    }

    fn invoke_private(&mut self, name: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count)?;
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
            _ => {
                let typ = self.heap.type_of(receiver);
                return Err(
                    self.runtime_error(&format!("Type '{}' can not have methods.", typ))
                );
            }
        };
        let (method, class_name) = match self.heap.get(instance) {
            Object::Instance(inst) => match self.heap.get(inst.class) {
                Object::Class(class) => (
                    class
                        .private_methods
                        .get(&name)
                        .or_else(|| class.methods.get(&name))
                        .copied(),
                    class.name,
                ),
                _ => (None, None),
            },
            _ => (None, None),
        };
        match method {
            Some(Value::Obj(closure)) => self.call(closure, arg_count),
            _ => {
                let name = self.show_string(name);
                let class_name = self.show_optional(class_name);
                Err(self.runtime_error(&format!(
                    "Undefined method '{}' from '{}'.",
                    name, class_name
                )))
            }
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), InterpretError> {
        let (method, class_name) = match self.heap.get(class) {
            Object::Class(c) => (c.methods.get(&name).copied(), c.name),
            _ => return Err(InternalError::WrongObject.into()),
        };
        match method {
            Some(Value::Obj(closure)) => {
                let receiver = self.peek(0)?;
                let bound = self.heap.alloc(Object::BoundMethod(BoundMethod {
                    receiver,
                    method: closure,
                }));
                self.pop()?;
                self.push(Value::Obj(bound))
            }
            _ => {
                let name = self.show_string(name);
                let class_name = self.show_optional(class_name);
                Err(self.runtime_error(&format!(
                    "Undefined property '{}' from '{}'.",
                    name, class_name
                )))
            }
        }
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let Object::Upvalue(Upvalue::Open(existing)) = self.heap.get(r) {
                if *existing == slot {
                    return r;
                }
            }
        }
        let created = self.heap.alloc(Object::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.push(created);
        created
    }

    fn close_upvalues(&mut self, last: usize) {
        let mut kept = Vec::with_capacity(self.open_upvalues.len());
        for r in std::mem::take(&mut self.open_upvalues) {
            let slot = match self.heap.get(r) {
                Object::Upvalue(Upvalue::Open(slot)) => *slot,
                _ => continue,
            };
            if slot >= last {
                let value = self.stack.get(slot).copied().unwrap_or(Value::None);
                *self.heap.get_mut(r) = Object::Upvalue(Upvalue::Closed(value));
            } else {
                kept.push(r);
            }
        }
        self.open_upvalues = kept;
    }

    // ---- dispatch plumbing ----

    fn frame(&self) -> Result<&CallFrame, InternalError> {
        self.frames.last().ok_or(InternalError::NoFrame)
    }

    fn read_byte(&mut self) -> Result<u8, InternalError> {
        let frame = self.frames.last_mut().ok_or(InternalError::NoFrame)?;
        let byte = *frame
            .chunk
            .code
            .get(frame.ip)
            .ok_or(InternalError::BadOperand)?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> Result<u16, InternalError> {
        let high = self.read_byte()? as u16;
        let low = self.read_byte()? as u16;
        Ok(high << 8 | low)
    }

    fn read_constant(&mut self) -> Result<Value, InternalError> {
        let index = self.read_byte()? as usize;
        let frame = self.frames.last().ok_or(InternalError::NoFrame)?;
        frame
            .chunk
            .constants
            .get(index)
            .copied()
            .ok_or(InternalError::BadOperand)
    }

    fn read_string_constant(&mut self) -> Result<ObjRef, InternalError> {
        match self.read_constant()? {
            Value::Obj(r) => Ok(r),
            _ => Err(InternalError::BadOperand),
        }
    }

    fn show_string(&self, r: ObjRef) -> String {
        self.heap
            .as_string(r)
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    fn show_optional(&self, r: Option<ObjRef>) -> String {
        r.map(|r| self.show_string(r)).unwrap_or_default()
    }

    fn binary_numbers(&mut self) -> Result<(f64, f64), InterpretError> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop()?;
                Ok((a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // i64 shifts by 64 or more are undefined; reject them before the operator.
    fn shift_amount(&mut self, b: f64) -> Result<u32, InterpretError> {
        let amount = b as i64;
        if !(0..64).contains(&amount) {
            return Err(self.runtime_error("Shift amount must be between 0 and 63."));
        }
        Ok(amount as u32)
    }

    fn concatenate(&mut self) -> Result<(), InterpretError> {
        let b = self.peek(0)?.as_obj().ok_or(InternalError::WrongObject)?;
        let a = self.peek(1)?.as_obj().ok_or(InternalError::WrongObject)?;
        let joined = match (self.heap.as_string(a), self.heap.as_string(b)) {
            (Some(a), Some(b)) => format!("{}{}", a, b),
            _ => return Err(InternalError::WrongObject.into()),
        };
        let result = self.heap.intern(&joined);
        self.pop()?;
        self.pop()?;
        self.push(Value::Obj(result))
    }

    // ---- the interpreter loop ----

    fn run(&mut self) -> Result<(), InterpretError> {
        macro_rules! binary_op {
            ($wrap:expr, $op:tt) => {{
                let (a, b) = self.binary_numbers()?;
                self.set_top($wrap(a $op b))?;
            }};
        }
        macro_rules! binary_int_op {
            ($op:tt) => {{
                let (a, b) = self.binary_numbers()?;
                self.set_top(Value::Number(((a as i64) $op (b as i64)) as f64))?;
            }};
        }

        loop {
            #[cfg(feature = "trace")]
            {
                let mut shown = String::from("          ");
                for value in &self.stack {
                    shown.push_str(&format!("[ {} ]", self.heap.show_value(*value)));
                }
                println!("{}", shown);
                if let Ok(frame) = self.frame() {
                    frame.chunk.disassemble_instruction(frame.ip, &self.heap);
                }
            }

            self.maybe_collect();

            let byte = self.read_byte()?;
            let op = OpCode::from_byte(byte).ok_or(InternalError::UnknownOpcode(byte))?;
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant)?;
                }
                OpCode::None => self.push(Value::None)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.base;
                    let value = self
                        .stack
                        .get(base + slot)
                        .copied()
                        .ok_or(InternalError::StackUnderflow)?;
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.base;
                    let value = self.peek(0)?;
                    *self
                        .stack
                        .get_mut(base + slot)
                        .ok_or(InternalError::StackUnderflow)? = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value)?,
                        None => {
                            let name = self.show_string(name);
                            return Err(
                                self.runtime_error(&format!("Undefined variable '{}'.", name))
                            );
                        }
                    }
                }
                OpCode::GetLibrary => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = match self.heap.get(library) {
                        Object::Library(lib) => lib.values.get(&name).copied(),
                        _ => None,
                    };
                    match value {
                        Some(value) => self.push(value)?,
                        None => {
                            let name = self.show_string(name);
                            return Err(
                                self.runtime_error(&format!("Undefined variable '{}'.", name))
                            );
                        }
                    }
                }
                OpCode::SetLibrary => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = self.peek(0)?;
                    let was_defined = match self.heap.get_mut(library) {
                        Object::Library(lib) => {
                            if lib.values.insert(name, value).is_none() {
                                lib.values.remove(&name);
                                false
                            } else {
                                true
                            }
                        }
                        _ => return Err(InternalError::WrongObject.into()),
                    };
                    if !was_defined {
                        let name = self.show_string(name);
                        return Err(
                            self.runtime_error(&format!("Undefined variable '{}'.", name))
                        );
                    }
                }
                OpCode::DefineLibrary => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = self.peek(0)?;
                    if let Object::Library(lib) = self.heap.get_mut(library) {
                        lib.values.insert(name, value);
                    }
                    self.pop()?;
                }
                OpCode::PrivateDefine => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = self.peek(0)?;
                    if let Object::Library(lib) = self.heap.get_mut(library) {
                        lib.private_values.insert(name, value);
                    }
                    self.pop()?;
                }
                OpCode::PrivateGet => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = match self.heap.get(library) {
                        Object::Library(lib) => lib
                            .private_values
                            .get(&name)
                            .copied()
                            .unwrap_or(Value::None),
                        _ => Value::None,
                    };
                    self.push(value)?;
                }
                OpCode::PrivateSet => {
                    let name = self.read_string_constant()?;
                    let library = self.frame()?.library;
                    let value = self.peek(0)?;
                    if let Object::Library(lib) = self.heap.get_mut(library) {
                        lib.private_values.insert(name, value);
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let closure = self.frame()?.closure;
                    let cell = match self.heap.get(closure) {
                        Object::Closure(c) => c
                            .upvalues
                            .get(slot)
                            .copied()
                            .ok_or(InternalError::BadOperand)?,
                        _ => return Err(InternalError::WrongObject.into()),
                    };
                    let value = match self.heap.get(cell) {
                        Object::Upvalue(Upvalue::Open(slot)) => {
                            self.stack.get(*slot).copied().unwrap_or(Value::None)
                        }
                        Object::Upvalue(Upvalue::Closed(value)) => *value,
                        _ => return Err(InternalError::WrongObject.into()),
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let closure = self.frame()?.closure;
                    let cell = match self.heap.get(closure) {
                        Object::Closure(c) => c
                            .upvalues
                            .get(slot)
                            .copied()
                            .ok_or(InternalError::BadOperand)?,
                        _ => return Err(InternalError::WrongObject.into()),
                    };
                    let value = self.peek(0)?;
                    match self.heap.get_mut(cell) {
                        Object::Upvalue(cell) => match cell {
                            Upvalue::Open(slot) => {
                                let slot = *slot;
                                *self
                                    .stack
                                    .get_mut(slot)
                                    .ok_or(InternalError::StackUnderflow)? = value;
                            }
                            Upvalue::Closed(closed) => *closed = value,
                        },
                        _ => return Err(InternalError::WrongObject.into()),
                    }
                }

                OpCode::GetProperty => self.get_property()?,
                OpCode::GetPropertyNoPop => self.get_property_no_pop()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::PrivatePropertyGet => self.private_property_get(true)?,
                OpCode::PrivateGetPropertyNoPop => self.private_property_get(false)?,
                OpCode::PrivatePropertySet => self.private_property_set()?,

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.peek(0)?;
                    let equal = self.heap.values_equal(a, b);
                    self.set_top(Value::Bool(equal))?;
                }
                OpCode::Greater => binary_op!(Value::Bool, >),
                OpCode::Less => binary_op!(Value::Bool, <),
                OpCode::Add => {
                    let b = self.peek(0)?;
                    let a = self.peek(1)?;
                    let both_strings = matches!(
                        (
                            a.as_obj().map(|r| self.heap.get(r)),
                            b.as_obj().map(|r| self.heap.get(r))
                        ),
                        (Some(Object::String(_)), Some(Object::String(_)))
                    );
                    if both_strings {
                        self.concatenate()?;
                    } else if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
                        self.pop()?;
                        self.set_top(Value::Number(a + b))?;
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be either two numbers or two strings.",
                        ));
                    }
                }
                OpCode::Subtract => binary_op!(Value::Number, -),
                OpCode::Multiply => binary_op!(Value::Number, *),
                OpCode::Divide => {
                    let (a, b) = self.binary_numbers()?;
                    if b == 0.0 {
                        return Err(self.runtime_error("Can not divide by 0."));
                    }
                    self.set_top(Value::Number(a / b))?;
                }
                OpCode::Modulo => {
                    let (a, b) = self.binary_numbers()?;
                    self.set_top(Value::Number(a % b))?;
                }
                OpCode::Power => {
                    let (a, b) = self.binary_numbers()?;
                    self.set_top(Value::Number(a.powf(b)))?;
                }
                OpCode::BitAnd => binary_int_op!(&),
                OpCode::BitOr => binary_int_op!(|),
                OpCode::BitXor => binary_int_op!(^),
                OpCode::ShiftLeft => {
                    let (a, b) = self.binary_numbers()?;
                    let amount = self.shift_amount(b)?;
                    self.set_top(Value::Number(((a as i64) << amount) as f64))?;
                }
                OpCode::ShiftRight => {
                    let (a, b) = self.binary_numbers()?;
                    let amount = self.shift_amount(b)?;
                    self.set_top(Value::Number(((a as i64) >> amount) as f64))?;
                }
                OpCode::Not => {
                    let falsey = self.peek(0)?.is_falsey();
                    self.set_top(Value::Bool(falsey))?;
                }
                OpCode::Negate => match self.peek(0)?.as_number() {
                    Some(n) => self.set_top(Value::Number(-n))?,
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Increment => match self.peek(0)?.as_number() {
                    Some(n) => self.set_top(Value::Number(n + 1.0))?,
                    None => return Err(self.runtime_error("Operand must be number.")),
                },
                OpCode::Decrement => match self.peek(0)?.as_number() {
                    Some(n) => self.set_top(Value::Number(n - 1.0))?,
                    None => return Err(self.runtime_error("Operand must be number.")),
                },
                OpCode::Assert => {
                    let condition = self.pop()?;
                    let message = self.read_string_constant()?;
                    if condition.is_falsey() {
                        let message = self.show_string(message);
                        return Err(
                            self.runtime_error(&format!("Assertion Failed: {}", message))
                        );
                    }
                }

                OpCode::Jump => {
                    let offset = self.read_short()? as usize;
                    self.frames.last_mut().ok_or(InternalError::NoFrame)?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short()? as usize;
                    if self.peek(0)?.is_falsey() {
                        self.frames.last_mut().ok_or(InternalError::NoFrame)?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short()? as usize;
                    self.frames.last_mut().ok_or(InternalError::NoFrame)?.ip -= offset;
                }
                // placeholder the compiler rewrites into Jump; skip the
                // operand bytes if one ever survives
                OpCode::Break => {
                    self.read_short()?;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::TailCall => {
                    let arg_count = self.read_byte()? as usize;
                    let window_start = self
                        .stack
                        .len()
                        .checked_sub(arg_count + 1)
                        .ok_or(InternalError::StackUnderflow)?;
                    let base = self.frame()?.base;
                    self.close_upvalues(base);
                    let window: Vec<Value> = self.stack.drain(window_start..).collect();
                    self.stack.truncate(base);
                    for value in window {
                        self.push(value)?;
                    }
                    let callee = self.peek(arg_count)?;
                    match callee.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Closure(_)) => {
                            self.keep_frame(r, arg_count)?;
                        }
                        // not a frame-reusable callee; the pending Return in
                        // the old function cleans up after the call
                        _ => self.call_value(callee, arg_count)?,
                    }
                }
                OpCode::Invoke => {
                    let arg_count = self.read_byte()? as usize;
                    let name = self.read_string_constant()?;
                    self.invoke(name, arg_count)?;
                }
                OpCode::InvokePrivate => {
                    let arg_count = self.read_byte()? as usize;
                    let name = self.read_string_constant()?;
                    self.invoke_private(name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_string_constant()?;
                    let upvalue_count = match self.heap.get(function) {
                        Object::Function(f) => f.upvalue_count,
                        _ => return Err(InternalError::WrongObject.into()),
                    };
                    let closure = self.heap.alloc(Object::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure))?;
                    let enclosing = self.frame()?.closure;
                    let base = self.frame()?.base;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? != 0;
                        let index = self.read_byte()? as usize;
                        let cell = if is_local {
                            self.capture_upvalue(base + index)
                        } else {
                            match self.heap.get(enclosing) {
                                Object::Closure(c) => c
                                    .upvalues
                                    .get(index)
                                    .copied()
                                    .ok_or(InternalError::BadOperand)?,
                                _ => return Err(InternalError::WrongObject.into()),
                            }
                        };
                        if let Object::Closure(c) = self.heap.get_mut(closure) {
                            c.upvalues.push(cell);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or(InternalError::StackUnderflow)?;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let base = self.frame()?.base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop()?;
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result)?;
                }

                OpCode::Class => {
                    let name = self.read_string_constant()?;
                    let class = self.heap.alloc(Object::Class(Class {
                        name: Some(name),
                        methods: Table::new(),
                        private_methods: Table::new(),
                    }));
                    self.push(Value::Obj(class))?;
                }
                OpCode::Method => self.define_method(false)?,
                OpCode::PrivateMethod => self.define_method(true)?,

                OpCode::BuildList => {
                    let count = self.read_byte()? as usize;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count)
                        .ok_or(InternalError::StackUnderflow)?;
                    let items = self.stack[start..].to_vec();
                    let list = self.heap.alloc(Object::List(items));
                    self.stack.truncate(start);
                    self.push(Value::Obj(list))?;
                }
                OpCode::IndexSubscript => self.index_subscript()?,
                OpCode::IndexSubscriptNoPop => self.index_subscript_no_pop()?,
                OpCode::StoreSubscript => self.store_subscript()?,

                OpCode::Use => self.use_module()?,
                OpCode::UseBuiltin => {
                    let index = self.read_byte()?;
                    let name = self.read_string_constant()?;
                    match self.libraries.get(&name).copied() {
                        Some(value) => self.push(value)?,
                        None => {
                            let library = crate::library::import_library(self, index)?;
                            self.push(Value::Obj(library))?;
                        }
                    }
                }
                OpCode::UseName => {
                    let recent = self.recent_library;
                    match recent {
                        Some(library) => self.push(Value::Obj(library))?,
                        None => self.push(Value::None)?,
                    }
                }
                OpCode::RecentUse => {
                    self.recent_library = Some(self.frame()?.library);
                }
            }
        }
    }

    // ---- multi-step opcode bodies ----

    fn get_property(&mut self) -> Result<(), InterpretError> {
        let name = self.read_string_constant()?;
        let receiver = self.peek(0)?;
        let r = match receiver.as_obj() {
            Some(r) => r,
            None => {
                let typ = self.heap.type_of(receiver);
                return Err(
                    self.runtime_error(&format!("Type '{}' can not have properties", typ))
                );
            }
        };
        enum Kind {
            Instance(Option<Value>, ObjRef),
            Library(Option<Value>, ObjRef),
            Other,
        }
        let kind = match self.heap.get(r) {
            Object::Instance(inst) => Kind::Instance(inst.fields.get(&name).copied(), inst.class),
            Object::Library(lib) => Kind::Library(lib.values.get(&name).copied(), lib.name),
            _ => Kind::Other,
        };
        match kind {
            Kind::Instance(Some(value), _) => {
                self.pop()?;
                self.push(value)
            }
            Kind::Instance(None, class) => self.bind_method(class, name),
            Kind::Library(Some(value), _) => {
                self.pop()?;
                self.push(value)
            }
            Kind::Library(None, library_name) => {
                let name = self.show_string(name);
                let library_name = self.show_string(library_name);
                Err(self.runtime_error(&format!(
                    "Undefined property '{}' from '{}'",
                    name, library_name
                )))
            }
            Kind::Other => {
                let typ = self.heap.type_of(receiver);
                Err(self.runtime_error(&format!("Type '{}' has no properties.", typ)))
            }
        }
    }

    fn get_property_no_pop(&mut self) -> Result<(), InterpretError> {
        let receiver = self.peek(0)?;
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
            _ => {
                self.read_byte()?;
                return Err(self.runtime_error("Only instances can have properties."));
            }
        };
        let name = self.read_string_constant()?;
        let (field, class) = match self.heap.get(instance) {
            Object::Instance(inst) => (inst.fields.get(&name).copied(), inst.class),
            _ => return Err(InternalError::WrongObject.into()),
        };
        match field {
            Some(value) => self.push(value),
            None => self.bind_method(class, name),
        }
    }

    fn set_property(&mut self) -> Result<(), InterpretError> {
        let name = self.read_string_constant()?;
        let receiver = self.peek(1)?;
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
            Some(_) => {
                let typ = self.heap.type_of(receiver);
                return Err(self.runtime_error(&format!("Type '{}' has no properties.", typ)));
            }
            None => {
                let typ = self.heap.type_of(receiver);
                return Err(self.runtime_error(&format!("Type '{}' can not have fields", typ)));
            }
        };
        let value = self.peek(0)?;
        if let Object::Instance(inst) = self.heap.get_mut(instance) {
            inst.fields.insert(name, value);
        }
        let value = self.pop()?;
        self.pop()?;
        self.push(value)
    }

    // `pops` distinguishes PrivatePropertyGet from its NoPop variant.
    fn private_property_get(&mut self, pops: bool) -> Result<(), InterpretError> {
        let receiver = self.peek(0)?;
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
            _ => {
                self.read_byte()?;
                return Err(self.runtime_error("Only instances can have private properties."));
            }
        };
        let name = self.read_string_constant()?;
        let (field, class) = match self.heap.get(instance) {
            Object::Instance(inst) => (inst.private_fields.get(&name).copied(), inst.class),
            _ => return Err(InternalError::WrongObject.into()),
        };
        match field {
            Some(value) => {
                if pops {
                    self.pop()?;
                }
                self.push(value)
            }
            None => self.bind_method(class, name),
        }
    }

    fn private_property_set(&mut self) -> Result<(), InterpretError> {
        let name = self.read_string_constant()?;
        let receiver = self.peek(1)?;
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
            _ => {
                let typ = self.heap.type_of(receiver);
                return Err(
                    self.runtime_error(&format!("Type '{}' has no private properties.", typ))
                );
            }
        };
        let value = self.peek(0)?;
        if let Object::Instance(inst) = self.heap.get_mut(instance) {
            inst.private_fields.insert(name, value);
        }
        let value = self.pop()?;
        self.pop()?;
        self.push(value)
    }

    fn index_subscript(&mut self) -> Result<(), InterpretError> {
        let index = self.pop()?;
        let target = self.pop()?;
        let r = match target.as_obj() {
            Some(r) => r,
            None => {
                let typ = self.heap.type_of(target);
                return Err(self.runtime_error(&format!(
                    "Type '{}' does not allow for subscripting.",
                    typ
                )));
            }
        };
        let index = match index.as_number() {
            Some(n) => n,
            None => return Err(self.runtime_error("Index must be a number.")),
        };
        enum Kind {
            List(Option<Value>),
            String(Option<String>),
            Other,
        }
        let kind = match self.heap.get(r) {
            Object::List(items) => {
                Kind::List(normalize_index(index, items.len()).map(|i| items[i]))
            }
            Object::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                Kind::String(normalize_index(index, chars.len()).map(|i| chars[i].to_string()))
            }
            _ => Kind::Other,
        };
        match kind {
            Kind::List(Some(value)) => self.push(value),
            Kind::List(None) => Err(self.runtime_error("List index out of range.")),
            Kind::String(Some(one)) => {
                let s = self.heap.intern(&one);
                self.push(Value::Obj(s))
            }
            Kind::String(None) => Err(self.runtime_error("String index out of range.")),
            Kind::Other => {
                let typ = self.heap.type_of(target);
                Err(self.runtime_error(&format!("Type '{}' not subscriptable.", typ)))
            }
        }
    }

    fn index_subscript_no_pop(&mut self) -> Result<(), InterpretError> {
        let index = self.peek(0)?;
        let target = self.peek(1)?;
        let r = match target.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::List(_)) => r,
            _ => {
                let typ = self.heap.type_of(target);
                return Err(self.runtime_error(&format!(
                    "Type '{}' does not allow for subscripting.",
                    typ
                )));
            }
        };
        let index = match index.as_number() {
            Some(n) => n,
            None => return Err(self.runtime_error("Index must be a number.")),
        };
        let value = match self.heap.get(r) {
            Object::List(items) => normalize_index(index, items.len()).map(|i| items[i]),
            _ => None,
        };
        match value {
            Some(value) => self.push(value),
            None => Err(self.runtime_error("List index out of range.")),
        }
    }

    fn store_subscript(&mut self) -> Result<(), InterpretError> {
        let item = self.pop()?;
        let index = self.pop()?;
        let target = self.pop()?;
        let r = match target.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::List(_)) => r,
            _ => return Err(self.runtime_error("Can not store value in a non-list.")),
        };
        let index = match index.as_number() {
            Some(n) => n,
            None => return Err(self.runtime_error("List index must be a number.")),
        };
        let stored = match self.heap.get_mut(r) {
            Object::List(items) => {
                let len = items.len();
                match normalize_index(index, len) {
                    Some(i) => {
                        items[i] = item;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };
        if !stored {
            return Err(self.runtime_error("Index out of range"));
        }
        self.push(item)
    }

    fn define_method(&mut self, private: bool) -> Result<(), InterpretError> {
        let name = self.read_string_constant()?;
        let method = self.peek(0)?;
        let class = match self.peek(1)?.as_obj() {
            Some(r) => r,
            None => return Err(InternalError::WrongObject.into()),
        };
        match self.heap.get_mut(class) {
            Object::Class(c) => {
                if private {
                    c.private_methods.insert(name, method);
                } else {
                    c.methods.insert(name, method);
                }
            }
            _ => return Err(InternalError::WrongObject.into()),
        }
        self.pop()?;
        Ok(())
    }

    fn use_module(&mut self) -> Result<(), InterpretError> {
        let name = self.read_string_constant()?;
        if let Some(&cached) = self.libraries.get(&name) {
            if let Value::Obj(library) = cached {
                self.recent_library = Some(library);
            }
            return self.push(Value::None);
        }

        let path = self.show_string(name);
        let source = match (self.resolver)(&path) {
            Some(source) => source,
            None => {
                return Err(self.runtime_error(&format!("Could not load \"{}\"", path)));
            }
        };

        let library = self.new_library(name);
        self.recent_library = Some(library);
        // root the library across compilation
        self.push(Value::Obj(library))?;
        let function = match compiler::compile(&source, library, &mut self.heap, &self.globals) {
            Ok(function) => function,
            Err(error) => {
                self.pop()?;
                return Err(error.into());
            }
        };
        self.pop()?;

        let closure = self.heap.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure))?;
        self.call(closure, 0)
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("stack", &self.stack)
            .field("frames", &self.frames.len())
            .field("live_objects", &self.heap.live_objects())
            .finish_non_exhaustive()
    }
}

// Negative indexes count from the back, one wrap only.
fn normalize_index(index: f64, len: usize) -> Option<usize> {
    let len = len as i64;
    let mut index = index as i64;
    if index < 0 {
        index += len;
    }
    if index >= 0 && index < len {
        Some(index as usize)
    } else {
        None
    }
}

fn default_resolver(path: &str) -> Option<String> {
    if let Ok(source) = std::fs::read_to_string(path) {
        return Some(source);
    }
    std::fs::read_to_string(format!("{}.ql", path)).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(source: &str) -> Result<(), InterpretError> {
        let mut vm = Vm::new();
        vm.interpret(source, "test")
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert!(run("assert 1 + 2 * 3 == 7;").is_ok());
        assert!(run("assert 2 ** 3 == 8;").is_ok());
        assert!(run("assert 7 % 3 == 1;").is_ok());
        assert!(run("assert (1 + 2) * 3 == 9;").is_ok());
        assert!(run("assert (6 | 1) == 7; assert (6 & 3) == 2; assert (1 << 3) == 8;").is_ok());
    }

    #[test]
    fn library_bindings_persist_across_interprets() {
        let mut vm = Vm::new();
        assert!(vm.interpret("let keep = 1;", "session").is_ok());
        assert!(vm
            .interpret("assert keep == 1; keep = keep + 1;", "session")
            .is_ok());
        assert!(vm.interpret("assert keep == 2;", "session").is_ok());
        // a different library name starts from a clean slate
        assert!(matches!(
            vm.interpret("assert keep == 2;", "other"),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn shift_amounts_stay_in_range() {
        assert!(run("assert (1 << 10) == 1024; assert (1024 >> 10) == 1;").is_ok());
        assert!(matches!(
            run("let x = 1 << 64;"),
            Err(InterpretError::Runtime)
        ));
        assert!(matches!(
            run("let x = 1 << -1;"),
            Err(InterpretError::Runtime)
        ));
        assert!(matches!(
            run("let x = 8 >> 100;"),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        assert!(matches!(run("let x = 1 / 0;"), Err(InterpretError::Runtime)));
        assert!(run("assert 0 / 5 == 0;").is_ok());
    }

    #[test]
    fn string_concatenation() {
        assert!(run(r#"assert "foo" + "bar" == "foobar";"#).is_ok());
        assert!(matches!(
            run(r#"let x = "a" + 1;"#),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn lists_index_from_both_ends() {
        assert!(run("let l = [1, 2, 3]; assert l[0] == 1; assert l[-1] == 3;").is_ok());
        assert!(matches!(
            run("let l = [1]; let x = l[3];"),
            Err(InterpretError::Runtime)
        ));
        assert!(run("let l = [1, 2]; l[0] = 5; assert l[0] == 5;").is_ok());
    }

    #[test]
    fn closures_share_one_cell() {
        let source = "
            define pair() {
                let n = 0;
                let bump = lambda () -> n = n + 1;
                let read = lambda () -> n;
                return [bump, read];
            }
            let p = pair();
            p[0]();
            p[0]();
            assert p[1]() == 2;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn tail_calls_run_at_constant_depth() {
        let source = "
            define countdown(n) {
                if n == 0 { return 0; }
                return countdown(n - 1);
            }
            assert countdown(10000) == 0;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn deep_non_tail_recursion_overflows() {
        let source = "
            define sum(n) {
                if n == 0 { return 0; }
                return n + sum(n - 1);
            }
            let x = sum(10000);
        ";
        assert!(matches!(run(source), Err(InterpretError::Runtime)));
    }

    #[test]
    fn classes_fields_and_methods() {
        let source = "
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
                sum() {
                    return this.x + this.y;
                }
            }
            let p = Point(1, 2);
            assert p.sum() == 3;
            p.x = 10;
            assert p.sum() == 12;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn private_members_are_sealed_from_outside() {
        let hidden_method = "
            class Vault {
                private open() { return 1; }
            }
            let v = Vault();
            v.open();
        ";
        assert!(matches!(run(hidden_method), Err(InterpretError::Runtime)));

        let through_this = "
            class Vault {
                init() {
                    private code = 7;
                }
                peek() { return this.code; }
            }
            assert Vault().peek() == 7;
        ";
        assert!(run(through_this).is_ok());
    }

    #[test]
    fn modules_load_through_the_resolver() {
        let mut vm = Vm::new();
        vm.set_resolver(Box::new(|path| {
            if path == "shapes" {
                Some("let sides = 4;".to_string())
            } else {
                None
            }
        }));
        let source = r#"
            use "shapes" for shapes;
            assert shapes.sides == 4;
            assert shapes.__name__ == "shapes";
        "#;
        assert!(vm.interpret(source, "main").is_ok());

        let mut vm = Vm::new();
        assert!(matches!(
            vm.interpret(r#"use "missing";"#, "main"),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn module_privates_stay_private() {
        let mut vm = Vm::new();
        vm.set_resolver(Box::new(|_| Some("private let hidden = 9;".to_string())));
        let source = r#"
            use "secrets" for s;
            let x = s.hidden;
        "#;
        assert!(matches!(
            vm.interpret(source, "main"),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn collection_keeps_reachable_objects() {
        let mut vm = Vm::new();
        let source = "
            let keep = [1, 2, 3];
            for let i = 0; i < 100; i = i + 1 {
                let garbage = [i, [i], \"tmp\" + \"x\"];
            }
            assert keep.length() == 3;
        ";
        assert!(vm.interpret(source, "test").is_ok());
        let before = vm.heap.live_objects();
        vm.collect_now();
        let after = vm.heap.live_objects();
        assert!(after <= before);
        assert!(vm.interpret("assert keep[2] == 3;", "test").is_ok());
    }

    #[test]
    fn global_natives_resolve_everywhere() {
        assert!(run(r#"assert type(1) == "number";"#).is_ok());
        assert!(run(r#"assert type("s") == "string";"#).is_ok());
        assert!(run(r#"assert type(type) == "native";"#).is_ok());
    }
}
