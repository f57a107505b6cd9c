use crate::heap::{Heap, Object};
use crate::value::Value;

/// One bytecode instruction, as stored in a [`Chunk`]'s byte buffer.
///
/// Operands follow the opcode byte in the code stream. Jump offsets are
/// unsigned 16-bit big-endian and relative to the byte after the operand;
/// `Closure` is variable-length, trailing one `(is_local, index)` byte pair
/// per upvalue of the loaded function.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and literals.
    /// Push constants[operand].
    Constant,
    /// Push `none`.
    None,
    /// Push `true`.
    True,
    /// Push `false`.
    False,
    /// Pop and discard the top of the stack.
    Pop,

    // Variables.
    /// Push the frame-relative slot named by the operand.
    GetLocal,
    /// Store the top of the stack into a frame-relative slot (no pop).
    SetLocal,
    /// Push a global native binding; read-only, checked at compile time.
    GetGlobal,
    /// Push the value of the named binding of the enclosing library.
    GetLibrary,
    /// Assign an existing named binding of the enclosing library.
    SetLibrary,
    /// Pop the top of the stack into a new library binding.
    DefineLibrary,
    /// Pop the top of the stack into a new private library binding.
    PrivateDefine,
    /// Push a private library binding.
    PrivateGet,
    /// Assign a private library binding (no pop).
    PrivateSet,
    /// Push the upvalue cell's current value.
    GetUpvalue,
    /// Store the top of the stack through an upvalue cell (no pop).
    SetUpvalue,

    // Properties.
    /// Pop a receiver, push its named field or bound method.
    GetProperty,
    /// Like GetProperty but keeps the receiver below the result.
    GetPropertyNoPop,
    /// Stack is receiver, value: store the named field, leave the value.
    SetProperty,
    /// Pop an instance, push a private field (falls back to bound method).
    PrivatePropertyGet,
    /// Like PrivatePropertyGet but keeps the receiver.
    PrivateGetPropertyNoPop,
    /// Store a private field, leaving the assigned value on the stack.
    PrivatePropertySet,

    // Arithmetic, comparison, logic.
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    Not,
    Negate,
    /// Replace the numeric top of the stack with itself plus one.
    Increment,
    /// Replace the numeric top of the stack with itself minus one.
    Decrement,
    /// Pop a condition; if falsey, fail with the message in constants[operand].
    Assert,

    // Control flow.
    /// Unconditional forward jump.
    Jump,
    /// Forward jump if the top of the stack is falsey (no pop).
    JumpIfFalse,
    /// Unconditional backward jump.
    Loop,
    /// Placeholder emitted for `break`; rewritten to Jump once the
    /// enclosing loop's extent is known.
    Break,

    // Calls and closures.
    /// Call the value below the operand-count arguments.
    Call,
    /// Like Call for a closure callee, but reuse the current frame window.
    TailCall,
    /// Call a named method on the receiver below the arguments.
    Invoke,
    /// Like Invoke, but search the class's private methods first.
    InvokePrivate,
    /// Wrap constants[operand] (a function) in a closure, capturing upvalues.
    Closure,
    /// Close the upvalue for the top stack slot, then pop it.
    CloseUpvalue,
    /// Pop the return value, close the frame's upvalues, pop the frame.
    Return,

    // Classes.
    /// Push a new class named by constants[operand].
    Class,
    /// Pop a method closure into the class below it.
    Method,
    /// Pop a method closure into the private table of the class below it.
    PrivateMethod,

    // Lists and subscripts.
    /// Pop the operand-count elements into a new list, push it.
    BuildList,
    /// Pop index and target, push target[index].
    IndexSubscript,
    /// Like IndexSubscript but keeps target and index on the stack.
    IndexSubscriptNoPop,
    /// Pop value, index and list; store, then push the value back.
    StoreSubscript,

    // Modules.
    /// Load (compiling and running if uncached) the module named by
    /// constants[operand].
    Use,
    /// Instantiate a native library by registry index, binding it to the
    /// name in constants[second operand].
    UseBuiltin,
    /// Push the most recently loaded library.
    UseName,
    /// Reset the most recently loaded library to the current function's own.
    RecentUse,
}

impl OpCode {
    /// Decodes an opcode byte. Inverse of `op as u8`.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        use OpCode::*;
        // Declaration order; must stay in sync with the enum.
        const TABLE: &[OpCode] = &[
            Constant,
            None,
            True,
            False,
            Pop,
            GetLocal,
            SetLocal,
            GetGlobal,
            GetLibrary,
            SetLibrary,
            DefineLibrary,
            PrivateDefine,
            PrivateGet,
            PrivateSet,
            GetUpvalue,
            SetUpvalue,
            GetProperty,
            GetPropertyNoPop,
            SetProperty,
            PrivatePropertyGet,
            PrivateGetPropertyNoPop,
            PrivatePropertySet,
            Equal,
            Greater,
            Less,
            Add,
            Subtract,
            Multiply,
            Divide,
            Modulo,
            Power,
            BitAnd,
            BitOr,
            BitXor,
            ShiftLeft,
            ShiftRight,
            Not,
            Negate,
            Increment,
            Decrement,
            Assert,
            Jump,
            JumpIfFalse,
            Loop,
            Break,
            Call,
            TailCall,
            Invoke,
            InvokePrivate,
            Closure,
            CloseUpvalue,
            Return,
            Class,
            Method,
            PrivateMethod,
            BuildList,
            IndexSubscript,
            IndexSubscriptNoPop,
            StoreSubscript,
            Use,
            UseBuiltin,
            UseName,
            RecentUse,
        ];
        TABLE.get(byte as usize).copied()
    }
}

/// A function's compiled bytecode, its source line table and constant pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    /// Raw instruction stream.
    pub code: Vec<u8>,
    /// Source line of each byte in `code`, for diagnostics.
    pub lines: Vec<usize>,
    /// Constant pool, at most 256 entries (one-byte operands).
    pub constants: Vec<Value>,
}

impl Chunk {
    /// An empty chunk.
    pub fn new() -> Chunk {
        Chunk::default()
    }

    /// Appends a raw byte attributed to the given source line.
    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Appends an opcode byte.
    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op as u8, line);
    }

    /// Interns a value in the constant pool, reusing an existing equal
    /// entry. Returns the pool index; callers enforce the 256 limit.
    pub fn add_constant(&mut self, value: Value) -> usize {
        if let Some(existing) = self.constants.iter().position(|c| *c == value) {
            return existing;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Number of operand bytes following the opcode at `offset`.
    /// `Closure` is variable-length: its loaded function's upvalue count
    /// decides, which is why the heap is needed.
    pub fn operand_len(&self, offset: usize, heap: &Heap) -> usize {
        use OpCode::*;
        let op = match OpCode::from_byte(self.code[offset]) {
            Some(op) => op,
            Option::None => return 0,
        };
        match op {
            Constant | GetLocal | SetLocal | GetGlobal | GetLibrary | SetLibrary
            | DefineLibrary | PrivateDefine | PrivateGet | PrivateSet | GetUpvalue
            | SetUpvalue | GetProperty | GetPropertyNoPop | SetProperty | PrivatePropertyGet
            | PrivateGetPropertyNoPop | PrivatePropertySet | Assert | Call | TailCall | Use
            | Class | Method | PrivateMethod | BuildList => 1,
            Jump | JumpIfFalse | Loop | Break | Invoke | InvokePrivate | UseBuiltin => 2,
            Closure => {
                let constant = self.code[offset + 1] as usize;
                let upvalues = match self.constants.get(constant) {
                    Some(Value::Obj(r)) => match heap.get(*r) {
                        Object::Function(function) => function.upvalue_count,
                        _ => 0,
                    },
                    _ => 0,
                };
                1 + upvalues * 2
            }
            _ => 0,
        }
    }

    /// Prints every instruction in the chunk to stdout.
    pub fn disassemble(&self, name: &str, heap: &Heap) {
        println!("== {} ==", name);
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(offset, heap);
        }
    }

    /// Prints the instruction at `offset`, returning the next offset.
    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> usize {
        use OpCode::*;
        print!("{:04} ", offset);
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            print!("   | ");
        } else {
            print!("{:4} ", self.lines[offset]);
        }

        let op = match OpCode::from_byte(self.code[offset]) {
            Some(op) => op,
            Option::None => {
                println!("bad opcode {}", self.code[offset]);
                return offset + 1;
            }
        };
        match op {
            Constant | GetGlobal | GetLibrary | SetLibrary | DefineLibrary | PrivateDefine
            | PrivateGet | PrivateSet | GetProperty | GetPropertyNoPop | SetProperty
            | PrivatePropertyGet | PrivateGetPropertyNoPop | PrivatePropertySet | Assert | Use
            | Class | Method | PrivateMethod => {
                let constant = self.code[offset + 1];
                println!(
                    "{:<16?} {:4} '{}'",
                    op,
                    constant,
                    heap.show_value(self.constants[constant as usize]),
                );
                offset + 2
            }
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | TailCall | BuildList => {
                println!("{:<16?} {:4}", op, self.code[offset + 1]);
                offset + 2
            }
            Jump | JumpIfFalse | Break => {
                let jump = self.read_short(offset + 1);
                println!("{:<16?} {:4} -> {}", op, offset, offset + 3 + jump as usize);
                offset + 3
            }
            Loop => {
                let jump = self.read_short(offset + 1);
                println!("{:<16?} {:4} -> {}", op, offset, offset + 3 - jump as usize);
                offset + 3
            }
            Invoke | InvokePrivate => {
                let arg_count = self.code[offset + 1];
                let constant = self.code[offset + 2];
                println!(
                    "{:<16?} ({} args) {:4} '{}'",
                    op,
                    arg_count,
                    constant,
                    heap.show_value(self.constants[constant as usize]),
                );
                offset + 3
            }
            UseBuiltin => {
                let index = self.code[offset + 1];
                let constant = self.code[offset + 2];
                println!(
                    "{:<16?} [{}] '{}'",
                    op,
                    index,
                    heap.show_value(self.constants[constant as usize]),
                );
                offset + 3
            }
            Closure => {
                let constant = self.code[offset + 1];
                println!(
                    "{:<16?} {:4} {}",
                    op,
                    constant,
                    heap.show_value(self.constants[constant as usize]),
                );
                let mut next = offset + 2;
                let pairs = (self.operand_len(offset, heap) - 1) / 2;
                for _ in 0..pairs {
                    let is_local = self.code[next];
                    let index = self.code[next + 1];
                    println!(
                        "{:04}    |                     {} {}",
                        next,
                        if is_local == 1 { "local" } else { "upvalue" },
                        index,
                    );
                    next += 2;
                }
                next
            }
            _ => {
                println!("{:?}", op);
                offset + 1
            }
        }
    }

    /// Reads a big-endian u16 operand starting at `offset`.
    pub fn read_short(&self, offset: usize) -> u16 {
        (u16::from(self.code[offset]) << 8) | u16::from(self.code[offset + 1])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte, "table order drifted at {}", byte);
            }
        }
        assert_eq!(OpCode::from_byte(OpCode::RecentUse as u8 + 1), None);
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0));
        let b = chunk.add_constant(Value::Number(2.0));
        let c = chunk.add_constant(Value::Number(1.0));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn shorts_are_big_endian() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0x12, 1);
        chunk.write(0x34, 1);
        assert_eq!(chunk.read_short(1), 0x1234);
    }
}
