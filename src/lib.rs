//! The lib crate for the Quill bytecode compiler and interpreter.
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]

/// scanner scans!
pub mod scanner;

/// Takes tokens from the scanner and emits bytecode
pub mod compiler;

/// Bytecode chunks, opcodes and the disassembler
pub mod chunk;

/// Runtime values
pub mod value;

/// The object heap and the garbage collector
pub mod heap;

/// vm is the bits about running code.
pub mod vm;

/// Native functions exposed to scripts
pub mod natives;

/// Native libraries and module resolution
pub mod library;
