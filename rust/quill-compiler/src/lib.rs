//! Quill Compiler
//!
//! Walks an abstract syntax tree (built by an external parser) and
//! emits stack-machine instructions into a [`compiler::bytecode::Module`]
//! through the [`compiler::emit::Emitter`] contract.

pub mod compiler;

pub use compiler::ast;
pub use compiler::bytecode;
pub use compiler::emit;
