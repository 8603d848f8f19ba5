pub mod ast;
pub mod bytecode;
pub mod emit;
