//! The `Emitter` contract consumed by code generation, and the
//! `ModuleEmitter` that realizes it by building a [`Module`].

use crate::compiler::bytecode::{Instruction, Module, Opcode};
use quill_core::ByteString;
use std::collections::HashMap;

/// Collaborator receiving code-generation output. AST nodes only ever
/// append; jump targets are resolved with placeholder/patch fixups.
pub trait Emitter {
    /// Append one instruction, returning its code index.
    fn append(&mut self, instr: Instruction) -> usize;

    /// Index the next appended instruction will get.
    fn next_index(&self) -> usize;

    /// Append a jump with an unresolved target, to be patched later.
    fn placeholder(&mut self, op: Opcode) -> usize;

    /// Resolve a placeholder's target.
    fn patch(&mut self, at: usize, target: u32);

    /// Intern a byte string, returning its string-table index.
    fn intern(&mut self, bytes: &[u8]) -> u32;

    /// Storage slot for a named scalar variable, allocated on first use.
    fn global_slot(&mut self, name: &str) -> u32;
}

/// Emitter that accumulates into a [`Module`].
#[derive(Debug)]
pub struct ModuleEmitter {
    module: Module,
    string_lookup: HashMap<Vec<u8>, u32>,
    globals: HashMap<String, u32>,
}

impl ModuleEmitter {
    pub fn new(name: &str) -> Self {
        ModuleEmitter {
            module: Module::new(name),
            string_lookup: HashMap::new(),
            globals: HashMap::new(),
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    /// Slot assigned to `name`, if any. Used by tests and diagnostics.
    pub fn lookup_global(&self, name: &str) -> Option<u32> {
        self.globals.get(name).copied()
    }
}

impl Emitter for ModuleEmitter {
    fn append(&mut self, instr: Instruction) -> usize {
        self.module.code.push(instr);
        self.module.code.len() - 1
    }

    fn next_index(&self) -> usize {
        self.module.code.len()
    }

    fn placeholder(&mut self, op: Opcode) -> usize {
        self.append(Instruction::one(op, u32::MAX))
    }

    fn patch(&mut self, at: usize, target: u32) {
        self.module.code[at].a = target;
    }

    fn intern(&mut self, bytes: &[u8]) -> u32 {
        if let Some(&idx) = self.string_lookup.get(bytes) {
            return idx;
        }
        let idx = self.module.strings.len() as u32;
        self.module.strings.push(ByteString::from_bytes(bytes));
        self.string_lookup.insert(bytes.to_vec(), idx);
        idx
    }

    fn global_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.globals.get(name) {
            return slot;
        }
        let slot = self.module.global_size as u32;
        self.module.global_size += 1;
        self.globals.insert(name.to_string(), slot);
        slot
    }
}

/// Emit a module as pretty JSON for tooling.
pub fn emit_json(module: &Module) -> serde_json::Result<String> {
    serde_json::to_string_pretty(module)
}

/// Emit a module as compact canonical JSON (for hashing and fixtures).
pub fn emit_canonical_json(module: &Module) -> serde_json::Result<String> {
    serde_json::to_string(module)
}
