//! Bytecode data types: the fixed opcode vocabulary shared by the
//! emitter and the execution engine, and the logical `Module` that
//! carries an emitted instruction stream.
//!
//! A `Module` is the *logical* opcode-stream contract only. The
//! byte-level object-file encoding belongs to the loader layer, which
//! is outside this workspace.

use quill_core::ByteString;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Stack-machine instruction set.
///
/// Operand conventions: `stridx` is an index into the module string
/// table, `slot` a storage slot, `addr` a code index, `n` a count.
/// Unused operand fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[repr(u8)]
pub enum Opcode {
    // Frame management
    Enter,              // a=n: push a frame with n local slots
    Leave,              // pop the top frame
    Return,             // pop the return address and resume there

    // Stack manipulation
    Dup,                // duplicate the top cell
    DupUnder,           // duplicate the top cell under the second
    Drop,               // drop the top cell
    DropN,              // a=n: drop the cell n below the top
    Swap,               // swap the two top cells

    // Immediates
    PushBool,           // a=0/1: push a boolean
    PushNum,            // a=stridx: push the number literal
    PushStr,            // a=stridx: push the string
    PushInt,            // a=i32 bits: push a small integer number
    PushNil,            // push the null address
    PushFuncPtr,        // a=addr: push a function value
    PushModule,         // push a handle to the current module
    PushTypeInfo,       // a=stridx: push a handle to named type info

    // Address pushes, one per storage scope
    PushGlobalPtr,      // a=slot: address of a module global
    PushPredefPtr,      // a=stridx: address of a predefined global
    PushModulePtr,      // a=stridx (module name), b=slot
    PushLocalPtr,       // a=slot: address of a local in the top frame
    PushOuterLocalPtr,  // a=depth, b=slot: local of an enclosing frame
    PushOuterGlobalPtr, // a=depth, b=slot: global of an enclosing module

    // Typed loads through an address
    LoadBool,
    LoadNum,
    LoadStr,
    LoadArray,
    LoadDict,
    LoadPointer,

    // Typed stores through an address
    StoreBool,
    StoreNum,
    StoreStr,
    StoreArray,
    StoreDict,
    StorePointer,

    // Decimal arithmetic
    NegNum,
    AddNum,
    SubNum,
    MulNum,
    DivNum,
    ModNum,
    ExpNum,

    // Comparisons, per cell category
    EqBool,
    NeBool,
    EqNum,
    NeNum,
    LtNum,
    GtNum,
    LeNum,
    GeNum,
    EqStr,
    NeStr,
    LtStr,
    GtStr,
    LeStr,
    GeStr,
    EqArray,
    NeArray,
    EqDict,
    NeDict,
    EqPtr,
    NePtr,

    // Boolean logic
    AndBool,
    OrBool,
    NotBool,

    // Array / dictionary indexing
    IndexArrayRead,         // addr idx -> element addr (bounds-checked)
    IndexArrayWrite,        // addr idx -> element addr (auto-grow)
    IndexArrayValue,        // value idx -> element value
    IndexArrayValueOrNothing, // value idx -> element value or Nothing
    IndexDictRead,          // addr key -> value addr (must exist)
    IndexDictWrite,         // addr key -> value addr (auto-insert)
    IndexDictValue,         // value key -> value
    InArray,                // element array -> bool
    InDict,                 // key dict -> bool

    // Calls
    CallPredef,         // a=stridx: registry primitive by name
    CallFunc,           // a=addr: direct call
    CallModuleFunc,     // a=stridx (module name), b=stridx (function name)
    CallIndirect,       // pops a function value, calls it
    CallForeign,        // a=stridx: foreign handler by name

    // Jumps
    Jump,               // a=addr
    JumpFalse,          // a=addr: pops bool, jumps when false
    JumpTrue,           // a=addr: pops bool, jumps when true
    JumpFalseChain,     // a=addr: like JumpFalse but keeps the popped
                        // value underneath for chained comparisons
    JumpTable,          // a=n: pops a number, dispatches into the next
                        // n Jump instructions, falls through otherwise
    JumpNoAssert,       // a=addr: jump taken when assertions are off

    // Construction from stack operands
    ConsArray,          // a=n: pop n cells, push an array
    ConsDict,           // a=n: pop n (key, value) pairs, push a dict

    // Exceptions
    Raise,              // a=stridx (name): pops the info cell, unwinds

    // Storage management
    Alloc,              // a=n: allocate a heap record of n cells,
                        // push its address
    ResetCell,          // pops an address, clears the referenced cell
}

/// One instruction: an opcode plus up to two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub a: u32,
    pub b: u32,
}

impl Instruction {
    pub fn plain(op: Opcode) -> Self {
        Instruction { op, a: 0, b: 0 }
    }

    pub fn one(op: Opcode, a: u32) -> Self {
        Instruction { op, a, b: 0 }
    }

    pub fn two(op: Opcode, a: u32, b: u32) -> Self {
        Instruction { op, a, b }
    }
}

/// Callable entry point within a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    /// String-table index of the function name.
    pub name: u32,
    /// Code index of the first instruction.
    pub entry: u32,
    /// Number of local slots its frame needs.
    pub locals: u32,
}

/// One exception-handler scope. A raise at a code index inside
/// `[start, end)` whose exception name starts with `name` transfers
/// control to `handler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// String-table index of the handled exception name.
    pub name: u32,
}

/// A complete emitted module: instruction stream plus its tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub strings: Vec<ByteString>,
    /// Number of module-global slots.
    pub global_size: usize,
    pub code: Vec<Instruction>,
    pub functions: Vec<FunctionInfo>,
    pub except_table: Vec<ExceptionHandler>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            strings: Vec::new(),
            global_size: 0,
            code: Vec::new(),
            functions: Vec::new(),
            except_table: Vec::new(),
        }
    }

    pub fn string(&self, idx: u32) -> Option<&ByteString> {
        self.strings.get(idx as usize)
    }

    /// Textual listing for diagnostics and tests.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.code.iter().enumerate() {
            out.push_str(&format!("{:04} {} {} {}\n", i, instr.op, instr.a, instr.b));
        }
        out
    }
}
