//! The stack-machine execution engine.
//!
//! `Executor` owns all mutable run-time storage: the operand stack,
//! call stack, frames, module globals, predefined globals, and the
//! heap. Addresses are slot paths resolved against that storage on
//! every dereference, so no instruction ever holds a raw pointer into
//! it.
//!
//! Error handling is two-tier. Contract violations (operand-stack
//! underflow, load/store tag mismatches, bad operands) are fatal and
//! end the run as a `VmError`. Conditions program logic is expected to
//! handle (division by zero, a missing dictionary key, an explicit
//! `Raise`) become in-language exceptions that unwind through the
//! module's handler table and are fatal only when unhandled.

use crate::host::HostIo;
use crate::registry::{PrimitiveError, Registry};
use quill_compiler::compiler::bytecode::{Instruction, Module, Opcode};
use quill_core::{Address, ByteString, Cell, CellTag, Number, PathSegment, Slot, ValueError};
use std::collections::HashMap;
use thiserror::Error;

const DIVIDE_BY_ZERO: &str = "DivideByZeroException";
const DICTIONARY_INDEX: &str = "DictionaryIndexException";

#[derive(Debug, Error)]
pub enum VmError {
    #[error("operand stack underflow at {module}:{ip}")]
    StackUnderflow { module: usize, ip: usize },
    #[error("call stack underflow at {module}:{ip}")]
    CallStackUnderflow { module: usize, ip: usize },
    #[error("no active frame at {module}:{ip}")]
    NoActiveFrame { module: usize, ip: usize },
    #[error("value error at {module}:{ip}: {source}")]
    Value {
        module: usize,
        ip: usize,
        source: ValueError,
    },
    #[error("invalid string-table index {index} in module {module}")]
    BadStringIndex { module: usize, index: u32 },
    #[error("corrupt number literal {literal:?} in module {module}")]
    BadNumberLiteral { module: usize, literal: String },
    #[error("dereference of the null address at {module}:{ip}")]
    NullDereference { module: usize, ip: usize },
    #[error("address base refers to missing storage at {module}:{ip}")]
    DanglingAddress { module: usize, ip: usize },
    #[error("unknown primitive: {0}")]
    UnknownPrimitive(String),
    #[error("unknown foreign handler: {0}")]
    UnknownForeign(String),
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("unknown function {function} in module {module}")]
    UnknownFunction { module: String, function: String },
    #[error("primitive failed: {0}")]
    Primitive(#[from] PrimitiveError),
    #[error("unhandled exception: {name} ({info})")]
    UnhandledException { name: String, info: String },
    #[error("step limit of {0} instructions exceeded")]
    StepLimitExceeded(u64),
}

/// Execution trace callback payload, one event per observable action.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Step { module: usize, ip: usize, op: Opcode },
    CallEnter { module: usize, entry: usize },
    CallExit { module: usize, ip: usize },
    Raise { name: String },
}

pub type TraceFn = Box<dyn FnMut(&TraceEvent)>;

/// Activation record. `opstack_depth` is the operand-stack depth at
/// `Enter`, restored when an exception unwinds past this frame;
/// `call_depth` ties the frame to its position in the call stack.
#[derive(Debug)]
struct Frame {
    module: usize,
    locals: Vec<Cell>,
    opstack_depth: usize,
    call_depth: usize,
}

struct ModuleState {
    module: Module,
    globals: Vec<Cell>,
}

impl ModuleState {
    fn new(module: Module) -> Self {
        let globals = vec![Cell::Nothing; module.global_size];
        ModuleState { module, globals }
    }
}

pub struct Executor {
    modules: Vec<ModuleState>,
    module_names: HashMap<String, usize>,
    /// Currently executing module and instruction pointer. `ip` is
    /// advanced before dispatch, so jumps assign it directly.
    module: usize,
    ip: usize,
    stack: Vec<Cell>,
    callstack: Vec<(usize, usize)>,
    frames: Vec<Frame>,
    heap: Vec<Cell>,
    predef: Vec<Cell>,
    predef_names: HashMap<ByteString, usize>,
    type_infos: Vec<ByteString>,
    registry: Registry,
    pub host: HostIo,
    trace: Option<TraceFn>,
    steps: u64,
    step_limit: Option<u64>,
    assert_enabled: bool,
}

impl Executor {
    pub fn new(module: Module, registry: Registry, host: HostIo) -> Self {
        let mut module_names = HashMap::new();
        module_names.insert(module.name.clone(), 0);
        Executor {
            modules: vec![ModuleState::new(module)],
            module_names,
            module: 0,
            ip: 0,
            stack: Vec::new(),
            callstack: Vec::new(),
            frames: Vec::new(),
            heap: Vec::new(),
            predef: Vec::new(),
            predef_names: HashMap::new(),
            type_infos: Vec::new(),
            registry,
            host,
            trace: None,
            steps: 0,
            step_limit: None,
            assert_enabled: true,
        }
    }

    /// Load an additional module, reachable through module-qualified
    /// instructions. Returns its index.
    pub fn add_module(&mut self, module: Module) -> usize {
        let idx = self.modules.len();
        self.module_names.insert(module.name.clone(), idx);
        self.modules.push(ModuleState::new(module));
        idx
    }

    pub fn set_trace(&mut self, trace: TraceFn) {
        self.trace = Some(trace);
    }

    /// Abort with `VmError::StepLimitExceeded` after `limit`
    /// instructions. Guards tests against runaway loops.
    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = Some(limit);
    }

    /// When assertions are disabled, `JumpNoAssert` is taken.
    pub fn set_assert_enabled(&mut self, enabled: bool) {
        self.assert_enabled = enabled;
    }

    pub fn stack(&self) -> &[Cell] {
        &self.stack
    }

    pub fn global(&self, slot: usize) -> Option<&Cell> {
        self.modules[self.module].globals.get(slot)
    }

    /// Run until the main code stream is exhausted, the program
    /// requests exit, or a fatal error occurs. Returns the exit code.
    pub fn run(&mut self) -> Result<i32, VmError> {
        loop {
            let code_len = self.modules[self.module].module.code.len();
            if self.ip >= code_len {
                return Ok(0);
            }
            if let Some(limit) = self.step_limit {
                if self.steps >= limit {
                    return Err(VmError::StepLimitExceeded(limit));
                }
            }
            self.steps += 1;
            let instr = self.modules[self.module].module.code[self.ip];
            self.emit_trace(TraceEvent::Step { module: self.module, ip: self.ip, op: instr.op });
            self.ip += 1;
            self.dispatch(instr)?;
            if let Some(code) = self.host.exit_requested() {
                return Ok(code);
            }
        }
    }

    fn emit_trace(&mut self, event: TraceEvent) {
        if let Some(trace) = &mut self.trace {
            trace(&event);
        }
    }

    // ── Error and operand helpers ──

    fn here(&self) -> (usize, usize) {
        // ip was already advanced past the current instruction.
        (self.module, self.ip.saturating_sub(1))
    }

    fn value_error(&self, source: ValueError) -> VmError {
        let (module, ip) = self.here();
        VmError::Value { module, ip, source }
    }

    fn string(&self, idx: u32) -> Result<ByteString, VmError> {
        self.modules[self.module]
            .module
            .string(idx)
            .cloned()
            .ok_or(VmError::BadStringIndex { module: self.module, index: idx })
    }

    fn pop(&mut self) -> Result<Cell, VmError> {
        self.stack.pop().ok_or_else(|| {
            let (module, ip) = self.here();
            VmError::StackUnderflow { module, ip }
        })
    }

    fn pop_boolean(&mut self) -> Result<bool, VmError> {
        let cell = self.pop()?;
        cell.as_boolean().map_err(|e| self.value_error(e))
    }

    fn pop_number(&mut self) -> Result<Number, VmError> {
        let cell = self.pop()?;
        cell.as_number().cloned().map_err(|e| self.value_error(e))
    }

    fn pop_string(&mut self) -> Result<ByteString, VmError> {
        let cell = self.pop()?;
        cell.as_string().cloned().map_err(|e| self.value_error(e))
    }

    fn pop_address(&mut self) -> Result<Address, VmError> {
        let cell = self.pop()?;
        cell.as_address().cloned().map_err(|e| self.value_error(e))
    }

    /// Pop an array index: a non-negative integer number. Anything
    /// else is reported as an out-of-bounds contract violation.
    fn pop_index(&mut self) -> Result<usize, VmError> {
        let n = self.pop_number()?;
        n.to_i64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| self.value_error(ValueError::IndexOutOfBounds { index: 0, size: 0 }))
    }

    // ── Address resolution ──

    /// Resolve an address to the referenced storage cell, creating
    /// intermediate containers along the path as needed.
    fn cell_at_mut(&mut self, addr: &Address) -> Result<&mut Cell, VmError> {
        let (module, ip) = self.here();
        let Address::Slot { base, path } = addr else {
            return Err(VmError::NullDereference { module, ip });
        };
        let dangling = VmError::DanglingAddress { module, ip };
        let mut cell: &mut Cell = match base {
            Slot::Global(slot) => {
                self.modules[self.module].globals.get_mut(*slot).ok_or(dangling)?
            }
            Slot::Predef(slot) => self.predef.get_mut(*slot).ok_or(dangling)?,
            Slot::Module { module: m, slot } => self
                .modules
                .get_mut(*m)
                .and_then(|ms| ms.globals.get_mut(*slot))
                .ok_or(dangling)?,
            Slot::Local { frame, slot } => self
                .frames
                .get_mut(*frame)
                .and_then(|f| f.locals.get_mut(*slot))
                .ok_or(dangling)?,
            Slot::Heap(idx) => self.heap.get_mut(*idx).ok_or(dangling)?,
        };
        for segment in path {
            cell = match segment {
                PathSegment::Element(i) => cell.array_index_for_write(*i),
                PathSegment::Key(key) => cell.dictionary_index_for_write(key),
            }
            .map_err(|source| VmError::Value { module, ip, source })?;
        }
        Ok(cell)
    }

    /// Slot of a predefined global, allocated on first use. `argv` is
    /// materialized from the host at that point.
    fn predef_slot(&mut self, name: &ByteString) -> usize {
        if let Some(&slot) = self.predef_names.get(name) {
            return slot;
        }
        let slot = self.predef.len();
        let initial = if name.as_bytes() == b"argv" {
            Cell::Array(self.host.argv.iter().map(|a| Cell::String(a.as_str().into())).collect())
        } else {
            Cell::Nothing
        };
        self.predef.push(initial);
        self.predef_names.insert(name.clone(), slot);
        slot
    }

    // ── Exception machinery ──

    /// Raise an in-language exception: search the handler tables from
    /// the raise site outward through the call stack, unwinding frames
    /// and operand stack as scopes are abandoned. The handler receives
    /// the exception object `[name, info]` on the operand stack.
    fn raise(&mut self, name: &str, info: Cell) -> Result<(), VmError> {
        self.emit_trace(TraceEvent::Raise { name: name.to_string() });
        let exception = Cell::Array(vec![Cell::String(name.into()), info.clone()]);

        let mut target_module = self.module;
        let mut target_ip = self.ip.saturating_sub(1);
        let mut depth = self.callstack.len();
        loop {
            if let Some(handler) = find_handler(
                &self.modules[target_module].module,
                target_ip,
                name.as_bytes(),
            ) {
                while self.frames.last().is_some_and(|f| f.call_depth > depth) {
                    self.frames.pop();
                }
                self.callstack.truncate(depth);
                let floor = self.frames.last().map_or(0, |f| f.opstack_depth);
                self.stack.truncate(floor);
                self.stack.push(exception);
                self.module = target_module;
                self.ip = handler;
                return Ok(());
            }
            if depth == 0 {
                return Err(VmError::UnhandledException {
                    name: name.to_string(),
                    info: info.to_string(),
                });
            }
            depth -= 1;
            let (m, return_ip) = self.callstack[depth];
            target_module = m;
            // The return address points past the call instruction.
            target_ip = return_ip.saturating_sub(1);
        }
    }

    // ── Dispatch ──

    fn dispatch(&mut self, instr: Instruction) -> Result<(), VmError> {
        let Instruction { op, a, b } = instr;
        match op {
            Opcode::Enter => self.op_enter(a),
            Opcode::Leave => self.op_leave(),
            Opcode::Return => self.op_return(),

            Opcode::Dup => self.op_dup(),
            Opcode::DupUnder => self.op_dup_under(),
            Opcode::Drop => self.pop().map(drop),
            Opcode::DropN => self.op_drop_n(a),
            Opcode::Swap => self.op_swap(),

            Opcode::PushBool => {
                self.stack.push(Cell::Boolean(a != 0));
                Ok(())
            }
            Opcode::PushNum => self.op_push_num(a),
            Opcode::PushStr => {
                let s = self.string(a)?;
                self.stack.push(Cell::String(s));
                Ok(())
            }
            Opcode::PushInt => {
                self.stack.push(Cell::Number(Number::from_i64(i64::from(a as i32))));
                Ok(())
            }
            Opcode::PushNil => {
                self.stack.push(Cell::Address(Address::Null));
                Ok(())
            }
            Opcode::PushFuncPtr => {
                self.stack.push(Cell::Pointer(function_handle(self.module, a)));
                Ok(())
            }
            Opcode::PushModule => {
                self.stack.push(Cell::Pointer(self.module as u64));
                Ok(())
            }
            Opcode::PushTypeInfo => self.op_push_type_info(a),

            Opcode::PushGlobalPtr => {
                self.stack.push(Cell::Address(Address::slot(Slot::Global(a as usize))));
                Ok(())
            }
            Opcode::PushPredefPtr => self.op_push_predef_ptr(a),
            Opcode::PushModulePtr => self.op_push_module_ptr(a, b),
            Opcode::PushLocalPtr => self.op_push_local_ptr(a, 0),
            Opcode::PushOuterLocalPtr => self.op_push_local_ptr(b, a as usize),
            Opcode::PushOuterGlobalPtr => self.op_push_outer_global_ptr(a, b),

            Opcode::LoadBool => self.op_load(CellTag::Boolean),
            Opcode::LoadNum => self.op_load(CellTag::Number),
            Opcode::LoadStr => self.op_load(CellTag::String),
            Opcode::LoadArray => self.op_load(CellTag::Array),
            Opcode::LoadDict => self.op_load(CellTag::Dictionary),
            Opcode::LoadPointer => self.op_load(CellTag::Pointer),

            Opcode::StoreBool => self.op_store(CellTag::Boolean),
            Opcode::StoreNum => self.op_store(CellTag::Number),
            Opcode::StoreStr => self.op_store(CellTag::String),
            Opcode::StoreArray => self.op_store(CellTag::Array),
            Opcode::StoreDict => self.op_store(CellTag::Dictionary),
            Opcode::StorePointer => self.op_store(CellTag::Pointer),

            Opcode::NegNum => {
                let x = self.pop_number()?;
                self.stack.push(Cell::Number(x.neg()));
                Ok(())
            }
            Opcode::AddNum => self.op_arith(Number::add),
            Opcode::SubNum => self.op_arith(Number::sub),
            Opcode::MulNum => self.op_arith(Number::mul),
            Opcode::DivNum => self.op_arith_checked(Number::div),
            Opcode::ModNum => self.op_arith_checked(Number::rem),
            Opcode::ExpNum => self.op_arith_checked(Number::pow),

            Opcode::EqBool => self.op_compare_bool(|a, b| a == b),
            Opcode::NeBool => self.op_compare_bool(|a, b| a != b),
            Opcode::EqNum => self.op_compare_num(|a, b| a == b),
            Opcode::NeNum => self.op_compare_num(|a, b| a != b),
            Opcode::LtNum => self.op_compare_num(|a, b| a < b),
            Opcode::GtNum => self.op_compare_num(|a, b| a > b),
            Opcode::LeNum => self.op_compare_num(|a, b| a <= b),
            Opcode::GeNum => self.op_compare_num(|a, b| a >= b),
            Opcode::EqStr => self.op_compare_str(|a, b| a == b),
            Opcode::NeStr => self.op_compare_str(|a, b| a != b),
            Opcode::LtStr => self.op_compare_str(|a, b| a < b),
            Opcode::GtStr => self.op_compare_str(|a, b| a > b),
            Opcode::LeStr => self.op_compare_str(|a, b| a <= b),
            Opcode::GeStr => self.op_compare_str(|a, b| a >= b),
            Opcode::EqArray => self.op_compare_structural(CellTag::Array, true),
            Opcode::NeArray => self.op_compare_structural(CellTag::Array, false),
            Opcode::EqDict => self.op_compare_structural(CellTag::Dictionary, true),
            Opcode::NeDict => self.op_compare_structural(CellTag::Dictionary, false),
            Opcode::EqPtr => self.op_compare_ptr(true),
            Opcode::NePtr => self.op_compare_ptr(false),

            Opcode::AndBool => self.op_logic(|a, b| a && b),
            Opcode::OrBool => self.op_logic(|a, b| a || b),
            Opcode::NotBool => {
                let v = self.pop_boolean()?;
                self.stack.push(Cell::Boolean(!v));
                Ok(())
            }

            Opcode::IndexArrayRead => self.op_index_array_addr(false),
            Opcode::IndexArrayWrite => self.op_index_array_addr(true),
            Opcode::IndexArrayValue => self.op_index_array_value(false),
            Opcode::IndexArrayValueOrNothing => self.op_index_array_value(true),
            Opcode::IndexDictRead => self.op_index_dict_addr(false),
            Opcode::IndexDictWrite => self.op_index_dict_addr(true),
            Opcode::IndexDictValue => self.op_index_dict_value(),
            Opcode::InArray => self.op_in_array(),
            Opcode::InDict => self.op_in_dict(),

            Opcode::CallPredef => self.op_call_predef(a),
            Opcode::CallFunc => self.op_call(self.module, a as usize),
            Opcode::CallModuleFunc => self.op_call_module_func(a, b),
            Opcode::CallIndirect => self.op_call_indirect(),
            Opcode::CallForeign => self.op_call_foreign(a),

            Opcode::Jump => {
                self.ip = a as usize;
                Ok(())
            }
            Opcode::JumpFalse => self.op_jump_cond(a, false),
            Opcode::JumpTrue => self.op_jump_cond(a, true),
            Opcode::JumpFalseChain => self.op_jump_false_chain(a),
            Opcode::JumpTable => self.op_jump_table(a),
            Opcode::JumpNoAssert => {
                if !self.assert_enabled {
                    self.ip = a as usize;
                }
                Ok(())
            }

            Opcode::ConsArray => self.op_cons_array(a),
            Opcode::ConsDict => self.op_cons_dict(a),

            Opcode::Raise => self.op_raise(a),

            Opcode::Alloc => self.op_alloc(a),
            Opcode::ResetCell => self.op_reset_cell(),
        }
    }

    // ── Frames and calls ──

    fn op_enter(&mut self, locals: u32) -> Result<(), VmError> {
        self.frames.push(Frame {
            module: self.module,
            locals: vec![Cell::Nothing; locals as usize],
            opstack_depth: self.stack.len(),
            call_depth: self.callstack.len(),
        });
        Ok(())
    }

    fn op_leave(&mut self) -> Result<(), VmError> {
        let (module, ip) = self.here();
        self.frames.pop().map(drop).ok_or(VmError::NoActiveFrame { module, ip })
    }

    fn op_return(&mut self) -> Result<(), VmError> {
        let (module, ip) = self.here();
        let (m, return_ip) =
            self.callstack.pop().ok_or(VmError::CallStackUnderflow { module, ip })?;
        self.module = m;
        self.ip = return_ip;
        self.emit_trace(TraceEvent::CallExit { module: m, ip: return_ip });
        Ok(())
    }

    fn op_call(&mut self, module: usize, entry: usize) -> Result<(), VmError> {
        self.emit_trace(TraceEvent::CallEnter { module, entry });
        self.callstack.push((self.module, self.ip));
        self.module = module;
        self.ip = entry;
        Ok(())
    }

    fn op_call_predef(&mut self, stridx: u32) -> Result<(), VmError> {
        let name = self.string(stridx)?.to_string();
        let handler = self
            .registry
            .lookup(&name)
            .ok_or_else(|| VmError::UnknownPrimitive(name.clone()))?;
        handler(&mut self.stack, &mut self.host)?;
        Ok(())
    }

    fn op_call_foreign(&mut self, stridx: u32) -> Result<(), VmError> {
        let name = self.string(stridx)?.to_string();
        let handler = self
            .registry
            .lookup_foreign(&name)
            .ok_or_else(|| VmError::UnknownForeign(name.clone()))?;
        handler(&mut self.stack, &mut self.host)?;
        Ok(())
    }

    fn op_call_module_func(&mut self, module_stridx: u32, func_stridx: u32) -> Result<(), VmError> {
        let module_name = self.string(module_stridx)?.to_string();
        let func_name = self.string(func_stridx)?;
        let target = *self
            .module_names
            .get(&module_name)
            .ok_or_else(|| VmError::UnknownModule(module_name.clone()))?;
        let target_module = &self.modules[target].module;
        let entry = target_module
            .functions
            .iter()
            .find(|f| target_module.string(f.name) == Some(&func_name))
            .map(|f| f.entry as usize)
            .ok_or_else(|| VmError::UnknownFunction {
                module: module_name,
                function: func_name.to_string(),
            })?;
        self.op_call(target, entry)
    }

    fn op_call_indirect(&mut self) -> Result<(), VmError> {
        let cell = self.pop()?;
        let handle = cell.as_pointer().map_err(|e| self.value_error(e))?;
        let (module, entry) = function_target(handle);
        let (here_module, ip) = self.here();
        if self.modules.get(module).map_or(true, |m| entry >= m.module.code.len()) {
            return Err(VmError::DanglingAddress { module: here_module, ip });
        }
        self.op_call(module, entry)
    }

    // ── Stack manipulation ──

    fn op_dup(&mut self) -> Result<(), VmError> {
        let top = self.pop()?;
        self.stack.push(top.clone());
        self.stack.push(top);
        Ok(())
    }

    fn op_dup_under(&mut self) -> Result<(), VmError> {
        let top = self.pop()?;
        let under = self.pop()?;
        self.stack.push(top.clone());
        self.stack.push(under);
        self.stack.push(top);
        Ok(())
    }

    fn op_drop_n(&mut self, n: u32) -> Result<(), VmError> {
        let (module, ip) = self.here();
        let len = self.stack.len();
        let at = len
            .checked_sub(1 + n as usize)
            .ok_or(VmError::StackUnderflow { module, ip })?;
        self.stack.remove(at);
        Ok(())
    }

    fn op_swap(&mut self) -> Result<(), VmError> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.stack.push(a);
        self.stack.push(b);
        Ok(())
    }

    // ── Immediates and addresses ──

    fn op_push_num(&mut self, stridx: u32) -> Result<(), VmError> {
        let literal = self.string(stridx)?.to_string();
        let n: Number = literal.parse().map_err(|_| VmError::BadNumberLiteral {
            module: self.module,
            literal,
        })?;
        self.stack.push(Cell::Number(n));
        Ok(())
    }

    fn op_push_type_info(&mut self, stridx: u32) -> Result<(), VmError> {
        let name = self.string(stridx)?;
        let handle = match self.type_infos.iter().position(|t| *t == name) {
            Some(i) => i,
            None => {
                self.type_infos.push(name);
                self.type_infos.len() - 1
            }
        };
        self.stack.push(Cell::Pointer(handle as u64));
        Ok(())
    }

    fn op_push_predef_ptr(&mut self, stridx: u32) -> Result<(), VmError> {
        let name = self.string(stridx)?;
        let slot = self.predef_slot(&name);
        self.stack.push(Cell::Address(Address::slot(Slot::Predef(slot))));
        Ok(())
    }

    fn op_push_module_ptr(&mut self, module_stridx: u32, slot: u32) -> Result<(), VmError> {
        let name = self.string(module_stridx)?.to_string();
        let module = *self
            .module_names
            .get(&name)
            .ok_or(VmError::UnknownModule(name))?;
        self.stack
            .push(Cell::Address(Address::slot(Slot::Module { module, slot: slot as usize })));
        Ok(())
    }

    fn op_push_local_ptr(&mut self, slot: u32, depth: usize) -> Result<(), VmError> {
        let (module, ip) = self.here();
        let frame = self
            .frames
            .len()
            .checked_sub(1 + depth)
            .ok_or(VmError::NoActiveFrame { module, ip })?;
        self.stack
            .push(Cell::Address(Address::slot(Slot::Local { frame, slot: slot as usize })));
        Ok(())
    }

    fn op_push_outer_global_ptr(&mut self, depth: u32, slot: u32) -> Result<(), VmError> {
        let (here_module, ip) = self.here();
        let frame = self
            .frames
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(VmError::NoActiveFrame { module: here_module, ip })?;
        let module = self.frames[frame].module;
        self.stack
            .push(Cell::Address(Address::slot(Slot::Module { module, slot: slot as usize })));
        Ok(())
    }

    // ── Loads and stores ──

    /// Dereference the popped address and push a deep copy of the
    /// referenced value. An untouched (`Nothing`) cell reads as the
    /// default value of the expected type; any other tag mismatch is
    /// fatal.
    fn op_load(&mut self, expected: CellTag) -> Result<(), VmError> {
        let addr = self.pop_address()?;
        let cell = self.cell_at_mut(&addr)?;
        let value = match (cell.tag(), expected) {
            (CellTag::Nothing, CellTag::Boolean) => Cell::Boolean(false),
            (CellTag::Nothing, CellTag::Number) => Cell::Number(Number::zero()),
            (CellTag::Nothing, CellTag::String) => Cell::String(ByteString::default()),
            (CellTag::Nothing, CellTag::Array) => Cell::Array(Vec::new()),
            (CellTag::Nothing, CellTag::Dictionary) => {
                Cell::Dictionary(quill_core::OrderedDict::new())
            }
            (CellTag::Nothing, CellTag::Pointer) => Cell::Pointer(0),
            (found, expected) if found == expected => cell.clone(),
            (found, expected) => {
                return Err(self.value_error(ValueError::TypeMismatch { expected, found }))
            }
        };
        self.stack.push(value);
        Ok(())
    }

    /// Pop the address, then the value, and write a deep copy of the
    /// value into storage. The value's tag must match the instruction.
    fn op_store(&mut self, expected: CellTag) -> Result<(), VmError> {
        let addr = self.pop_address()?;
        let value = self.pop()?;
        if value.tag() != expected {
            return Err(
                self.value_error(ValueError::TypeMismatch { expected, found: value.tag() })
            );
        }
        *self.cell_at_mut(&addr)? = value;
        Ok(())
    }

    // ── Arithmetic and comparisons ──

    fn op_arith(&mut self, f: fn(&Number, &Number) -> Number) -> Result<(), VmError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        self.stack.push(Cell::Number(f(&a, &b)));
        Ok(())
    }

    /// Division-family arithmetic: a failed operation raises a
    /// catchable exception carrying the numeric failure text rather
    /// than ending the run.
    fn op_arith_checked(
        &mut self,
        f: fn(&Number, &Number) -> Result<Number, quill_core::NumberError>,
    ) -> Result<(), VmError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        match f(&a, &b) {
            Ok(n) => {
                self.stack.push(Cell::Number(n));
                Ok(())
            }
            Err(e) => self.raise(DIVIDE_BY_ZERO, Cell::String(e.to_string().into())),
        }
    }

    fn op_compare_bool(&mut self, f: fn(bool, bool) -> bool) -> Result<(), VmError> {
        let b = self.pop_boolean()?;
        let a = self.pop_boolean()?;
        self.stack.push(Cell::Boolean(f(a, b)));
        Ok(())
    }

    fn op_compare_num(&mut self, f: fn(&Number, &Number) -> bool) -> Result<(), VmError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        self.stack.push(Cell::Boolean(f(&a, &b)));
        Ok(())
    }

    fn op_compare_str(&mut self, f: fn(&ByteString, &ByteString) -> bool) -> Result<(), VmError> {
        let b = self.pop_string()?;
        let a = self.pop_string()?;
        self.stack.push(Cell::Boolean(f(&a, &b)));
        Ok(())
    }

    fn op_compare_structural(&mut self, expected: CellTag, want_equal: bool) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        for operand in [&a, &b] {
            if operand.tag() != expected {
                return Err(self
                    .value_error(ValueError::TypeMismatch { expected, found: operand.tag() }));
            }
        }
        let equal = a.compare(&b).map_err(|e| self.value_error(e))?;
        self.stack.push(Cell::Boolean(equal == want_equal));
        Ok(())
    }

    fn op_compare_ptr(&mut self, want_equal: bool) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let pb = b.as_pointer().map_err(|e| self.value_error(e))?;
        let pa = a.as_pointer().map_err(|e| self.value_error(e))?;
        self.stack.push(Cell::Boolean((pa == pb) == want_equal));
        Ok(())
    }

    fn op_logic(&mut self, f: fn(bool, bool) -> bool) -> Result<(), VmError> {
        let b = self.pop_boolean()?;
        let a = self.pop_boolean()?;
        self.stack.push(Cell::Boolean(f(a, b)));
        Ok(())
    }

    // ── Indexing ──

    fn op_index_array_addr(&mut self, for_write: bool) -> Result<(), VmError> {
        let (module, ip) = self.here();
        let index = self.pop_index()?;
        let addr = self.pop_address()?;
        let cell = self.cell_at_mut(&addr)?;
        if for_write {
            cell.array_index_for_write(index).map(|_| ())
        } else {
            cell.array_index_for_read(index).map(|_| ())
        }
        .map_err(|source| VmError::Value { module, ip, source })?;
        let child = addr
            .child(PathSegment::Element(index))
            .ok_or(VmError::NullDereference { module, ip })?;
        self.stack.push(Cell::Address(child));
        Ok(())
    }

    fn op_index_array_value(&mut self, or_nothing: bool) -> Result<(), VmError> {
        let index = self.pop_index()?;
        let array = self.pop()?;
        let elements = array.as_array().map_err(|e| self.value_error(e))?;
        match elements.get(index) {
            Some(element) => {
                self.stack.push(element.clone());
                Ok(())
            }
            None if or_nothing => {
                self.stack.push(Cell::Nothing);
                Ok(())
            }
            None => Err(self.value_error(ValueError::IndexOutOfBounds {
                index,
                size: elements.len(),
            })),
        }
    }

    fn op_index_dict_addr(&mut self, for_write: bool) -> Result<(), VmError> {
        let (module, ip) = self.here();
        let key = self.pop_string()?;
        let addr = self.pop_address()?;
        let cell = self.cell_at_mut(&addr)?;
        if for_write {
            cell.dictionary_index_for_write(&key)
                .map(|_| ())
                .map_err(|source| VmError::Value { module, ip, source })?;
        } else {
            let present = cell
                .dictionary_index_for_read(&key)
                .map_err(|source| VmError::Value { module, ip, source })?
                .is_some();
            if !present {
                return self.raise(DICTIONARY_INDEX, Cell::String(key));
            }
        }
        let child = addr
            .child(PathSegment::Key(key))
            .ok_or(VmError::NullDereference { module, ip })?;
        self.stack.push(Cell::Address(child));
        Ok(())
    }

    fn op_index_dict_value(&mut self) -> Result<(), VmError> {
        let key = self.pop_string()?;
        let dict = self.pop()?;
        let entries = dict.as_dictionary().map_err(|e| self.value_error(e))?;
        match entries.get(&key) {
            Some(value) => {
                self.stack.push(value.clone());
                Ok(())
            }
            None => self.raise(DICTIONARY_INDEX, Cell::String(key)),
        }
    }

    fn op_in_array(&mut self) -> Result<(), VmError> {
        let array = self.pop()?;
        let element = self.pop()?;
        let found = array.array_element_exists(&element).map_err(|e| self.value_error(e))?;
        self.stack.push(Cell::Boolean(found));
        Ok(())
    }

    fn op_in_dict(&mut self) -> Result<(), VmError> {
        let dict = self.pop()?;
        let key = self.pop_string()?;
        let entries = dict.as_dictionary().map_err(|e| self.value_error(e))?;
        self.stack.push(Cell::Boolean(entries.contains_key(&key)));
        Ok(())
    }

    // ── Jumps ──

    fn op_jump_cond(&mut self, target: u32, jump_when: bool) -> Result<(), VmError> {
        if self.pop_boolean()? == jump_when {
            self.ip = target as usize;
        }
        Ok(())
    }

    /// Chained-comparison jump: on a false link, replace the leftover
    /// operand with the false result and bail out of the chain.
    fn op_jump_false_chain(&mut self, target: u32) -> Result<(), VmError> {
        if !self.pop_boolean()? {
            self.pop()?;
            self.stack.push(Cell::Boolean(false));
            self.ip = target as usize;
        }
        Ok(())
    }

    /// Dispatch into the block of `n` jump instructions that follows:
    /// selector `v` in `0..n` lands on entry `v`, anything else falls
    /// through to just past the block.
    fn op_jump_table(&mut self, n: u32) -> Result<(), VmError> {
        let selector = self.pop_number()?;
        let offset = match selector.to_i64() {
            Some(v) if v >= 0 && (v as u64) < u64::from(n) => v as usize,
            _ => n as usize,
        };
        self.ip += offset;
        Ok(())
    }

    // ── Construction, exceptions, storage ──

    fn op_cons_array(&mut self, n: u32) -> Result<(), VmError> {
        let mut elements = Vec::with_capacity(n as usize);
        for _ in 0..n {
            elements.push(self.pop()?);
        }
        elements.reverse();
        self.stack.push(Cell::Array(elements));
        Ok(())
    }

    fn op_cons_dict(&mut self, n: u32) -> Result<(), VmError> {
        let mut dict = quill_core::OrderedDict::new();
        for _ in 0..n {
            let value = self.pop()?;
            let key = self.pop_string()?;
            dict.insert(key, value);
        }
        self.stack.push(Cell::Dictionary(dict));
        Ok(())
    }

    fn op_raise(&mut self, name_stridx: u32) -> Result<(), VmError> {
        let name = self.string(name_stridx)?.to_string();
        let info = self.pop()?;
        self.raise(&name, info)
    }

    fn op_alloc(&mut self, n: u32) -> Result<(), VmError> {
        let idx = self.heap.len();
        self.heap.push(Cell::Array(vec![Cell::Nothing; n as usize]));
        self.stack.push(Cell::Address(Address::slot(Slot::Heap(idx))));
        Ok(())
    }

    fn op_reset_cell(&mut self) -> Result<(), VmError> {
        let addr = self.pop_address()?;
        self.cell_at_mut(&addr)?.clear();
        Ok(())
    }
}

/// Function values pack (module, entry) into one opaque handle.
fn function_handle(module: usize, entry: u32) -> u64 {
    ((module as u64) << 32) | u64::from(entry)
}

fn function_target(handle: u64) -> (usize, usize) {
    ((handle >> 32) as usize, (handle & 0xffff_ffff) as usize)
}

/// First handler whose scope covers `ip` and whose name is a prefix of
/// the raised exception name.
fn find_handler(module: &Module, ip: usize, raised: &[u8]) -> Option<usize> {
    module.except_table.iter().find_map(|h| {
        let in_scope = (h.start as usize) <= ip && ip < (h.end as usize);
        let prefix = module.string(h.name).map(|n| raised.starts_with(n.as_bytes()));
        (in_scope && prefix == Some(true)).then_some(h.handler as usize)
    })
}
