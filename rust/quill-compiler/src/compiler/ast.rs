//! Abstract syntax tree and its code-generation walk.
//!
//! Closed enums with exhaustive-match dispatch: adding a node variant
//! is a compile error until both `text` and `generate` handle it.
//! Generation is strictly postfix — operands before operators, children
//! in source order — so run-time side effects happen left to right.

use crate::compiler::bytecode::{Instruction, Opcode};
use crate::compiler::emit::Emitter;
use quill_core::Cell;
use serde::{Deserialize, Serialize};

/// Reference to a named slot or callable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VariableReference {
    Scalar(String),
    Function(String),
}

impl VariableReference {
    pub fn text(&self) -> String {
        match self {
            VariableReference::Scalar(name) => format!("Scalar({})", name),
            VariableReference::Function(name) => format!("Function({})", name),
        }
    }

    /// Push the address of the referenced scalar slot.
    fn generate_address(&self, emitter: &mut dyn Emitter) {
        match self {
            VariableReference::Scalar(name) => {
                let slot = emitter.global_slot(name);
                emitter.append(Instruction::one(Opcode::PushGlobalPtr, slot));
            }
            // Functions have no storage address; calls go through the
            // registry by name.
            VariableReference::Function(name) => {
                let idx = emitter.intern(name.as_bytes());
                emitter.append(Instruction::one(Opcode::PushPredefPtr, idx));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expression {
    Constant(Cell),
    UnaryMinus(Box<Expression>),
    Addition(Box<Expression>, Box<Expression>),
    Subtraction(Box<Expression>, Box<Expression>),
    Multiplication(Box<Expression>, Box<Expression>),
    Division(Box<Expression>, Box<Expression>),
    Variable(VariableReference),
    FunctionCall { func: VariableReference, args: Vec<Expression> },
}

impl Expression {
    pub fn text(&self) -> String {
        match self {
            Expression::Constant(c) => format!("Constant({})", c),
            Expression::UnaryMinus(e) => format!("UnaryMinus({})", e.text()),
            Expression::Addition(l, r) => format!("Addition({},{})", l.text(), r.text()),
            Expression::Subtraction(l, r) => format!("Subtraction({},{})", l.text(), r.text()),
            Expression::Multiplication(l, r) => {
                format!("Multiplication({},{})", l.text(), r.text())
            }
            Expression::Division(l, r) => format!("Division({},{})", l.text(), r.text()),
            Expression::Variable(var) => format!("Variable({})", var.text()),
            Expression::FunctionCall { func, args } => {
                let args: Vec<String> = args.iter().map(|a| a.text()).collect();
                format!("FunctionCall({},[{}])", func.text(), args.join(","))
            }
        }
    }

    pub fn generate(&self, emitter: &mut dyn Emitter) {
        match self {
            Expression::Constant(cell) => generate_constant(cell, emitter),
            Expression::UnaryMinus(e) => {
                e.generate(emitter);
                emitter.append(Instruction::plain(Opcode::NegNum));
            }
            Expression::Addition(l, r) => generate_binary(l, r, Opcode::AddNum, emitter),
            Expression::Subtraction(l, r) => generate_binary(l, r, Opcode::SubNum, emitter),
            Expression::Multiplication(l, r) => generate_binary(l, r, Opcode::MulNum, emitter),
            Expression::Division(l, r) => generate_binary(l, r, Opcode::DivNum, emitter),
            Expression::Variable(var) => {
                var.generate_address(emitter);
                emitter.append(Instruction::plain(Opcode::LoadNum));
            }
            Expression::FunctionCall { func, args } => {
                for arg in args {
                    arg.generate(emitter);
                }
                let name = match func {
                    VariableReference::Scalar(name) | VariableReference::Function(name) => name,
                };
                let idx = emitter.intern(name.as_bytes());
                emitter.append(Instruction::one(Opcode::CallPredef, idx));
            }
        }
    }
}

/// Left, then right, then the operator: postfix order is what makes the
/// operand stack line up and keeps side effects left to right.
fn generate_binary(l: &Expression, r: &Expression, op: Opcode, emitter: &mut dyn Emitter) {
    l.generate(emitter);
    r.generate(emitter);
    emitter.append(Instruction::plain(op));
}

fn generate_constant(cell: &Cell, emitter: &mut dyn Emitter) {
    match cell {
        Cell::Boolean(b) => {
            emitter.append(Instruction::one(Opcode::PushBool, u32::from(*b)));
        }
        Cell::Number(n) => {
            let idx = emitter.intern(n.to_string().as_bytes());
            emitter.append(Instruction::one(Opcode::PushNum, idx));
        }
        Cell::String(s) => {
            let idx = emitter.intern(s.as_bytes());
            emitter.append(Instruction::one(Opcode::PushStr, idx));
        }
        // Containers and references have no literal syntax; the only
        // constants the parser produces are scalars.
        other => panic!("constant expression cannot embed a {} cell", other.tag()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Statement {
    Assignment { target: VariableReference, value: Expression },
    Expression(Expression),
    If { condition: Expression, body: Vec<Statement> },
    While { condition: Expression, body: Vec<Statement> },
}

impl Statement {
    pub fn text(&self) -> String {
        match self {
            Statement::Assignment { target, value } => {
                format!("Assignment({}, {})", target.text(), value.text())
            }
            Statement::Expression(e) => format!("ExpressionStatement({})", e.text()),
            Statement::If { condition, .. } => format!("If({})", condition.text()),
            Statement::While { condition, .. } => format!("While({})", condition.text()),
        }
    }

    pub fn generate(&self, emitter: &mut dyn Emitter) {
        match self {
            Statement::Assignment { target, value } => {
                value.generate(emitter);
                target.generate_address(emitter);
                emitter.append(Instruction::plain(Opcode::StoreNum));
            }
            Statement::Expression(e) => {
                e.generate(emitter);
            }
            Statement::If { condition, body } => {
                condition.generate(emitter);
                let skip = emitter.placeholder(Opcode::JumpFalse);
                for stmt in body {
                    stmt.generate(emitter);
                }
                let after = emitter.next_index() as u32;
                emitter.patch(skip, after);
            }
            Statement::While { condition, body } => {
                let top = emitter.next_index() as u32;
                condition.generate(emitter);
                let exit = emitter.placeholder(Opcode::JumpFalse);
                for stmt in body {
                    stmt.generate(emitter);
                }
                emitter.append(Instruction::one(Opcode::Jump, top));
                let after = emitter.next_index() as u32;
                emitter.patch(exit, after);
            }
        }
    }

    fn dump_into(&self, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.text());
        out.push('\n');
        match self {
            Statement::If { body, .. } | Statement::While { body, .. } => {
                for stmt in body {
                    stmt.dump_into(depth + 1, out);
                }
            }
            Statement::Assignment { .. } | Statement::Expression(_) => {}
        }
    }
}

/// Root node: an ordered statement list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn text(&self) -> String {
        "Program".to_string()
    }

    /// Indented tree dump for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::from("Program\n");
        for stmt in &self.statements {
            stmt.dump_into(1, &mut out);
        }
        out
    }

    /// Generate the whole program in source order.
    pub fn generate(&self, emitter: &mut dyn Emitter) {
        for stmt in &self.statements {
            stmt.generate(emitter);
        }
    }
}
