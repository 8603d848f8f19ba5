//! Runtime primitive registry: the name → native-handler table
//! consulted by call instructions.
//!
//! The registry is built explicitly at startup and passed by reference
//! into the executor; there is no process-wide table. Handlers operate
//! directly on the operand stack: arguments were pushed left to right,
//! so they pop right to left and push the result.

use crate::host::HostIo;
use quill_core::{ByteString, Cell, Number};
use std::collections::HashMap;
use thiserror::Error;

/// Precondition failures inside primitives: caller errors that fail
/// fast and are not catchable by program logic.
#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("{name}: missing argument on operand stack")]
    Underflow { name: &'static str },
    #[error("{name}: {source}")]
    Type {
        name: &'static str,
        source: quill_core::ValueError,
    },
    #[error("{name}: {message}")]
    Precondition { name: &'static str, message: String },
}

pub type PrimitiveFn = fn(&mut Vec<Cell>, &mut HostIo) -> Result<(), PrimitiveError>;

/// Name → handler table, populated once at startup.
#[derive(Default)]
pub struct Registry {
    table: HashMap<String, PrimitiveFn>,
    foreign: HashMap<String, PrimitiveFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the builtin primitive surface.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("abs", prim_abs);
        r.register("max", prim_max);
        r.register("min", prim_min);
        r.register("num", prim_num);
        r.register("str", prim_str);
        r.register("strb", prim_strb);
        r.register("sin", prim_sin);
        r.register("cos", prim_cos);
        r.register("tan", prim_tan);
        r.register("asin", prim_asin);
        r.register("acos", prim_acos);
        r.register("atan", prim_atan);
        r.register("exp", prim_exp);
        r.register("log", prim_log);
        r.register("sqrt", prim_sqrt);
        r.register("ceil", prim_ceil);
        r.register("floor", prim_floor);
        r.register("chr", prim_chr);
        r.register("ord", prim_ord);
        r.register("concat", prim_concat);
        r.register("substring", prim_substring);
        r.register("splice", prim_splice);
        r.register("length", prim_length);
        r.register("print", prim_print);
        r.register("input", prim_input);
        r.register("exit", prim_exit);
        r.register("argv", prim_argv);
        r.register("now", prim_now);
        r
    }

    pub fn register(&mut self, name: &str, handler: PrimitiveFn) {
        self.table.insert(name.to_string(), handler);
    }

    /// Handlers reached by the foreign-call instruction live in their
    /// own namespace.
    pub fn register_foreign(&mut self, name: &str, handler: PrimitiveFn) {
        self.foreign.insert(name.to_string(), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<PrimitiveFn> {
        self.table.get(name).copied()
    }

    pub fn lookup_foreign(&self, name: &str) -> Option<PrimitiveFn> {
        self.foreign.get(name).copied()
    }
}

// ── Argument helpers ──

fn pop(stack: &mut Vec<Cell>, name: &'static str) -> Result<Cell, PrimitiveError> {
    stack.pop().ok_or(PrimitiveError::Underflow { name })
}

fn pop_number(stack: &mut Vec<Cell>, name: &'static str) -> Result<Number, PrimitiveError> {
    let cell = pop(stack, name)?;
    cell.as_number()
        .map(Number::clone)
        .map_err(|source| PrimitiveError::Type { name, source })
}

fn pop_string(stack: &mut Vec<Cell>, name: &'static str) -> Result<ByteString, PrimitiveError> {
    let cell = pop(stack, name)?;
    cell.as_string()
        .map(ByteString::clone)
        .map_err(|source| PrimitiveError::Type { name, source })
}

fn pop_boolean(stack: &mut Vec<Cell>, name: &'static str) -> Result<bool, PrimitiveError> {
    let cell = pop(stack, name)?;
    cell.as_boolean()
        .map_err(|source| PrimitiveError::Type { name, source })
}

fn pop_index(stack: &mut Vec<Cell>, name: &'static str) -> Result<usize, PrimitiveError> {
    let n = pop_number(stack, name)?;
    n.to_i64()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| PrimitiveError::Precondition {
            name,
            message: format!("expected a non-negative integer, got {}", n),
        })
}

fn precondition(name: &'static str, message: impl Into<String>) -> PrimitiveError {
    PrimitiveError::Precondition { name, message: message.into() }
}

/// Transcendental primitives round-trip through `f64`.
fn unary_float(
    stack: &mut Vec<Cell>,
    name: &'static str,
    f: fn(f64) -> f64,
) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, name)?;
    let y = f(x.to_f64());
    let n = Number::from_f64(y)
        .map_err(|_| precondition(name, format!("result undefined for {}", x)))?;
    stack.push(Cell::Number(n));
    Ok(())
}

// ── Numeric primitives ──

fn prim_abs(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, "abs")?;
    stack.push(Cell::Number(x.abs()));
    Ok(())
}

fn prim_max(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let b = pop_number(stack, "max")?;
    let a = pop_number(stack, "max")?;
    stack.push(Cell::Number(if a > b { a } else { b }));
    Ok(())
}

fn prim_min(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let b = pop_number(stack, "min")?;
    let a = pop_number(stack, "min")?;
    stack.push(Cell::Number(if a < b { a } else { b }));
    Ok(())
}

fn prim_num(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let s = pop_string(stack, "num")?;
    let text = String::from_utf8_lossy(s.as_bytes()).to_string();
    let n: Number = text
        .parse()
        .map_err(|_| precondition("num", format!("not a number: {:?}", text)))?;
    stack.push(Cell::Number(n));
    Ok(())
}

fn prim_str(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, "str")?;
    stack.push(Cell::String(x.to_string().into()));
    Ok(())
}

fn prim_strb(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let b = pop_boolean(stack, "strb")?;
    stack.push(Cell::String(if b { "TRUE".into() } else { "FALSE".into() }));
    Ok(())
}

fn prim_sin(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "sin", f64::sin)
}

fn prim_cos(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "cos", f64::cos)
}

fn prim_tan(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "tan", f64::tan)
}

fn prim_asin(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "asin", f64::asin)
}

fn prim_acos(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "acos", f64::acos)
}

fn prim_atan(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "atan", f64::atan)
}

fn prim_exp(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "exp", f64::exp)
}

fn prim_log(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "log", f64::ln)
}

fn prim_sqrt(s: &mut Vec<Cell>, _h: &mut HostIo) -> Result<(), PrimitiveError> {
    unary_float(s, "sqrt", f64::sqrt)
}

fn prim_ceil(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, "ceil")?;
    stack.push(Cell::Number(x.ceil()));
    Ok(())
}

fn prim_floor(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, "floor")?;
    stack.push(Cell::Number(x.floor()));
    Ok(())
}

// ── String primitives ──

fn prim_chr(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let x = pop_number(stack, "chr")?;
    let code = x
        .to_u32()
        .and_then(char::from_u32)
        .ok_or_else(|| precondition("chr", format!("not a character code: {}", x)))?;
    stack.push(Cell::String(code.to_string().into()));
    Ok(())
}

fn prim_ord(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let s = pop_string(stack, "ord")?;
    let text = std::str::from_utf8(s.as_bytes())
        .map_err(|_| precondition("ord", "argument is not valid UTF-8"))?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => {
            stack.push(Cell::Number(Number::from_u32(c as u32)));
            Ok(())
        }
        _ => Err(precondition("ord", format!("expected one character, got {:?}", text))),
    }
}

fn prim_concat(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let b = pop_string(stack, "concat")?;
    let a = pop_string(stack, "concat")?;
    stack.push(Cell::String(a.concat(&b)));
    Ok(())
}

fn prim_substring(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let length = pop_index(stack, "substring")?;
    let offset = pop_index(stack, "substring")?;
    let s = pop_string(stack, "substring")?;
    stack.push(Cell::String(s.substring(offset, length)));
    Ok(())
}

fn prim_splice(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let length = pop_index(stack, "splice")?;
    let offset = pop_index(stack, "splice")?;
    let s = pop_string(stack, "splice")?;
    let replacement = pop_string(stack, "splice")?;
    stack.push(Cell::String(s.splice(&replacement, offset, length)));
    Ok(())
}

fn prim_length(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let s = pop_string(stack, "length")?;
    stack.push(Cell::Number(Number::from_i64(s.len() as i64)));
    Ok(())
}

// ── I/O, process, time ──

fn prim_print(stack: &mut Vec<Cell>, host: &mut HostIo) -> Result<(), PrimitiveError> {
    let s = pop_string(stack, "print")?;
    host.print(s.to_string());
    Ok(())
}

fn prim_input(stack: &mut Vec<Cell>, host: &mut HostIo) -> Result<(), PrimitiveError> {
    let prompt = pop_string(stack, "input")?;
    let line = host.input(&prompt.to_string());
    stack.push(Cell::String(line.into()));
    Ok(())
}

fn prim_exit(stack: &mut Vec<Cell>, host: &mut HostIo) -> Result<(), PrimitiveError> {
    let code = pop_number(stack, "exit")?;
    let code = code
        .to_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| precondition("exit", format!("not an exit code: {}", code)))?;
    host.request_exit(code);
    Ok(())
}

fn prim_argv(stack: &mut Vec<Cell>, host: &mut HostIo) -> Result<(), PrimitiveError> {
    let args = host
        .argv
        .iter()
        .map(|a| Cell::String(a.as_str().into()))
        .collect();
    stack.push(Cell::Array(args));
    Ok(())
}

fn prim_now(stack: &mut Vec<Cell>, _host: &mut HostIo) -> Result<(), PrimitiveError> {
    let millis = chrono::Utc::now().timestamp_millis();
    let seconds = Number::from_i64(millis)
        .div(&Number::from_i64(1000))
        .map_err(|_| precondition("now", "clock unavailable"))?;
    stack.push(Cell::Number(seconds));
    Ok(())
}
