//! Host-side I/O and process state for the executor and primitives.
//!
//! Output is always captured into `output` so tests and embedders can
//! inspect it; echoing to stdout is optional. Input can be scripted
//! the same way, which keeps the `input` primitive testable without a
//! terminal.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

#[derive(Debug, Default)]
pub struct HostIo {
    /// Every line printed by the program, in order.
    pub output: Vec<String>,
    /// Command-line arguments exposed through the `argv` primitive.
    pub argv: Vec<String>,
    scripted_input: Option<VecDeque<String>>,
    echo: bool,
    exit_code: Option<i32>,
}

impl HostIo {
    /// Host that echoes to stdout and reads stdin.
    pub fn new() -> Self {
        HostIo { echo: true, ..Default::default() }
    }

    /// Silent host with scripted input lines, for tests and embedding.
    pub fn captured(input: Vec<String>) -> Self {
        HostIo {
            scripted_input: Some(input.into()),
            ..Default::default()
        }
    }

    pub fn print(&mut self, line: String) {
        if self.echo {
            println!("{}", line);
        }
        self.output.push(line);
    }

    /// Write `prompt` without a newline, then read one input line.
    /// Scripted input returns the next line; an exhausted script or a
    /// closed stdin yields an empty string.
    pub fn input(&mut self, prompt: &str) -> String {
        if let Some(script) = &mut self.scripted_input {
            return script.pop_front().unwrap_or_default();
        }
        print!("{}", prompt);
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_ok() {
            line.truncate(line.trim_end_matches(['\r', '\n']).len());
        }
        line
    }

    /// Request termination with `code`; the executor halts after the
    /// current instruction completes.
    pub fn request_exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    pub fn exit_requested(&self) -> Option<i32> {
        self.exit_code
    }
}
