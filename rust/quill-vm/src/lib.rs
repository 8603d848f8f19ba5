//! Quill VM
//!
//! Stack-machine execution engine for emitted modules: the executor,
//! the primitive registry, and host-side I/O.

pub mod exec;
pub mod host;
pub mod registry;

pub use exec::{Executor, TraceEvent, VmError};
pub use host::HostIo;
pub use registry::{PrimitiveError, PrimitiveFn, Registry};
