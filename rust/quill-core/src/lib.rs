//! Quill Core
//!
//! Shared value types used across the compiler and VM: the decimal
//! `Number`, the `ByteString` buffer, the `OrderedDict` container, and
//! the tagged `Cell` runtime value.

pub mod cell;
pub mod dict;
pub mod number;
pub mod strings;

pub use cell::{Address, Cell, CellTag, PathSegment, Slot, ValueError};
pub use dict::OrderedDict;
pub use number::{Number, NumberError};
pub use strings::ByteString;
