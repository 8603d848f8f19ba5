//! The tagged `Cell` value — the runtime's only value type.
//!
//! A cell owns its payload outright: arrays and dictionaries own every
//! nested cell, `Clone` is a deep copy, and dropping a cell releases
//! the whole tree. The only aliasing values are `Address` (a slot path
//! into VM storage, resolved by the executor) and `Pointer` (an opaque
//! external handle); neither owns its referent, so ordinary values are
//! acyclic by construction.

use crate::dict::OrderedDict;
use crate::number::Number;
use crate::strings::ByteString;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque external handle carried by `Cell::Pointer`.
pub type Handle = u64;

/// Discriminant of a cell, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellTag {
    Nothing,
    Boolean,
    Number,
    String,
    Array,
    Dictionary,
    Address,
    Pointer,
}

impl fmt::Display for CellTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Storage base an `Address` points into. All variants are indices into
/// executor-owned storage, never raw references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    /// Module-global slot of the executing module.
    Global(usize),
    /// Predefined global owned by the host (e.g. `argv`).
    Predef(usize),
    /// Global slot of another loaded module.
    Module { module: usize, slot: usize },
    /// Local slot of a frame, by absolute frame index.
    Local { frame: usize, slot: usize },
    /// Heap record created by the `Alloc` instruction.
    Heap(usize),
}

/// One step of the path from an address base to the referenced cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Element(usize),
    Key(ByteString),
}

/// Non-owning reference to a cell in VM storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Null,
    Slot { base: Slot, path: Vec<PathSegment> },
}

impl Address {
    pub fn slot(base: Slot) -> Self {
        Address::Slot { base, path: Vec::new() }
    }

    /// Extend the path one level down into an array or dictionary.
    pub fn child(&self, segment: PathSegment) -> Option<Address> {
        match self {
            Address::Null => None,
            Address::Slot { base, path } => {
                let mut path = path.clone();
                path.push(segment);
                Some(Address::Slot { base: base.clone(), path })
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("cell type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: CellTag, found: CellTag },
    #[error("comparing cells of different types: {left} vs {right}")]
    ComparisonTagMismatch { left: CellTag, right: CellTag },
    #[error("array index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: usize, size: usize },
}

/// Tagged-union runtime value. `Clone` is a deep copy for the owning
/// variants and a reference copy for `Address`/`Pointer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Cell {
    #[default]
    Nothing,
    Boolean(bool),
    Number(Number),
    String(ByteString),
    Array(Vec<Cell>),
    Dictionary(OrderedDict),
    Address(Address),
    Pointer(Handle),
}

impl Cell {
    pub fn tag(&self) -> CellTag {
        match self {
            Cell::Nothing => CellTag::Nothing,
            Cell::Boolean(_) => CellTag::Boolean,
            Cell::Number(_) => CellTag::Number,
            Cell::String(_) => CellTag::String,
            Cell::Array(_) => CellTag::Array,
            Cell::Dictionary(_) => CellTag::Dictionary,
            Cell::Address(_) => CellTag::Address,
            Cell::Pointer(_) => CellTag::Pointer,
        }
    }

    /// Release all owned children and reset to `Nothing`.
    pub fn clear(&mut self) {
        *self = Cell::Nothing;
    }

    fn mismatch(&self, expected: CellTag) -> ValueError {
        ValueError::TypeMismatch { expected, found: self.tag() }
    }

    pub fn as_boolean(&self) -> Result<bool, ValueError> {
        match self {
            Cell::Boolean(b) => Ok(*b),
            other => Err(other.mismatch(CellTag::Boolean)),
        }
    }

    pub fn as_number(&self) -> Result<&Number, ValueError> {
        match self {
            Cell::Number(n) => Ok(n),
            other => Err(other.mismatch(CellTag::Number)),
        }
    }

    pub fn as_string(&self) -> Result<&ByteString, ValueError> {
        match self {
            Cell::String(s) => Ok(s),
            other => Err(other.mismatch(CellTag::String)),
        }
    }

    pub fn as_array(&self) -> Result<&Vec<Cell>, ValueError> {
        match self {
            Cell::Array(a) => Ok(a),
            other => Err(other.mismatch(CellTag::Array)),
        }
    }

    pub fn as_dictionary(&self) -> Result<&OrderedDict, ValueError> {
        match self {
            Cell::Dictionary(d) => Ok(d),
            other => Err(other.mismatch(CellTag::Dictionary)),
        }
    }

    pub fn as_address(&self) -> Result<&Address, ValueError> {
        match self {
            Cell::Address(a) => Ok(a),
            other => Err(other.mismatch(CellTag::Address)),
        }
    }

    pub fn as_pointer(&self) -> Result<Handle, ValueError> {
        match self {
            Cell::Pointer(p) => Ok(*p),
            other => Err(other.mismatch(CellTag::Pointer)),
        }
    }

    /// Promote a `Nothing` cell to an empty array. Any other non-array
    /// tag is a type error.
    fn vivify_array(&mut self) -> Result<&mut Vec<Cell>, ValueError> {
        if matches!(self, Cell::Nothing) {
            *self = Cell::Array(Vec::new());
        }
        match self {
            Cell::Array(a) => Ok(a),
            other => Err(other.mismatch(CellTag::Array)),
        }
    }

    fn vivify_dictionary(&mut self) -> Result<&mut OrderedDict, ValueError> {
        if matches!(self, Cell::Nothing) {
            *self = Cell::Dictionary(OrderedDict::new());
        }
        match self {
            Cell::Dictionary(d) => Ok(d),
            other => Err(other.mismatch(CellTag::Dictionary)),
        }
    }

    /// Read access to element `i`; out of bounds is a contract failure
    /// surfaced as an error, never a silent default.
    pub fn array_index_for_read(&mut self, i: usize) -> Result<&Cell, ValueError> {
        let a = self.vivify_array()?;
        let size = a.len();
        a.get(i).ok_or(ValueError::IndexOutOfBounds { index: i, size })
    }

    /// Write access to element `i`, growing the array to `i + 1` and
    /// filling new slots with `Nothing`. Existing slots are untouched.
    pub fn array_index_for_write(&mut self, i: usize) -> Result<&mut Cell, ValueError> {
        let a = self.vivify_array()?;
        if i >= a.len() {
            a.resize(i + 1, Cell::Nothing);
        }
        Ok(&mut a[i])
    }

    /// Deep-copy `e` onto the end of the array.
    pub fn array_append(&mut self, e: &Cell) -> Result<(), ValueError> {
        self.vivify_array()?.push(e.clone());
        Ok(())
    }

    /// Linear membership scan using structural comparison.
    pub fn array_element_exists(&self, e: &Cell) -> Result<bool, ValueError> {
        for element in self.as_array()? {
            if element.compare(e)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Value under `key`, inserting `Nothing` in sorted position when
    /// absent. Never duplicates a key.
    pub fn dictionary_index_for_write(&mut self, key: &ByteString) -> Result<&mut Cell, ValueError> {
        Ok(self.vivify_dictionary()?.entry(key))
    }

    /// Existing value under `key`, or `None`; never inserts on read.
    pub fn dictionary_index_for_read(&mut self, key: &ByteString) -> Result<Option<&Cell>, ValueError> {
        Ok(self.vivify_dictionary()?.get(key))
    }

    /// Structural equality. Both cells must carry the same tag; a
    /// mismatch is a contract violation reported to the caller.
    ///
    /// Arrays and dictionaries compare element-wise. The original
    /// runtime only compared container sizes here; that was an
    /// unfinished placeholder and full structural equality is the
    /// specified behavior.
    pub fn compare(&self, other: &Cell) -> Result<bool, ValueError> {
        match (self, other) {
            (Cell::Nothing, Cell::Nothing) => Ok(true),
            (Cell::Boolean(a), Cell::Boolean(b)) => Ok(a == b),
            (Cell::Number(a), Cell::Number(b)) => Ok(a == b),
            (Cell::String(a), Cell::String(b)) => Ok(a == b),
            (Cell::Array(a), Cell::Array(b)) => {
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b) {
                    if !x.compare(y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Cell::Dictionary(a), Cell::Dictionary(b)) => {
                if a.len() != b.len() {
                    return Ok(false);
                }
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    if ka != kb || !va.compare(vb)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            // Reference identity, not referent comparison.
            (Cell::Address(a), Cell::Address(b)) => Ok(a == b),
            (Cell::Pointer(a), Cell::Pointer(b)) => Ok(a == b),
            (a, b) => Err(ValueError::ComparisonTagMismatch { left: a.tag(), right: b.tag() }),
        }
    }
}

impl PartialEq for Cell {
    /// Same-tag structural equality; mismatched tags are unequal here
    /// (the checked contract lives in [`Cell::compare`]).
    fn eq(&self, other: &Self) -> bool {
        self.compare(other).unwrap_or(false)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Nothing => write!(f, "nothing"),
            Cell::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Cell::Number(n) => write!(f, "{}", n),
            Cell::String(s) => write!(f, "{}", s),
            Cell::Array(a) => {
                let items: Vec<String> = a.iter().map(|c| c.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Cell::Dictionary(d) => {
                let items: Vec<String> =
                    d.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Cell::Address(_) => write!(f, "<address>"),
            Cell::Pointer(p) => write!(f, "<pointer:{}>", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: i64) -> Cell {
        Cell::Number(Number::from_i64(v))
    }

    #[test]
    fn test_deep_copy_isolation() {
        let mut inner = Cell::Nothing;
        *inner.array_index_for_write(1).unwrap() = num(7);
        let mut d = Cell::Nothing;
        *d.dictionary_index_for_write(&"k".into()).unwrap() = inner;

        let copy = d.clone();
        assert!(copy.compare(&d).unwrap());

        // Mutating the original never affects the copy.
        *d.dictionary_index_for_write(&"k".into())
            .unwrap()
            .array_index_for_write(1)
            .unwrap() = num(99);
        assert!(!copy.compare(&d).unwrap());
        let copied_inner = copy.as_dictionary().unwrap().get(&"k".into()).unwrap();
        assert_eq!(copied_inner.as_array().unwrap()[1], num(7));
    }

    #[test]
    fn test_array_auto_grow() {
        let mut c = Cell::Nothing;
        *c.array_index_for_write(5).unwrap() = num(42);
        let a = c.as_array().unwrap();
        assert_eq!(a.len(), 6);
        for slot in &a[0..5] {
            assert!(matches!(slot, Cell::Nothing));
        }
        assert_eq!(c.array_index_for_read(5).unwrap(), &num(42));
    }

    #[test]
    fn test_array_grow_preserves_existing() {
        let mut c = Cell::Nothing;
        *c.array_index_for_write(0).unwrap() = num(1);
        *c.array_index_for_write(3).unwrap() = num(4);
        assert_eq!(c.array_index_for_read(0).unwrap(), &num(1));
        assert_eq!(c.as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_array_read_out_of_bounds() {
        let mut c = Cell::Array(vec![num(1)]);
        assert_eq!(
            c.array_index_for_read(3),
            Err(ValueError::IndexOutOfBounds { index: 3, size: 1 })
        );
    }

    #[test]
    fn test_dictionary_vivification_and_read() {
        let mut c = Cell::Nothing;
        assert_eq!(c.dictionary_index_for_read(&"missing".into()).unwrap(), None);
        // Read promoted the cell but inserted nothing.
        assert_eq!(c.as_dictionary().unwrap().len(), 0);
        *c.dictionary_index_for_write(&"k".into()).unwrap() = num(3);
        assert_eq!(
            c.dictionary_index_for_read(&"k".into()).unwrap(),
            Some(&num(3))
        );
    }

    #[test]
    fn test_scalar_round_trip() {
        for c in [num(5), Cell::Boolean(true), Cell::String("hi".into())] {
            assert!(c.clone().compare(&c).unwrap());
        }
    }

    #[test]
    fn test_structural_equality_not_size_only() {
        // Same sizes, different contents: a size-only comparison would
        // wrongly report these equal.
        let a = Cell::Array(vec![num(1), num(2)]);
        let b = Cell::Array(vec![num(1), num(3)]);
        assert!(!a.compare(&b).unwrap());

        let mut da = Cell::Nothing;
        *da.dictionary_index_for_write(&"k".into()).unwrap() = num(1);
        let mut db = Cell::Nothing;
        *db.dictionary_index_for_write(&"k".into()).unwrap() = num(2);
        assert!(!da.compare(&db).unwrap());
    }

    #[test]
    fn test_mismatched_tag_comparison_is_contract_violation() {
        let err = num(1).compare(&Cell::Boolean(true)).unwrap_err();
        assert_eq!(
            err,
            ValueError::ComparisonTagMismatch { left: CellTag::Number, right: CellTag::Boolean }
        );
    }

    #[test]
    fn test_address_copies_reference_not_referent() {
        let addr = Cell::Address(Address::slot(Slot::Global(3)));
        let copy = addr.clone();
        assert!(copy.compare(&addr).unwrap());
        let child = Address::slot(Slot::Global(3))
            .child(PathSegment::Element(0))
            .unwrap();
        assert!(!Cell::Address(child).compare(&addr).unwrap());
    }

    #[test]
    fn test_append_deep_copies() {
        let source = Cell::Array(vec![num(1)]);
        let mut target = Cell::Nothing;
        target.array_append(&source).unwrap();
        assert!(target.array_element_exists(&source).unwrap());
        assert_eq!(target.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_resets_to_nothing() {
        let mut c = Cell::Array(vec![num(1), Cell::String("s".into())]);
        c.clear();
        assert!(matches!(c, Cell::Nothing));
    }
}
