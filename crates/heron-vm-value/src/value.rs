//! Decoded values

use serde::{Deserialize, Serialize};

/// Handle to a heap cell.
///
/// The heap keeps a stable table of cell pointers; the handle is an index into
/// it. Both encodings store the index in the low 32 bits of the word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub u32);

impl CellId {
    /// Index into the heap's cell table
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Runtime type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Int32,
    Double,
    Boolean,
    Null,
    Undefined,
    Cell,
}

impl Tag {
    /// Lowercase type name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Cell => "cell",
        }
    }
}

/// A decoded dynamically typed value.
///
/// Equality is identity of representation: `Int32(1)` and `Double(1.0)` are
/// different values, `+0.0` and `-0.0` differ, and every NaN equals every
/// other NaN. Language-level equality lives in the engine.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    Double(f64),
    Cell(CellId),
}

impl Value {
    /// Runtime tag of this value
    #[inline]
    pub const fn tag(&self) -> Tag {
        match self {
            Self::Undefined => Tag::Undefined,
            Self::Null => Tag::Null,
            Self::Boolean(_) => Tag::Boolean,
            Self::Int32(_) => Tag::Int32,
            Self::Double(_) => Tag::Double,
            Self::Cell(_) => Tag::Cell,
        }
    }

    #[inline]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[inline]
    pub const fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    #[inline]
    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Int32(_) | Self::Double(_))
    }

    #[inline]
    pub const fn as_int32(&self) -> Option<i32> {
        match self {
            Self::Int32(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_cell(&self) -> Option<CellId> {
        match self {
            Self::Cell(id) => Some(*id),
            _ => None,
        }
    }

    /// Numeric value for Int32 and Double
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// ToNumber for non-cell values. Cells need the heap and return `None`.
    pub fn to_number_primitive(&self) -> Option<f64> {
        match self {
            Self::Undefined => Some(f64::NAN),
            Self::Null => Some(0.0),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Double(d) => Some(*d),
            Self::Cell(_) => None,
        }
    }

    /// ToBoolean for non-cell values. Cells need the heap and return `None`.
    pub fn truthy_primitive(&self) -> Option<bool> {
        match self {
            Self::Undefined | Self::Null => Some(false),
            Self::Boolean(b) => Some(*b),
            Self::Int32(n) => Some(*n != 0),
            Self::Double(d) => Some(!(d.is_nan() || *d == 0.0)),
            Self::Cell(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Self::Cell(a), Self::Cell(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int32(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<CellId> for Value {
    fn from(id: CellId) -> Self {
        Self::Cell(id)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int32(n) => write!(f, "{n}"),
            Self::Double(d) if d.is_nan() => f.write_str("NaN"),
            Self::Double(d) if d.is_infinite() => {
                f.write_str(if *d > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Self::Double(d) => write!(f, "{d:?}"),
            Self::Cell(id) => write!(f, "<cell #{}>", id.0),
        }
    }
}
