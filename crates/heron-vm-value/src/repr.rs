//! Machine encodings
//!
//! ## NaN-box (one word)
//!
//! ```text
//! Double:     raw IEEE bits (every NaN stored as 0x7FFA_0000_0000_0000)
//! Int32:      0x7FF8_0001_XXXX_XXXX
//! Cell:       0x7FFC_0000_XXXX_XXXX (cell index)
//! Undefined:  0x7FF8_0000_0000_0000
//! Null:       0x7FF8_0000_0000_0001
//! True:       0x7FF8_0000_0000_0002
//! False:      0x7FF8_0000_0000_0003
//! ```
//!
//! ## Tag/payload (tag word in the high half, payload word in the low half)
//!
//! ```text
//! Int32:      0xFFFF_FFFF : i32
//! Boolean:    0xFFFF_FFFE : 0 | 1
//! Null:       0xFFFF_FFFD : 0
//! Undefined:  0xFFFF_FFFC : 0
//! Cell:       0xFFFF_FFFB : cell index
//! Double:     any tag below 0xFFFF_FFFB, whole word is the IEEE bits
//! ```
//!
//! Neither encoding validates its input. Unboxing with the wrong accessor is
//! a caller bug.

use serde::{Deserialize, Serialize};

use crate::value::{CellId, Tag, Value};

/// Operations every value encoding provides.
pub trait ValueRepr {
    const NAME: &'static str;
    const UNDEFINED: u64;
    const NULL: u64;
    const TRUE: u64;
    const FALSE: u64;
    /// Word every NaN is boxed as
    const CANONICAL_NAN: u64;
    /// Word returned by generated code and stubs when an exception is pending.
    /// No encoded value equals it.
    const EXCEPTION_SENTINEL: u64;

    fn tag_of(bits: u64) -> Tag;

    fn box_int32(n: i32) -> u64;
    fn box_double(d: f64) -> u64;
    fn box_cell(id: CellId) -> u64;

    #[inline]
    fn box_bool(b: bool) -> u64 {
        if b { Self::TRUE } else { Self::FALSE }
    }

    #[inline]
    fn unbox_int32(bits: u64) -> i32 {
        debug_assert!(Self::is_int32(bits));
        bits as u32 as i32
    }

    #[inline]
    fn unbox_double(bits: u64) -> f64 {
        debug_assert!(Self::is_double(bits));
        f64::from_bits(bits)
    }

    #[inline]
    fn unbox_cell(bits: u64) -> CellId {
        debug_assert!(Self::is_cell(bits));
        CellId(bits as u32)
    }

    #[inline]
    fn unbox_bool(bits: u64) -> bool {
        debug_assert!(bits == Self::TRUE || bits == Self::FALSE);
        bits == Self::TRUE
    }

    #[inline]
    fn is_int32(bits: u64) -> bool {
        Self::tag_of(bits) == Tag::Int32
    }

    #[inline]
    fn is_double(bits: u64) -> bool {
        Self::tag_of(bits) == Tag::Double
    }

    #[inline]
    fn is_cell(bits: u64) -> bool {
        Self::tag_of(bits) == Tag::Cell
    }

    #[inline]
    fn is_number(bits: u64) -> bool {
        matches!(Self::tag_of(bits), Tag::Int32 | Tag::Double)
    }

    fn encode(value: Value) -> u64 {
        match value {
            Value::Undefined => Self::UNDEFINED,
            Value::Null => Self::NULL,
            Value::Boolean(b) => Self::box_bool(b),
            Value::Int32(n) => Self::box_int32(n),
            Value::Double(d) => Self::box_double(d),
            Value::Cell(id) => Self::box_cell(id),
        }
    }

    fn decode(bits: u64) -> Value {
        match Self::tag_of(bits) {
            Tag::Undefined => Value::Undefined,
            Tag::Null => Value::Null,
            Tag::Boolean => Value::Boolean(bits == Self::TRUE),
            Tag::Int32 => Value::Int32(Self::unbox_int32(bits)),
            Tag::Double => Value::Double(Self::unbox_double(bits)),
            Tag::Cell => Value::Cell(Self::unbox_cell(bits)),
        }
    }
}

/// Pointer-width NaN-boxed encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct NanBox;

impl NanBox {
    pub const QUIET_NAN: u64 = 0x7FF8_0000_0000_0000;
    pub const TAG_INT32: u64 = 0x7FF8_0001_0000_0000;
    pub const TAG_CELL: u64 = 0x7FFC_0000_0000_0000;
    pub const INT32_TAG_MASK: u64 = 0xFFFF_FFFF_0000_0000;
    pub const CELL_TAG_MASK: u64 = 0xFFFF_0000_0000_0000;
}

impl ValueRepr for NanBox {
    const NAME: &'static str = "nan-box";
    const UNDEFINED: u64 = 0x7FF8_0000_0000_0000;
    const NULL: u64 = 0x7FF8_0000_0000_0001;
    const TRUE: u64 = 0x7FF8_0000_0000_0002;
    const FALSE: u64 = 0x7FF8_0000_0000_0003;
    const CANONICAL_NAN: u64 = 0x7FFA_0000_0000_0000;
    const EXCEPTION_SENTINEL: u64 = 0x7FFE_0000_0000_0000;

    #[inline]
    fn tag_of(bits: u64) -> Tag {
        if bits & Self::QUIET_NAN != Self::QUIET_NAN || bits == Self::CANONICAL_NAN {
            Tag::Double
        } else if bits & Self::CELL_TAG_MASK == Self::TAG_CELL {
            Tag::Cell
        } else if bits & Self::INT32_TAG_MASK == Self::TAG_INT32 {
            Tag::Int32
        } else if bits == Self::UNDEFINED {
            Tag::Undefined
        } else if bits == Self::NULL {
            Tag::Null
        } else {
            debug_assert!(bits == Self::TRUE || bits == Self::FALSE, "bad word {bits:#x}");
            Tag::Boolean
        }
    }

    #[inline]
    fn box_int32(n: i32) -> u64 {
        Self::TAG_INT32 | u64::from(n as u32)
    }

    #[inline]
    fn box_double(d: f64) -> u64 {
        if d.is_nan() {
            Self::CANONICAL_NAN
        } else {
            d.to_bits()
        }
    }

    #[inline]
    fn box_cell(id: CellId) -> u64 {
        Self::TAG_CELL | u64::from(id.0)
    }

    #[inline]
    fn is_int32(bits: u64) -> bool {
        bits & Self::INT32_TAG_MASK == Self::TAG_INT32
    }

    #[inline]
    fn is_double(bits: u64) -> bool {
        bits & Self::QUIET_NAN != Self::QUIET_NAN || bits == Self::CANONICAL_NAN
    }

    #[inline]
    fn is_cell(bits: u64) -> bool {
        bits & Self::CELL_TAG_MASK == Self::TAG_CELL
    }
}

/// Tag-word/payload-word pair encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct TagPayload;

impl TagPayload {
    pub const INT32_TAG: u32 = 0xFFFF_FFFF;
    pub const BOOLEAN_TAG: u32 = 0xFFFF_FFFE;
    pub const NULL_TAG: u32 = 0xFFFF_FFFD;
    pub const UNDEFINED_TAG: u32 = 0xFFFF_FFFC;
    pub const CELL_TAG: u32 = 0xFFFF_FFFB;
    /// Tag words below this mark doubles
    pub const LOWEST_TAG: u32 = Self::CELL_TAG;

    #[inline]
    pub const fn pack(tag: u32, payload: u32) -> u64 {
        ((tag as u64) << 32) | payload as u64
    }

    #[inline]
    pub const fn tag_word(bits: u64) -> u32 {
        (bits >> 32) as u32
    }

    #[inline]
    pub const fn payload_word(bits: u64) -> u32 {
        bits as u32
    }
}

impl ValueRepr for TagPayload {
    const NAME: &'static str = "tag-payload";
    const UNDEFINED: u64 = Self::pack(Self::UNDEFINED_TAG, 0);
    const NULL: u64 = Self::pack(Self::NULL_TAG, 0);
    const TRUE: u64 = Self::pack(Self::BOOLEAN_TAG, 1);
    const FALSE: u64 = Self::pack(Self::BOOLEAN_TAG, 0);
    const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;
    const EXCEPTION_SENTINEL: u64 = 0xFFFF_FFF0_0000_0000;

    #[inline]
    fn tag_of(bits: u64) -> Tag {
        match Self::tag_word(bits) {
            Self::INT32_TAG => Tag::Int32,
            Self::BOOLEAN_TAG => Tag::Boolean,
            Self::NULL_TAG => Tag::Null,
            Self::UNDEFINED_TAG => Tag::Undefined,
            Self::CELL_TAG => Tag::Cell,
            _ => Tag::Double,
        }
    }

    #[inline]
    fn box_int32(n: i32) -> u64 {
        Self::pack(Self::INT32_TAG, n as u32)
    }

    #[inline]
    fn box_double(d: f64) -> u64 {
        if d.is_nan() {
            Self::CANONICAL_NAN
        } else {
            d.to_bits()
        }
    }

    #[inline]
    fn box_cell(id: CellId) -> u64 {
        Self::pack(Self::CELL_TAG, id.0)
    }

    #[inline]
    fn is_int32(bits: u64) -> bool {
        Self::tag_word(bits) == Self::INT32_TAG
    }

    #[inline]
    fn is_double(bits: u64) -> bool {
        Self::tag_word(bits) < Self::LOWEST_TAG
    }

    #[inline]
    fn is_cell(bits: u64) -> bool {
        Self::tag_word(bits) == Self::CELL_TAG
    }
}

/// Encoding selected at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    #[default]
    NanBox,
    TagPayload,
}

macro_rules! dispatch {
    ($self:expr, $repr:ident => $body:expr) => {
        match $self {
            Encoding::NanBox => {
                type $repr = NanBox;
                $body
            }
            Encoding::TagPayload => {
                type $repr = TagPayload;
                $body
            }
        }
    };
}

impl Encoding {
    pub const ALL: [Encoding; 2] = [Encoding::NanBox, Encoding::TagPayload];

    pub fn name(self) -> &'static str {
        dispatch!(self, R => R::NAME)
    }

    #[inline]
    pub fn encode(self, value: Value) -> u64 {
        dispatch!(self, R => R::encode(value))
    }

    #[inline]
    pub fn decode(self, bits: u64) -> Value {
        dispatch!(self, R => R::decode(bits))
    }

    #[inline]
    pub fn tag_of(self, bits: u64) -> Tag {
        dispatch!(self, R => R::tag_of(bits))
    }

    #[inline]
    pub fn undefined(self) -> u64 {
        dispatch!(self, R => R::UNDEFINED)
    }

    #[inline]
    pub fn null(self) -> u64 {
        dispatch!(self, R => R::NULL)
    }

    #[inline]
    pub fn boolean(self, b: bool) -> u64 {
        dispatch!(self, R => R::box_bool(b))
    }

    #[inline]
    pub fn int32(self, n: i32) -> u64 {
        dispatch!(self, R => R::box_int32(n))
    }

    #[inline]
    pub fn double(self, d: f64) -> u64 {
        dispatch!(self, R => R::box_double(d))
    }

    #[inline]
    pub fn cell(self, id: CellId) -> u64 {
        dispatch!(self, R => R::box_cell(id))
    }

    #[inline]
    pub fn is_cell(self, bits: u64) -> bool {
        dispatch!(self, R => R::is_cell(bits))
    }

    #[inline]
    pub fn is_int32(self, bits: u64) -> bool {
        dispatch!(self, R => R::is_int32(bits))
    }

    /// Cell handle if the word holds one
    #[inline]
    pub fn as_cell(self, bits: u64) -> Option<CellId> {
        dispatch!(self, R => R::is_cell(bits).then(|| R::unbox_cell(bits)))
    }

    #[inline]
    pub fn exception_sentinel(self) -> u64 {
        dispatch!(self, R => R::EXCEPTION_SENTINEL)
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nan-box" | "nanbox" => Ok(Self::NanBox),
            "tag-payload" | "tagpayload" => Ok(Self::TagPayload),
            other => Err(format!("unknown value encoding '{other}'")),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
