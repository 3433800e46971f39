//! Heron VM - tagged values
//!
//! Dynamically typed values and their two machine encodings. Registers in the
//! register file hold encoded `u64` words; [`Value`] is the decoded form used
//! by host code, stubs and tests.

#![warn(clippy::all)]

pub mod arith;
pub mod repr;
pub mod value;

pub use arith::{ArithOp, BitOp, Number, RelOp};
pub use repr::{Encoding, NanBox, TagPayload, ValueRepr};
pub use value::{CellId, Tag, Value};
