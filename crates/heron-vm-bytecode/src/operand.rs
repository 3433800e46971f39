//! Instruction operands

use serde::{Deserialize, Serialize};

/// Call frame header layout, in words from the frame pointer.
///
/// ```text
///   fp + 6 + k   argument k (argument 0 is `this`)
///   fp + 5       Scope
///   fp + 4       ArgumentCount (low 32: count incl. this, high 32: bytecode offset)
///   fp + 3       Callee
///   fp + 2       CodeBlock
///   fp + 1       ReturnLocation
///   fp + 0       CallerFrame
///   fp - 1 - i   local i
/// ```
pub mod header {
    pub const CALLER_FRAME: i32 = 0;
    pub const RETURN_LOCATION: i32 = 1;
    pub const CODE_BLOCK: i32 = 2;
    pub const CALLEE: i32 = 3;
    pub const ARGUMENT_COUNT: i32 = 4;
    pub const SCOPE: i32 = 5;
    pub const SIZE: i32 = 6;
    pub const THIS_ARGUMENT: i32 = SIZE;
}

/// Operand values at or above this index name constant-pool entries.
pub const FIRST_CONSTANT_REGISTER: i32 = 0x4000_0000;

/// A frame-relative register operand.
///
/// Locals are negative, header slots and arguments non-negative, and values
/// at or above [`FIRST_CONSTANT_REGISTER`] refer to the constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualRegister(pub i32);

impl VirtualRegister {
    #[inline]
    pub const fn local(index: u32) -> Self {
        Self(-1 - index as i32)
    }

    /// Argument `k`; argument 0 is `this`
    #[inline]
    pub const fn argument(k: u32) -> Self {
        Self(header::SIZE + k as i32)
    }

    #[inline]
    pub const fn constant(index: u32) -> Self {
        Self(FIRST_CONSTANT_REGISTER + index as i32)
    }

    #[inline]
    pub const fn is_constant(self) -> bool {
        self.0 >= FIRST_CONSTANT_REGISTER
    }

    #[inline]
    pub const fn is_local(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn is_argument(self) -> bool {
        self.0 >= header::SIZE && !self.is_constant()
    }

    pub const fn to_local(self) -> Option<u32> {
        if self.is_local() {
            Some((-1 - self.0) as u32)
        } else {
            None
        }
    }

    pub const fn to_argument(self) -> Option<u32> {
        if self.is_argument() {
            Some((self.0 - header::SIZE) as u32)
        } else {
            None
        }
    }

    pub const fn to_constant(self) -> Option<u32> {
        if self.is_constant() {
            Some((self.0 - FIRST_CONSTANT_REGISTER) as u32)
        } else {
            None
        }
    }

    /// Frame offset in words. Meaningless for constants.
    #[inline]
    pub const fn offset(self) -> i32 {
        self.0
    }

    /// Slot encoding inside the instruction stream
    #[inline]
    pub const fn to_slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn from_slot(slot: u32) -> Self {
        Self(slot as i32)
    }
}

impl std::fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(c) = self.to_constant() {
            write!(f, "k{c}")
        } else if let Some(l) = self.to_local() {
            write!(f, "loc{l}")
        } else if self.0 == header::THIS_ARGUMENT {
            f.write_str("this")
        } else if let Some(a) = self.to_argument() {
            write!(f, "arg{a}")
        } else {
            write!(f, "hdr{}", self.0)
        }
    }
}
