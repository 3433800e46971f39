//! Memory layouts shared between generated code and the runtime.
//!
//! Generated code addresses [`JitContext`] fields, heap cells and frame
//! header slots by byte offset. The runtime that fills these structures
//! asserts the offsets at compile time.

use std::mem::offset_of;
use std::sync::atomic::AtomicBool;

use heron_vm_bytecode::header;

/// Per-engine state handed to every compiled function and stub.
#[derive(Debug)]
#[repr(C)]
pub struct JitContext {
    /// Owning runtime; opaque to generated code
    pub runtime: *mut u8,
    /// Base of the cell table: `cells[index]` is the address of that cell
    pub cells: *const *mut u8,
    /// Word 0 of the register file; frames never extend below it
    pub register_base: *mut u64,
    /// Set by another thread to request termination
    pub terminate: *const AtomicBool,
    pub call_depth: u32,
    pub max_call_depth: u32,
}

impl JitContext {
    pub const RUNTIME_OFFSET: i32 = offset_of!(JitContext, runtime) as i32;
    pub const CELLS_OFFSET: i32 = offset_of!(JitContext, cells) as i32;
    pub const REGISTER_BASE_OFFSET: i32 = offset_of!(JitContext, register_base) as i32;
    pub const TERMINATE_OFFSET: i32 = offset_of!(JitContext, terminate) as i32;
    pub const CALL_DEPTH_OFFSET: i32 = offset_of!(JitContext, call_depth) as i32;
    pub const MAX_CALL_DEPTH_OFFSET: i32 = offset_of!(JitContext, max_call_depth) as i32;

    pub fn new(max_call_depth: u32) -> Self {
        Self {
            runtime: std::ptr::null_mut(),
            cells: std::ptr::null(),
            register_base: std::ptr::null_mut(),
            terminate: std::ptr::null(),
            call_depth: 0,
            max_call_depth,
        }
    }
}

/// Heap cell header. The runtime's cell type starts with exactly these
/// fields in this order.
///
/// ```text
/// 0   kind       u32
/// 4   structure  u32   StructureId, NO_STRUCTURE for non-objects
/// 8   storage    *mut u64  property slots
/// 16  char_code  u32   code point of a one-character string, else u32::MAX
/// 20  length     u32
/// 24  scope      u64   encoded scope of a function cell
/// ```
pub mod cell {
    pub const KIND: i32 = 0;
    pub const STRUCTURE: i32 = 4;
    pub const STORAGE: i32 = 8;
    pub const CHAR_CODE: i32 = 16;
    pub const LENGTH: i32 = 20;
    pub const SCOPE: i32 = 24;
    /// `structure` of every cell that is not an object. Differs from
    /// `StructureId::INVALID` so an empty patch site never matches it.
    pub const NO_STRUCTURE: u32 = u32::MAX - 1;
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 32;
    /// `char_code` of every cell that is not a one-character string
    pub const NO_CHAR_CODE: u32 = u32::MAX;
}

/// Byte offsets of frame header slots
pub mod frame {
    use super::header;

    pub const CALLER_FRAME: i32 = header::CALLER_FRAME * 8;
    pub const RETURN_LOCATION: i32 = header::RETURN_LOCATION * 8;
    pub const CODE_BLOCK: i32 = header::CODE_BLOCK * 8;
    pub const CALLEE: i32 = header::CALLEE * 8;
    pub const ARGUMENT_COUNT: i32 = header::ARGUMENT_COUNT * 8;
    /// High half of the argument-count word on a little-endian target
    pub const BYTECODE_OFFSET: i32 = ARGUMENT_COUNT + 4;
    pub const SCOPE: i32 = header::SCOPE * 8;

    /// `CODE_BLOCK` slot flag marking a frame run by generated code
    pub const JIT_FRAME_FLAG: u64 = 1 << 32;

    /// Byte offset of register `offset` from the frame pointer
    #[inline]
    pub const fn register(offset: i32) -> i32 {
        offset * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_fields_are_word_aligned() {
        assert_eq!(JitContext::RUNTIME_OFFSET, 0);
        assert_eq!(JitContext::CELLS_OFFSET, 8);
        assert_eq!(JitContext::REGISTER_BASE_OFFSET, 16);
        assert_eq!(JitContext::TERMINATE_OFFSET, 24);
        assert_eq!(JitContext::CALL_DEPTH_OFFSET, 32);
        assert_eq!(JitContext::MAX_CALL_DEPTH_OFFSET, 36);
    }

    #[test]
    fn bytecode_offset_is_high_half_of_argument_count() {
        let mut word = 3u64;
        let bytes = word.to_le_bytes();
        let mut patched = bytes;
        patched[4..8].copy_from_slice(&17u32.to_le_bytes());
        word = u64::from_le_bytes(patched);
        assert_eq!(word as u32, 3);
        assert_eq!((word >> 32) as u32, 17);
        assert_eq!(frame::BYTECODE_OFFSET - frame::ARGUMENT_COUNT, 4);
    }
}
