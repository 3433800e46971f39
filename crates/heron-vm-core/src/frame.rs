//! Register file and call frame headers.
//!
//! The register file is one fixed block of value words. Frames grow toward
//! index 0: a callee's frame pointer is below its caller's, its header and
//! arguments sit at and above the frame pointer and its locals below it.
//!
//! A frame is named by the index of its frame pointer. Generated code sees
//! the same words through [`RegisterFile::frame_ptr`], so every access goes
//! through the one raw base pointer.

use std::ptr::NonNull;

use heron_vm_bytecode::header;
use heron_vm_jit::context::frame::JIT_FRAME_FLAG;

/// `RETURN_LOCATION` of a frame entered from the host
pub const HOST_RETURN: u64 = u64::MAX;

const HEADER_SIZE: usize = header::SIZE as usize;

pub struct RegisterFile {
    base: NonNull<u64>,
    len: usize,
}

impl RegisterFile {
    pub fn new(words: usize, fill: u64) -> Self {
        let boxed: Box<[u64]> = vec![fill; words.max(HEADER_SIZE + 1)].into_boxed_slice();
        let len = boxed.len();
        let base = NonNull::from(Box::leak(boxed)).cast::<u64>();
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Word 0, handed to generated code as the lowest legal address
    #[inline]
    pub fn base_ptr(&self) -> *mut u64 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn frame_ptr(&self, fp: usize) -> *mut u64 {
        assert!(fp < self.len, "frame {fp} outside the register file");
        // SAFETY: fp is in bounds
        unsafe { self.base.as_ptr().add(fp) }
    }

    /// Frame index of a frame pointer produced by generated code
    #[inline]
    pub fn index_of(&self, frame: *const u64) -> usize {
        (frame as usize - self.base.as_ptr() as usize) / std::mem::size_of::<u64>()
    }

    #[inline]
    fn slot(&self, fp: usize, offset: i32) -> usize {
        let index = fp as isize + offset as isize;
        assert!(
            index >= 0 && (index as usize) < self.len,
            "register {offset} of frame {fp} outside the register file"
        );
        index as usize
    }

    #[inline]
    pub fn get(&self, fp: usize, offset: i32) -> u64 {
        let index = self.slot(fp, offset);
        // SAFETY: index checked against len
        unsafe { self.base.as_ptr().add(index).read() }
    }

    #[inline]
    pub fn set(&mut self, fp: usize, offset: i32, word: u64) {
        let index = self.slot(fp, offset);
        // SAFETY: index checked against len
        unsafe { self.base.as_ptr().add(index).write(word) }
    }

    // -- header -------------------------------------------------------------

    pub fn caller_frame(&self, fp: usize) -> Option<usize> {
        (self.get(fp, header::CALLER_FRAME) as usize).checked_sub(1)
    }

    pub fn set_caller_frame(&mut self, fp: usize, caller: Option<usize>) {
        let word = caller.map_or(0, |c| c as u64 + 1);
        self.set(fp, header::CALLER_FRAME, word);
    }

    pub fn return_location(&self, fp: usize) -> u64 {
        self.get(fp, header::RETURN_LOCATION)
    }

    pub fn set_return_location(&mut self, fp: usize, location: u64) {
        self.set(fp, header::RETURN_LOCATION, location);
    }

    /// CodeBlock id and whether generated code runs the frame
    pub fn code_block(&self, fp: usize) -> (u32, bool) {
        let word = self.get(fp, header::CODE_BLOCK);
        (word as u32, word & JIT_FRAME_FLAG != 0)
    }

    pub fn set_code_block(&mut self, fp: usize, id: u32) {
        self.set(fp, header::CODE_BLOCK, u64::from(id));
    }

    pub fn callee(&self, fp: usize) -> u64 {
        self.get(fp, header::CALLEE)
    }

    pub fn set_callee(&mut self, fp: usize, callee: u64) {
        self.set(fp, header::CALLEE, callee);
    }

    /// Argument count including `this`
    pub fn argument_count(&self, fp: usize) -> u32 {
        self.get(fp, header::ARGUMENT_COUNT) as u32
    }

    pub fn set_argument_count(&mut self, fp: usize, argc: u32) {
        let word = self.get(fp, header::ARGUMENT_COUNT);
        self.set(
            fp,
            header::ARGUMENT_COUNT,
            (word & !0xFFFF_FFFF) | u64::from(argc),
        );
    }

    pub fn bytecode_offset(&self, fp: usize) -> u32 {
        (self.get(fp, header::ARGUMENT_COUNT) >> 32) as u32
    }

    #[inline]
    pub fn set_bytecode_offset(&mut self, fp: usize, offset: u32) {
        let word = self.get(fp, header::ARGUMENT_COUNT);
        self.set(
            fp,
            header::ARGUMENT_COUNT,
            (word & 0xFFFF_FFFF) | (u64::from(offset) << 32),
        );
    }

    pub fn scope(&self, fp: usize) -> u64 {
        self.get(fp, header::SCOPE)
    }

    pub fn set_scope(&mut self, fp: usize, scope: u64) {
        self.set(fp, header::SCOPE, scope);
    }

    /// Argument `k`; argument 0 is `this`
    #[inline]
    pub fn argument(&self, fp: usize, k: u32) -> u64 {
        self.get(fp, header::SIZE + k as i32)
    }

    #[inline]
    pub fn set_argument(&mut self, fp: usize, k: u32, word: u64) {
        self.set(fp, header::SIZE + k as i32, word);
    }

    // -- frame setup --------------------------------------------------------

    /// Slide a frame called with `argc` arguments down so it has room for
    /// `params`, filling the missing arguments with `fill`. Returns the new
    /// frame pointer, or `None` when the register file has no room.
    pub fn fixup_arity(&mut self, fp: usize, argc: u32, params: u32, fill: u64) -> Option<usize> {
        if argc >= params {
            return Some(fp);
        }
        let missing = (params - argc) as usize;
        let new_fp = fp.checked_sub(missing)?;
        let used = HEADER_SIZE + argc as usize;
        if fp + used > self.len {
            return None;
        }
        for i in 0..used {
            let word = self.get(fp, i as i32);
            self.set(new_fp, i as i32, word);
        }
        for k in argc..params {
            self.set_argument(new_fp, k, fill);
        }
        Some(new_fp)
    }

    /// Whether a frame at `fp` has room for `locals` below it
    #[inline]
    pub fn has_room(&self, fp: usize, locals: u32) -> bool {
        fp >= locals as usize && fp + HEADER_SIZE <= self.len
    }

    pub fn init_locals(&mut self, fp: usize, locals: u32, fill: u64) {
        for i in 0..locals as i32 {
            self.set(fp, -1 - i, fill);
        }
    }
}

impl Drop for RegisterFile {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.len);
        // SAFETY: base and len came from the boxed slice leaked in `new`
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNDEF: u64 = 0xAAAA;

    #[test]
    fn header_words_round_trip() {
        let mut rf = RegisterFile::new(64, 0);
        let fp = 40;
        rf.set_caller_frame(fp, Some(50));
        rf.set_argument_count(fp, 3);
        rf.set_bytecode_offset(fp, 17);
        assert_eq!(rf.caller_frame(fp), Some(50));
        assert_eq!(rf.argument_count(fp), 3);
        assert_eq!(rf.bytecode_offset(fp), 17);
        rf.set_argument_count(fp, 4);
        assert_eq!(rf.bytecode_offset(fp), 17);

        rf.set_caller_frame(fp, None);
        assert_eq!(rf.caller_frame(fp), None);
    }

    #[test]
    fn code_block_word_carries_the_tier() {
        let mut rf = RegisterFile::new(16, 0);
        rf.set_code_block(8, 5);
        assert_eq!(rf.code_block(8), (5, false));
        rf.set(8, header::CODE_BLOCK, 5 | JIT_FRAME_FLAG);
        assert_eq!(rf.code_block(8), (5, true));
    }

    #[test]
    fn arity_fixup_slides_the_frame_down() {
        let mut rf = RegisterFile::new(64, 0);
        let fp = 40;
        rf.set_callee(fp, 99);
        rf.set_argument_count(fp, 2);
        rf.set_argument(fp, 0, 7);
        rf.set_argument(fp, 1, 8);
        // Caller word right above the last argument must survive
        rf.set(fp, header::SIZE + 2, 1234);

        let new_fp = rf.fixup_arity(fp, 2, 4, UNDEF).unwrap();
        assert_eq!(new_fp, 38);
        assert_eq!(rf.callee(new_fp), 99);
        assert_eq!(rf.argument_count(new_fp), 2);
        assert_eq!(rf.argument(new_fp, 0), 7);
        assert_eq!(rf.argument(new_fp, 1), 8);
        assert_eq!(rf.argument(new_fp, 2), UNDEF);
        assert_eq!(rf.argument(new_fp, 3), UNDEF);
        assert_eq!(rf.get(fp, header::SIZE + 2), 1234);

        assert_eq!(rf.fixup_arity(fp, 3, 2, UNDEF), Some(fp));
        assert_eq!(rf.fixup_arity(1, 1, 4, UNDEF), None);
    }

    #[test]
    fn room_and_locals() {
        let mut rf = RegisterFile::new(32, 0);
        assert!(rf.has_room(10, 10));
        assert!(!rf.has_room(10, 11));
        rf.init_locals(10, 3, UNDEF);
        assert_eq!(rf.get(10, -1), UNDEF);
        assert_eq!(rf.get(10, -3), UNDEF);
        assert_eq!(rf.get(10, -4), 0);
        assert_eq!(rf.index_of(rf.frame_ptr(12)), 12);
    }
}
