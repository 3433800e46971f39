//! State shared between the engine and the sampler.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use heron_vm_bytecode::{OPCODE_COUNT, Opcode};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Name and line table of a registered CodeBlock
#[derive(Debug, Clone)]
pub(crate) struct CodeBlockInfo {
    pub name: String,
    /// `(offset, line)` sorted by offset
    pub lines: Vec<(u32, u32)>,
}

impl CodeBlockInfo {
    pub fn line_for(&self, offset: u32) -> Option<u32> {
        let idx = self.lines.partition_point(|(start, _)| *start <= offset);
        idx.checked_sub(1).map(|i| self.lines[i].1)
    }
}

/// Where the engine is right now, plus the opcode histogram.
///
/// Only the engine thread writes; the sampler only loads. A sample may mix
/// fields from two consecutive publications, which is acceptable for a
/// statistical profile.
#[derive(Debug)]
pub struct ProfilerContext {
    code_block: AtomicU32,
    offset: AtomicU32,
    opcode: AtomicU8,
    in_helper: AtomicBool,
    histogram_enabled: bool,
    histogram: [AtomicU64; OPCODE_COUNT],
    pub(crate) code_blocks: Mutex<FxHashMap<u32, CodeBlockInfo>>,
}

/// One read of the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub code_block: u32,
    pub offset: u32,
    pub opcode: Option<Opcode>,
    pub in_helper: bool,
}

impl ProfilerContext {
    pub const NO_CODE_BLOCK: u32 = u32::MAX;
    const NO_OPCODE: u8 = u8::MAX;

    pub fn new(histogram_enabled: bool) -> Self {
        Self {
            code_block: AtomicU32::new(Self::NO_CODE_BLOCK),
            offset: AtomicU32::new(0),
            opcode: AtomicU8::new(Self::NO_OPCODE),
            in_helper: AtomicBool::new(false),
            histogram_enabled,
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
            code_blocks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Name a CodeBlock id and give its `(offset, line)` table
    pub fn register_code_block(&self, id: u32, name: &str, lines: &[(u32, u32)]) {
        let mut lines = lines.to_vec();
        lines.sort_unstable();
        self.code_blocks.lock().insert(
            id,
            CodeBlockInfo {
                name: name.to_string(),
                lines,
            },
        );
    }

    /// Publish the instruction about to run
    #[inline]
    pub fn publish(&self, code_block: u32, offset: u32, opcode: Opcode) {
        self.code_block.store(code_block, Ordering::Relaxed);
        self.offset.store(offset, Ordering::Relaxed);
        self.opcode.store(opcode.id(), Ordering::Relaxed);
    }

    /// Publish entry into native code of `code_block`, where no opcode is
    /// known until the next stub call
    #[inline]
    pub fn publish_native(&self, code_block: u32) {
        self.code_block.store(code_block, Ordering::Relaxed);
        self.opcode.store(Self::NO_OPCODE, Ordering::Relaxed);
    }

    /// Nothing is running
    #[inline]
    pub fn publish_idle(&self) {
        self.code_block.store(Self::NO_CODE_BLOCK, Ordering::Relaxed);
        self.opcode.store(Self::NO_OPCODE, Ordering::Relaxed);
    }

    /// Mark entry into or exit from a runtime stub. Returns the previous flag
    /// so nested stubs can restore it.
    #[inline]
    pub fn set_in_helper(&self, in_helper: bool) -> bool {
        self.in_helper.swap(in_helper, Ordering::Relaxed)
    }

    #[inline]
    pub fn histogram_enabled(&self) -> bool {
        self.histogram_enabled
    }

    #[inline]
    pub fn count(&self, opcode: Opcode) {
        if self.histogram_enabled {
            self.histogram[opcode as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn histogram(&self) -> Vec<(Opcode, u64)> {
        self.histogram
            .iter()
            .enumerate()
            .filter_map(|(id, count)| {
                let count = count.load(Ordering::Relaxed);
                let opcode = Opcode::from_u8(id as u8)?;
                (count > 0).then_some((opcode, count))
            })
            .collect()
    }

    pub fn read(&self) -> Position {
        Position {
            code_block: self.code_block.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            opcode: Opcode::from_u8(self.opcode.load(Ordering::Relaxed)),
            in_helper: self.in_helper.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProfilerContext {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_read() {
        let ctx = ProfilerContext::new(false);
        assert_eq!(ctx.read().code_block, ProfilerContext::NO_CODE_BLOCK);
        ctx.publish(3, 12, Opcode::Add);
        assert!(!ctx.set_in_helper(true));
        let pos = ctx.read();
        assert_eq!((pos.code_block, pos.offset, pos.opcode), (3, 12, Some(Opcode::Add)));
        assert!(pos.in_helper);
        ctx.publish_native(4);
        assert_eq!(ctx.read().opcode, None);
    }

    #[test]
    fn histogram_counts_only_when_enabled() {
        let off = ProfilerContext::new(false);
        off.count(Opcode::Mov);
        assert!(off.histogram().is_empty());

        let on = ProfilerContext::new(true);
        on.count(Opcode::Mov);
        on.count(Opcode::Mov);
        on.count(Opcode::Ret);
        assert_eq!(on.histogram(), vec![(Opcode::Mov, 2), (Opcode::Ret, 1)]);
    }
}
