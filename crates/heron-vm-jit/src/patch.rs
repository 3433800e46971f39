//! Patch points.
//!
//! Generated code never embeds cache state as immediates. Every patchable
//! word lives in a [`PatchTable`] owned next to the compiled code, and the
//! code loads it through its absolute address. Repatching a site is a store
//! into this table; the code buffer itself is never rewritten.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use heron_vm_bytecode::StructureId;

/// One `get_by_id` / `put_by_id` site
#[derive(Debug)]
#[repr(C)]
pub struct PropertySite {
    /// Structure the inline fast path accepts
    structure: AtomicU32,
    /// Slot index used by the inline fast path
    offset: AtomicU32,
    /// Routine called when the inline guard fails
    stub: AtomicUsize,
    /// Index of the site's property-cache metadata
    pub cache_index: u32,
}

impl PropertySite {
    pub const STRUCTURE_OFFSET: i32 = offset_of!(PropertySite, structure) as i32;
    pub const SLOT_OFFSET: i32 = offset_of!(PropertySite, offset) as i32;
    pub const STUB_OFFSET: i32 = offset_of!(PropertySite, stub) as i32;

    fn new(cache_index: u32, stub: *const u8) -> Self {
        Self {
            structure: AtomicU32::new(StructureId::INVALID.0),
            offset: AtomicU32::new(0),
            stub: AtomicUsize::new(stub as usize),
            cache_index,
        }
    }

    /// Inline guard state, `None` when the site has no inline entry
    pub fn inline_entry(&self) -> Option<(StructureId, u32)> {
        let structure = StructureId(self.structure.load(Ordering::Relaxed));
        (structure != StructureId::INVALID).then(|| (structure, self.offset.load(Ordering::Relaxed)))
    }

    pub fn stub(&self) -> *const u8 {
        self.stub.load(Ordering::Relaxed) as *const u8
    }

    #[inline]
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }
}

/// One `call` site
#[derive(Debug)]
#[repr(C)]
pub struct CallSite {
    /// Encoded callee word the direct path accepts
    expected_callee: AtomicU64,
    /// Entry of the linked callee's compiled code
    entry: AtomicUsize,
    /// Routine used when the callee differs
    stub: AtomicUsize,
    pub link_index: u32,
}

impl CallSite {
    pub const EXPECTED_CALLEE_OFFSET: i32 = offset_of!(CallSite, expected_callee) as i32;
    pub const ENTRY_OFFSET: i32 = offset_of!(CallSite, entry) as i32;
    pub const STUB_OFFSET: i32 = offset_of!(CallSite, stub) as i32;

    fn new(link_index: u32, unlinked: u64, stub: *const u8) -> Self {
        Self {
            expected_callee: AtomicU64::new(unlinked),
            entry: AtomicUsize::new(0),
            stub: AtomicUsize::new(stub as usize),
            link_index,
        }
    }

    pub fn expected_callee(&self) -> u64 {
        self.expected_callee.load(Ordering::Relaxed)
    }

    pub fn stub(&self) -> *const u8 {
        self.stub.load(Ordering::Relaxed) as *const u8
    }

    #[inline]
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }
}

/// Every patchable word of one compiled CodeBlock.
///
/// Sites are indexed by the CodeBlock's property-cache and call-link
/// indices. The boxed slices never move, so their addresses can be baked
/// into generated code.
#[derive(Debug)]
pub struct PatchTable {
    property_sites: Box<[PropertySite]>,
    call_sites: Box<[CallSite]>,
    /// Word that matches no callee
    unlinked: u64,
    repatches: AtomicU64,
}

impl PatchTable {
    pub fn new(
        property_caches: usize,
        call_links: usize,
        property_miss: impl Fn(u32) -> *const u8,
        call_link_stub: *const u8,
        unlinked: u64,
    ) -> Self {
        Self {
            property_sites: (0..property_caches as u32)
                .map(|i| PropertySite::new(i, property_miss(i)))
                .collect(),
            call_sites: (0..call_links as u32)
                .map(|i| CallSite::new(i, unlinked, call_link_stub))
                .collect(),
            unlinked,
            repatches: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn property_site(&self, cache_index: u32) -> &PropertySite {
        &self.property_sites[cache_index as usize]
    }

    #[inline]
    pub fn call_site(&self, link_index: u32) -> &CallSite {
        &self.call_sites[link_index as usize]
    }

    pub fn property_sites(&self) -> &[PropertySite] {
        &self.property_sites
    }

    /// Number of writes made to this table since compilation
    pub fn repatch_count(&self) -> u64 {
        self.repatches.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.repatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Inline fast path accepts `structure` and accesses slot `offset`
    pub fn set_inline(&self, cache_index: u32, structure: StructureId, offset: u32) {
        let site = self.property_site(cache_index);
        // Offset first: a concurrent reader that sees the new structure also
        // sees the matching offset.
        site.offset.store(offset, Ordering::Relaxed);
        site.structure.store(structure.0, Ordering::Release);
        self.bump();
    }

    pub fn clear_inline(&self, cache_index: u32) {
        self.property_site(cache_index)
            .structure
            .store(StructureId::INVALID.0, Ordering::Release);
        self.bump();
    }

    pub fn set_property_stub(&self, cache_index: u32, stub: *const u8) {
        self.property_site(cache_index)
            .stub
            .store(stub as usize, Ordering::Release);
        self.bump();
    }

    /// Back to the state right after compilation
    pub fn reset_property(&self, cache_index: u32, miss_stub: *const u8) {
        self.clear_inline(cache_index);
        self.set_property_stub(cache_index, miss_stub);
    }

    /// Direct path calls `entry` when the callee word equals `callee`
    pub fn link_call(&self, link_index: u32, callee: u64, entry: *const u8) {
        let site = self.call_site(link_index);
        site.entry.store(entry as usize, Ordering::Relaxed);
        site.expected_callee.store(callee, Ordering::Release);
        self.bump();
    }

    /// Drop the direct path and route every call through `stub`
    pub fn unlink_call(&self, link_index: u32, stub: *const u8) {
        let site = self.call_site(link_index);
        site.expected_callee.store(self.unlinked, Ordering::Release);
        site.stub.store(stub as usize, Ordering::Release);
        self.bump();
    }

    pub fn is_linked(&self, link_index: u32) -> bool {
        self.call_site(link_index).expected_callee() != self.unlinked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISS: *const u8 = 0x1000 as *const u8;
    const LINK: *const u8 = 0x2000 as *const u8;
    const VIRTUAL: *const u8 = 0x3000 as *const u8;

    fn table() -> PatchTable {
        PatchTable::new(2, 1, |_| MISS, LINK, u64::MAX)
    }

    #[test]
    fn fresh_sites_route_to_stubs() {
        let table = table();
        assert_eq!(table.property_site(0).inline_entry(), None);
        assert_eq!(table.property_site(1).stub(), MISS);
        assert!(!table.is_linked(0));
        assert_eq!(table.call_site(0).stub(), LINK);
    }

    #[test]
    fn inline_entry_and_reset() {
        let table = table();
        table.set_inline(1, StructureId(7), 3);
        assert_eq!(table.property_site(1).inline_entry(), Some((StructureId(7), 3)));
        table.set_property_stub(1, 0x4000 as *const u8);
        table.reset_property(1, MISS);
        assert_eq!(table.property_site(1).inline_entry(), None);
        assert_eq!(table.property_site(1).stub(), MISS);
        assert_eq!(table.repatch_count(), 4);
    }

    #[test]
    fn call_link_and_unlink() {
        let table = table();
        table.link_call(0, 42, 0x5000 as *const u8);
        assert!(table.is_linked(0));
        table.unlink_call(0, VIRTUAL);
        assert!(!table.is_linked(0));
        assert_eq!(table.call_site(0).stub(), VIRTUAL);
    }

    #[test]
    fn site_layout_matches_offsets() {
        assert_eq!(PropertySite::STRUCTURE_OFFSET, 0);
        assert_eq!(PropertySite::SLOT_OFFSET, 4);
        assert_eq!(PropertySite::STUB_OFFSET, 8);
        assert_eq!(CallSite::EXPECTED_CALLEE_OFFSET, 0);
        assert_eq!(CallSite::ENTRY_OFFSET, 8);
        assert_eq!(CallSite::STUB_OFFSET, 16);
    }
}
