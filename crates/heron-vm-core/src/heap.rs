//! Cell heap.
//!
//! A non-moving table of boxed cells. Generated code reaches a cell through
//! `cells[index]` and reads the header fields at the offsets declared in
//! [`heron_vm_jit::context::cell`]. The table is reserved to its full
//! capacity up front, so its base address never changes.
//!
//! Nothing is collected. Every store of a cell word into another cell goes
//! through [`Heap::write_barrier`], which counts the call and remembers the
//! owner, so a collector could be attached behind the same API.

use std::mem::offset_of;

use heron_vm_bytecode::StructureId;
use heron_vm_jit::context::cell as layout;
use heron_vm_value::{CellId, Encoding};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{VmError, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CellKind {
    Object = 0,
    Function = 1,
    HostFunction = 2,
    String = 3,
    Arguments = 4,
    Scope = 5,
}

/// Kind-specific payload
#[derive(Debug)]
pub enum CellBody {
    Object,
    /// Bytecode function; the captured scope lives in the header
    Function { code_block: u32 },
    HostFunction { index: u32 },
    String(Box<str>),
    /// Arguments object of the frame at `frame` called with `callee`
    Arguments {
        frame: usize,
        callee: u64,
        modified: bool,
    },
    /// Variables live in the cell's slots
    Scope { parent: Option<CellId> },
}

/// A heap cell. The leading fields form the header generated code reads.
#[derive(Debug)]
#[repr(C)]
pub struct Cell {
    kind: CellKind,
    structure: u32,
    storage: *mut u64,
    char_code: u32,
    length: u32,
    scope: u64,
    slots: Vec<u64>,
    body: CellBody,
}

const _: () = {
    assert!(offset_of!(Cell, kind) == layout::KIND as usize);
    assert!(offset_of!(Cell, structure) == layout::STRUCTURE as usize);
    assert!(offset_of!(Cell, storage) == layout::STORAGE as usize);
    assert!(offset_of!(Cell, char_code) == layout::CHAR_CODE as usize);
    assert!(offset_of!(Cell, length) == layout::LENGTH as usize);
    assert!(offset_of!(Cell, scope) == layout::SCOPE as usize);
    assert!(offset_of!(Cell, slots) >= layout::HEADER_SIZE);
};

impl Cell {
    fn new(kind: CellKind, structure: u32, body: CellBody, slots: Vec<u64>, scope: u64) -> Self {
        let mut cell = Self {
            kind,
            structure,
            storage: std::ptr::null_mut(),
            char_code: layout::NO_CHAR_CODE,
            length: 0,
            scope,
            slots,
            body,
        };
        cell.sync_storage();
        cell
    }

    fn sync_storage(&mut self) {
        self.storage = self.slots.as_mut_ptr();
    }

    #[inline]
    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Structure of an object cell
    #[inline]
    pub fn structure(&self) -> Option<StructureId> {
        (self.structure != layout::NO_STRUCTURE).then_some(StructureId(self.structure))
    }

    #[inline]
    pub fn body(&self) -> &CellBody {
        &self.body
    }

    #[inline]
    pub fn body_mut(&mut self) -> &mut CellBody {
        &mut self.body
    }

    #[inline]
    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// Encoded scope captured by a function cell
    #[inline]
    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.body {
            CellBody::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, CellKind::Function | CellKind::HostFunction)
    }
}

/// The cell table
pub struct Heap {
    cells: Vec<Box<Cell>>,
    capacity: usize,
    encoding: Encoding,
    barriers: u64,
    remembered: FxHashSet<CellId>,
    interned: FxHashMap<Box<str>, CellId>,
}

impl Heap {
    pub fn new(capacity: usize, encoding: Encoding) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
            capacity,
            encoding,
            barriers: 0,
            remembered: FxHashSet::default(),
            interned: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base of the cell table for generated code
    #[inline]
    pub fn table_ptr(&self) -> *const *mut u8 {
        self.cells.as_ptr().cast()
    }

    /// Address of a cell, stable for the heap's lifetime
    #[inline]
    pub fn cell_ptr(&self, id: CellId) -> *const u8 {
        let cell: &Cell = &self.cells[id.index()];
        (cell as *const Cell).cast()
    }

    #[inline]
    pub fn get(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.index()]
    }

    fn alloc(&mut self, cell: Cell) -> VmResult<CellId> {
        if self.cells.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "cell table exhausted");
            return Err(VmError::OutOfMemory);
        }
        let id = CellId(self.cells.len() as u32);
        self.cells.push(Box::new(cell));
        Ok(id)
    }

    pub fn alloc_object(&mut self, structure: StructureId) -> VmResult<CellId> {
        self.alloc(Cell::new(
            CellKind::Object,
            structure.0,
            CellBody::Object,
            Vec::new(),
            self.encoding.undefined(),
        ))
    }

    pub fn alloc_function(
        &mut self,
        structure: StructureId,
        code_block: u32,
        scope: u64,
    ) -> VmResult<CellId> {
        self.alloc(Cell::new(
            CellKind::Function,
            structure.0,
            CellBody::Function { code_block },
            Vec::new(),
            scope,
        ))
    }

    pub fn alloc_host_function(&mut self, structure: StructureId, index: u32) -> VmResult<CellId> {
        self.alloc(Cell::new(
            CellKind::HostFunction,
            structure.0,
            CellBody::HostFunction { index },
            Vec::new(),
            self.encoding.undefined(),
        ))
    }

    pub fn alloc_string(&mut self, text: &str) -> VmResult<CellId> {
        let mut cell = Cell::new(
            CellKind::String,
            layout::NO_STRUCTURE,
            CellBody::String(text.into()),
            Vec::new(),
            self.encoding.undefined(),
        );
        let mut chars = text.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            cell.char_code = u32::from(c);
        }
        cell.length = text.chars().count() as u32;
        self.alloc(cell)
    }

    /// One shared cell per distinct string, used for linked constants
    pub fn intern_string(&mut self, text: &str) -> VmResult<CellId> {
        if let Some(&id) = self.interned.get(text) {
            return Ok(id);
        }
        let id = self.alloc_string(text)?;
        self.interned.insert(text.into(), id);
        Ok(id)
    }

    pub fn alloc_arguments(
        &mut self,
        structure: StructureId,
        frame: usize,
        callee: u64,
    ) -> VmResult<CellId> {
        self.alloc(Cell::new(
            CellKind::Arguments,
            structure.0,
            CellBody::Arguments {
                frame,
                callee,
                modified: false,
            },
            Vec::new(),
            self.encoding.undefined(),
        ))
    }

    pub fn alloc_scope(&mut self, size: u32, parent: Option<CellId>) -> VmResult<CellId> {
        let vars = vec![self.encoding.undefined(); size as usize];
        self.alloc(Cell::new(
            CellKind::Scope,
            layout::NO_STRUCTURE,
            CellBody::Scope { parent },
            vars,
            self.encoding.undefined(),
        ))
    }

    #[inline]
    pub fn slot(&self, id: CellId, offset: u32) -> u64 {
        self.cells[id.index()].slots[offset as usize]
    }

    /// Overwrite an existing slot
    pub fn store_slot(&mut self, owner: CellId, offset: u32, word: u64) {
        if self.encoding.is_cell(word) {
            self.write_barrier(owner);
        }
        self.cells[owner.index()].slots[offset as usize] = word;
    }

    /// Append a slot; the storage pointer follows the reallocation
    pub fn push_slot(&mut self, owner: CellId, word: u64) -> u32 {
        if self.encoding.is_cell(word) {
            self.write_barrier(owner);
        }
        let cell = &mut self.cells[owner.index()];
        cell.slots.push(word);
        cell.sync_storage();
        (cell.slots.len() - 1) as u32
    }

    pub fn set_structure(&mut self, id: CellId, structure: StructureId) {
        self.cells[id.index()].structure = structure.0;
    }

    /// Record that `owner` now points at another cell
    #[inline]
    pub fn write_barrier(&mut self, owner: CellId) {
        self.barriers += 1;
        self.remembered.insert(owner);
    }

    pub fn barrier_count(&self) -> u64 {
        self.barriers
    }

    /// Cells that have stored a cell pointer
    pub fn remembered_len(&self) -> usize {
        self.remembered.len()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("len", &self.cells.len())
            .field("capacity", &self.capacity)
            .field("barriers", &self.barriers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(capacity: usize) -> Heap {
        Heap::new(capacity, Encoding::NanBox)
    }

    #[test]
    fn single_character_strings_carry_their_code_point() {
        let mut heap = heap(8);
        let a = heap.alloc_string("a").unwrap();
        let ab = heap.alloc_string("ab").unwrap();
        assert_eq!(heap.get(a).char_code, u32::from('a'));
        assert_eq!(heap.get(ab).char_code, layout::NO_CHAR_CODE);
        assert_eq!(heap.get(ab).length, 2);
        assert_eq!(heap.get(a).structure(), None);
    }

    #[test]
    fn storage_pointer_follows_slot_growth() {
        let mut heap = heap(8);
        let obj = heap.alloc_object(StructureId(0)).unwrap();
        for i in 0..64 {
            heap.push_slot(obj, Encoding::NanBox.int32(i));
            let cell = heap.get(obj);
            assert_eq!(cell.storage as *const u64, cell.slots.as_ptr());
        }
        assert_eq!(heap.slot(obj, 63), Encoding::NanBox.int32(63));
    }

    #[test]
    fn only_cell_stores_hit_the_barrier() {
        let mut heap = heap(8);
        let obj = heap.alloc_object(StructureId(0)).unwrap();
        let s = heap.intern_string("x").unwrap();
        heap.push_slot(obj, Encoding::NanBox.int32(1));
        assert_eq!(heap.barrier_count(), 0);
        heap.store_slot(obj, 0, Encoding::NanBox.cell(s));
        assert_eq!(heap.barrier_count(), 1);
        assert_eq!(heap.remembered_len(), 1);
    }

    #[test]
    fn table_is_bounded() {
        let mut heap = heap(2);
        heap.alloc_object(StructureId(0)).unwrap();
        heap.intern_string("a").unwrap();
        assert_eq!(heap.intern_string("a").unwrap(), CellId(1));
        assert!(matches!(heap.alloc_string("b"), Err(VmError::OutOfMemory)));
    }

    #[test]
    fn table_base_is_stable() {
        let mut heap = heap(16);
        let base = heap.table_ptr();
        for _ in 0..16 {
            heap.alloc_object(StructureId(0)).unwrap();
        }
        assert_eq!(heap.table_ptr(), base);
    }
}
