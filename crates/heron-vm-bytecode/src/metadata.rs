//! Per-site metadata owned by a CodeBlock.
//!
//! Property-access and call instructions carry an index into these tables.
//! The engine mutates them in place on cache misses; the JIT reads them when
//! seeding patch sites.

use std::sync::atomic::{AtomicU8, Ordering};

use heron_vm_value::CellId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identifies a Structure (object shape) in an engine's structure table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructureId(pub u32);

impl StructureId {
    /// Never assigned to a real structure; patch sites use it for "no entry"
    pub const INVALID: StructureId = StructureId(u32::MAX);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Arithmetic feedback
// ---------------------------------------------------------------------------

/// Observed operand and result kinds for one arithmetic instruction.
///
/// Stored as a single byte so generated code can OR flags into it directly.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct ArithProfile(AtomicU8);

impl ArithProfile {
    pub const INT32_OPERANDS: u8 = 1 << 0;
    pub const DOUBLE_OPERANDS: u8 = 1 << 1;
    pub const OVERFLOWED: u8 = 1 << 2;
    /// Result was not exactly integral
    pub const NON_INTEGRAL: u8 = 1 << 3;
    pub const NEGATIVE_ZERO: u8 = 1 << 4;
    pub const NON_NUMBER_OPERANDS: u8 = 1 << 5;

    #[inline]
    pub fn record(&self, flags: u8) {
        self.0.fetch_or(flags, Ordering::Relaxed);
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.bits() & flag != 0
    }

    /// Address generated code writes feedback to
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

// ---------------------------------------------------------------------------
// Property inline caches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyCacheKind {
    Get,
    Put,
}

/// What a cache entry does once its structure guard passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyAccess {
    /// Own property load from `offset`
    Load { offset: u32 },
    /// Load from a prototype. Valid while no structure in `chain` changes.
    ProtoLoad {
        holder: CellId,
        offset: u32,
        chain: SmallVec<[StructureId; 4]>,
    },
    /// Property absent along the whole chain; the load yields undefined
    Absent { chain: SmallVec<[StructureId; 4]> },
    /// Store to an existing own property
    Replace { offset: u32 },
    /// Store that adds a property: the receiver moves to `new_structure`
    Transition {
        new_structure: StructureId,
        offset: u32,
    },
}

impl PropertyAccess {
    /// Prototype structures this entry relies on
    pub fn chain(&self) -> &[StructureId] {
        match self {
            Self::ProtoLoad { chain, .. } | Self::Absent { chain } => chain,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub structure: StructureId,
    pub access: PropertyAccess,
}

impl CacheEntry {
    pub fn new(structure: StructureId, access: PropertyAccess) -> Self {
        Self { structure, access }
    }

    /// Whether a change to `structure` invalidates this entry
    pub fn depends_on(&self, structure: StructureId) -> bool {
        self.structure == structure || self.access.chain().contains(&structure)
    }
}

/// `Uninitialized → Monomorphic → Polymorphic → Generic`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PropertyCacheState {
    #[default]
    Uninitialized,
    Monomorphic(CacheEntry),
    Polymorphic(SmallVec<[CacheEntry; 4]>),
    Generic,
}

impl PropertyCacheState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Monomorphic(_) => "monomorphic",
            Self::Polymorphic(_) => "polymorphic",
            Self::Generic => "generic",
        }
    }

    /// Position in the state order, for monotonicity checks
    pub fn rank(&self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Monomorphic(_) => 1,
            Self::Polymorphic(_) => 2,
            Self::Generic => 3,
        }
    }

    pub fn entries(&self) -> &[CacheEntry] {
        match self {
            Self::Monomorphic(entry) => std::slice::from_ref(entry),
            Self::Polymorphic(entries) => entries,
            _ => &[],
        }
    }

    pub fn lookup(&self, structure: StructureId) -> Option<&CacheEntry> {
        self.entries().iter().find(|e| e.structure == structure)
    }

    /// Add an entry, moving at most one step forward. An entry for a
    /// structure already present replaces it. Returns `true` if the state
    /// changed.
    pub fn insert(&mut self, entry: CacheEntry, limit: usize) -> bool {
        match self {
            Self::Uninitialized => {
                *self = Self::Monomorphic(entry);
                true
            }
            Self::Monomorphic(existing) if existing.structure == entry.structure => {
                let changed = *existing != entry;
                *existing = entry;
                changed
            }
            Self::Monomorphic(existing) => {
                let mut entries = SmallVec::new();
                entries.push(existing.clone());
                entries.push(entry);
                *self = Self::Polymorphic(entries);
                true
            }
            Self::Polymorphic(entries) => {
                if let Some(slot) = entries.iter_mut().find(|e| e.structure == entry.structure) {
                    let changed = *slot != entry;
                    *slot = entry;
                    changed
                } else if entries.len() < limit {
                    entries.push(entry);
                    true
                } else {
                    *self = Self::Generic;
                    true
                }
            }
            Self::Generic => false,
        }
    }

    /// Drop every entry that depends on `structure`. Returns how many were
    /// removed.
    pub fn remove_dependents(&mut self, structure: StructureId) -> usize {
        match self {
            Self::Monomorphic(entry) if entry.depends_on(structure) => {
                *self = Self::Uninitialized;
                1
            }
            Self::Polymorphic(entries) => {
                let before = entries.len();
                entries.retain(|e| !e.depends_on(structure));
                let removed = before - entries.len();
                match entries.len() {
                    0 => *self = Self::Uninitialized,
                    1 => *self = Self::Monomorphic(entries[0].clone()),
                    _ => {}
                }
                removed
            }
            _ => 0,
        }
    }
}

/// Metadata for one `get_by_id` / `put_by_id` site
#[derive(Debug, Clone)]
pub struct PropertyInlineCache {
    pub kind: PropertyCacheKind,
    /// Identifier table index of the property name
    pub ident: u32,
    pub state: PropertyCacheState,
    pub hits: u64,
    pub misses: u64,
}

impl PropertyInlineCache {
    pub fn new(kind: PropertyCacheKind, ident: u32) -> Self {
        Self {
            kind,
            ident,
            state: PropertyCacheState::Uninitialized,
            hits: 0,
            misses: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Call links
// ---------------------------------------------------------------------------

/// `Unlinked → Monomorphic → Polymorphic → Generic`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallLinkState {
    #[default]
    Unlinked,
    Monomorphic(CellId),
    Polymorphic(SmallVec<[CellId; 4]>),
    Generic,
}

impl CallLinkState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unlinked => "unlinked",
            Self::Monomorphic(_) => "monomorphic",
            Self::Polymorphic(_) => "polymorphic",
            Self::Generic => "generic",
        }
    }

    pub fn callees(&self) -> &[CellId] {
        match self {
            Self::Monomorphic(callee) => std::slice::from_ref(callee),
            Self::Polymorphic(callees) => callees,
            _ => &[],
        }
    }

    /// Record a callee, moving at most one step forward
    pub fn insert(&mut self, callee: CellId, limit: usize) -> bool {
        match self {
            Self::Unlinked => {
                *self = Self::Monomorphic(callee);
                true
            }
            Self::Monomorphic(existing) if *existing == callee => false,
            Self::Monomorphic(existing) => {
                let mut callees = SmallVec::new();
                callees.push(*existing);
                callees.push(callee);
                *self = Self::Polymorphic(callees);
                true
            }
            Self::Polymorphic(callees) => {
                if callees.contains(&callee) {
                    false
                } else if callees.len() < limit {
                    callees.push(callee);
                    true
                } else {
                    *self = Self::Generic;
                    true
                }
            }
            Self::Generic => false,
        }
    }
}

/// Metadata for one call site
#[derive(Debug, Clone, Default)]
pub struct CallLinkInfo {
    pub state: CallLinkState,
    pub hits: u64,
    pub misses: u64,
}
