//! Structures (hidden classes) and property-name atoms.
//!
//! A Structure maps property names to slot offsets and records the
//! prototype. Objects built by adding the same properties in the same order
//! share a Structure through the transition table. Past
//! [`DICTIONARY_THRESHOLD`] properties an object gets a private dictionary
//! Structure that is mutated in place.

use heron_vm_bytecode::StructureId;
use heron_vm_value::CellId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{VmError, VmResult};

/// Properties after which an object leaves the transition tree
pub const DICTIONARY_THRESHOLD: usize = 64;

/// Interned property name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(pub u32);

/// Property-name intern table
#[derive(Debug, Default)]
pub struct Atoms {
    names: Vec<Box<str>>,
    index: FxHashMap<Box<str>, Atom>,
}

impl Atoms {
    pub fn intern(&mut self, name: &str) -> Atom {
        if let Some(&atom) = self.index.get(name) {
            return atom;
        }
        let atom = Atom(self.names.len() as u32);
        self.names.push(name.into());
        self.index.insert(name.into(), atom);
        atom
    }

    pub fn get(&self, name: &str) -> Option<Atom> {
        self.index.get(name).copied()
    }

    pub fn name(&self, atom: Atom) -> &str {
        &self.names[atom.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A property cache that relies on a structure staying unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependent {
    pub code_block: u32,
    pub cache: u32,
}

/// Caches to invalidate when a structure changes
#[derive(Debug, Default)]
pub struct WatchpointSet {
    dependents: SmallVec<[Dependent; 4]>,
    fired: u32,
}

impl WatchpointSet {
    pub fn add(&mut self, dependent: Dependent) {
        if !self.dependents.contains(&dependent) {
            self.dependents.push(dependent);
        }
    }

    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// How many times this set has fired with dependents attached
    pub fn fire_count(&self) -> u32 {
        self.fired
    }

    fn fire(&mut self) -> SmallVec<[Dependent; 4]> {
        if !self.dependents.is_empty() {
            self.fired += 1;
        }
        std::mem::take(&mut self.dependents)
    }
}

#[derive(Debug)]
pub struct Structure {
    id: StructureId,
    prototype: Option<CellId>,
    properties: FxHashMap<Atom, u32>,
    /// Insertion order; `keys[offset]` is the property stored at `offset`
    keys: Vec<Atom>,
    transitions: FxHashMap<Atom, StructureId>,
    proto_transitions: FxHashMap<Option<CellId>, StructureId>,
    dictionary: bool,
    watchpoints: WatchpointSet,
}

impl Structure {
    fn new(id: StructureId, prototype: Option<CellId>, dictionary: bool) -> Self {
        Self {
            id,
            prototype,
            properties: FxHashMap::default(),
            keys: Vec::new(),
            transitions: FxHashMap::default(),
            proto_transitions: FxHashMap::default(),
            dictionary,
            watchpoints: WatchpointSet::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> StructureId {
        self.id
    }

    #[inline]
    pub fn prototype(&self) -> Option<CellId> {
        self.prototype
    }

    #[inline]
    pub fn offset_of(&self, atom: Atom) -> Option<u32> {
        self.properties.get(&atom).copied()
    }

    pub fn keys(&self) -> &[Atom] {
        &self.keys
    }

    pub fn property_count(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_dictionary(&self) -> bool {
        self.dictionary
    }

    pub fn watchpoints(&self) -> &WatchpointSet {
        &self.watchpoints
    }
}

/// Result of adding a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub structure: StructureId,
    pub offset: u32,
}

/// Structure table of one engine
#[derive(Debug, Default)]
pub struct Structures {
    structures: Vec<Structure>,
    roots: FxHashMap<Option<CellId>, StructureId>,
}

impl Structures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    #[inline]
    pub fn get(&self, id: StructureId) -> &Structure {
        &self.structures[id.index()]
    }

    fn push(&mut self, prototype: Option<CellId>, dictionary: bool) -> StructureId {
        let id = StructureId(self.structures.len() as u32);
        self.structures.push(Structure::new(id, prototype, dictionary));
        id
    }

    /// Shared empty structure for objects with `prototype`
    pub fn root(&mut self, prototype: Option<CellId>) -> StructureId {
        if let Some(&id) = self.roots.get(&prototype) {
            return id;
        }
        let id = self.push(prototype, false);
        self.roots.insert(prototype, id);
        id
    }

    /// Fresh private structure
    pub fn dictionary(&mut self, prototype: Option<CellId>) -> StructureId {
        self.push(prototype, true)
    }

    #[inline]
    pub fn lookup(&self, id: StructureId, atom: Atom) -> Option<u32> {
        self.get(id).offset_of(atom)
    }

    #[inline]
    pub fn prototype(&self, id: StructureId) -> Option<CellId> {
        self.get(id).prototype
    }

    /// Structure after adding `atom` to `from`. Dictionary structures are
    /// mutated in place and come back unchanged.
    pub fn transition_add(&mut self, from: StructureId, atom: Atom) -> Transition {
        debug_assert!(self.lookup(from, atom).is_none());
        let source = self.get(from);
        let offset = source.keys.len() as u32;

        if source.dictionary {
            let s = &mut self.structures[from.index()];
            s.properties.insert(atom, offset);
            s.keys.push(atom);
            return Transition {
                structure: from,
                offset,
            };
        }
        if let Some(&to) = source.transitions.get(&atom) {
            return Transition {
                structure: to,
                offset,
            };
        }

        let prototype = source.prototype;
        let to_dictionary = source.keys.len() + 1 >= DICTIONARY_THRESHOLD;
        let properties = source.properties.clone();
        let keys = source.keys.clone();
        let to = self.push(prototype, to_dictionary);
        {
            let s = &mut self.structures[to.index()];
            s.properties = properties;
            s.keys = keys;
            s.properties.insert(atom, offset);
            s.keys.push(atom);
        }
        if to_dictionary {
            tracing::trace!(structure = to.0, "object switched to dictionary mode");
        } else {
            self.structures[from.index()].transitions.insert(atom, to);
        }
        Transition {
            structure: to,
            offset,
        }
    }

    /// Structure with the same properties as `from` and a new prototype
    pub fn transition_prototype(&mut self, from: StructureId, prototype: Option<CellId>) -> StructureId {
        let source = self.get(from);
        if source.prototype == prototype {
            return from;
        }
        if source.dictionary {
            self.structures[from.index()].prototype = prototype;
            return from;
        }
        if let Some(&to) = source.proto_transitions.get(&prototype) {
            return to;
        }
        let properties = source.properties.clone();
        let keys = source.keys.clone();
        let to = self.push(prototype, false);
        {
            let s = &mut self.structures[to.index()];
            s.properties = properties;
            s.keys = keys;
        }
        self.structures[from.index()]
            .proto_transitions
            .insert(prototype, to);
        to
    }

    /// Register a cache that must be invalidated when `id` changes
    pub fn watch(&mut self, id: StructureId, dependent: Dependent) {
        self.structures[id.index()].watchpoints.add(dependent);
    }

    /// Fire the watchpoint set of `id`, returning the caches to invalidate
    pub fn fire(&mut self, id: StructureId) -> SmallVec<[Dependent; 4]> {
        self.structures[id.index()].watchpoints.fire()
    }
}

/// Reject a prototype assignment that would make the chain cyclic.
/// `chain` yields the prototype chain of the new prototype.
pub(crate) fn check_acyclic(
    object: CellId,
    chain: impl Iterator<Item = CellId>,
) -> VmResult<()> {
    for ancestor in chain {
        if ancestor == object {
            return Err(VmError::type_error("Cyclic __proto__ value"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_insertion_order_shares_structures() {
        let mut atoms = Atoms::default();
        let (x, y) = (atoms.intern("x"), atoms.intern("y"));
        let mut structures = Structures::new();
        let root = structures.root(None);

        let a = structures.transition_add(root, x);
        let b = structures.transition_add(a.structure, y);
        let a2 = structures.transition_add(root, x);
        let b2 = structures.transition_add(a2.structure, y);
        assert_eq!(a, a2);
        assert_eq!(b, b2);
        assert_eq!(b.offset, 1);
        assert_eq!(structures.lookup(b.structure, x), Some(0));

        let c = structures.transition_add(root, y);
        assert_ne!(c.structure, a.structure);
    }

    #[test]
    fn roots_are_per_prototype() {
        let mut structures = Structures::new();
        let plain = structures.root(None);
        let derived = structures.root(Some(CellId(4)));
        assert_ne!(plain, derived);
        assert_eq!(structures.root(None), plain);
        assert_eq!(structures.prototype(derived), Some(CellId(4)));
    }

    #[test]
    fn many_properties_switch_to_dictionary() {
        let mut atoms = Atoms::default();
        let mut structures = Structures::new();
        let mut s = structures.root(None);
        for i in 0..DICTIONARY_THRESHOLD + 4 {
            let atom = atoms.intern(&format!("p{i}"));
            s = structures.transition_add(s, atom).structure;
        }
        assert!(structures.get(s).is_dictionary());
        let before = structures.len();
        let extra = atoms.intern("extra");
        let t = structures.transition_add(s, extra);
        assert_eq!(t.structure, s);
        assert_eq!(structures.len(), before);
        assert_eq!(t.offset as usize, DICTIONARY_THRESHOLD + 4);
    }

    #[test]
    fn prototype_transitions_keep_properties() {
        let mut atoms = Atoms::default();
        let x = atoms.intern("x");
        let mut structures = Structures::new();
        let root = structures.root(None);
        let with_x = structures.transition_add(root, x).structure;
        let moved = structures.transition_prototype(with_x, Some(CellId(1)));
        assert_ne!(moved, with_x);
        assert_eq!(structures.lookup(moved, x), Some(0));
        assert_eq!(structures.transition_prototype(with_x, Some(CellId(1))), moved);
        assert_eq!(structures.transition_prototype(with_x, None), with_x);
    }

    #[test]
    fn watchpoints_fire_once() {
        let mut structures = Structures::new();
        let root = structures.root(None);
        let dep = Dependent {
            code_block: 0,
            cache: 2,
        };
        structures.watch(root, dep);
        structures.watch(root, dep);
        assert_eq!(structures.get(root).watchpoints().len(), 1);
        assert_eq!(structures.fire(root).as_slice(), &[dep]);
        assert!(structures.fire(root).is_empty());
        assert_eq!(structures.get(root).watchpoints().fire_count(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let chain = [CellId(2), CellId(1)].into_iter();
        assert!(check_acyclic(CellId(1), chain).is_err());
        assert!(check_acyclic(CellId(9), [CellId(2)].into_iter()).is_ok());
    }
}
