//! Object model: generic property lookup and stores, prototypes and
//! watchpoint firing.

use heron_vm_bytecode::StructureId;
use heron_vm_value::{CellId, Value};
use smallvec::SmallVec;

use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::heap::CellBody;
use crate::structure::{Atom, check_acyclic};

/// Where a generic lookup found a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    Own {
        offset: u32,
    },
    Proto {
        holder: CellId,
        offset: u32,
        chain: SmallVec<[StructureId; 4]>,
    },
    /// Not found; `chain` holds every prototype structure walked
    Absent {
        chain: SmallVec<[StructureId; 4]>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct PropertyLookup {
    pub lookup: Lookup,
    /// Whether a cache entry may record this result
    pub cacheable: bool,
}

/// Result of an own-property store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Replaced {
        structure: StructureId,
        offset: u32,
    },
    Added {
        from: StructureId,
        to: StructureId,
        offset: u32,
    },
}

impl Engine {
    /// Structure of an object-like cell
    #[inline]
    pub(crate) fn structure_of_cell(&self, id: CellId) -> Option<StructureId> {
        self.heap.get(id).structure()
    }

    /// Generic lookup along the prototype chain. `object` must have a
    /// structure.
    pub(crate) fn lookup_property(&mut self, object: CellId, atom: Atom) -> PropertyLookup {
        self.stats.structure_lookups += 1;
        let Some(structure) = self.structure_of_cell(object) else {
            return PropertyLookup {
                lookup: Lookup::Absent {
                    chain: SmallVec::new(),
                },
                cacheable: false,
            };
        };
        let receiver_cacheable = !self.structures.get(structure).is_dictionary();
        if let Some(offset) = self.structures.lookup(structure, atom) {
            return PropertyLookup {
                lookup: Lookup::Own { offset },
                cacheable: receiver_cacheable,
            };
        }

        let limit = self.config.prototype_chain_limit;
        let mut chain = SmallVec::new();
        let mut proto = self.structures.prototype(structure);
        while let Some(holder) = proto {
            let Some(holder_structure) = self.structure_of_cell(holder) else {
                break;
            };
            chain.push(holder_structure);
            if let Some(offset) = self.structures.lookup(holder_structure, atom) {
                let cacheable = receiver_cacheable && chain.len() <= limit;
                return PropertyLookup {
                    lookup: Lookup::Proto {
                        holder,
                        offset,
                        chain,
                    },
                    cacheable,
                };
            }
            proto = self.structures.prototype(holder_structure);
        }
        let cacheable = receiver_cacheable && chain.len() <= limit;
        PropertyLookup {
            lookup: Lookup::Absent { chain },
            cacheable,
        }
    }

    pub(crate) fn read_lookup(&self, object: CellId, lookup: &Lookup) -> u64 {
        match lookup {
            Lookup::Own { offset } => self.heap.slot(object, *offset),
            Lookup::Proto { holder, offset, .. } => self.heap.slot(*holder, *offset),
            Lookup::Absent { .. } => self.undefined(),
        }
    }

    /// Store an own property, adding it if missing
    pub(crate) fn define_own(&mut self, object: CellId, atom: Atom, value: u64) -> VmResult<PutOutcome> {
        let structure = self
            .structure_of_cell(object)
            .ok_or_else(|| VmError::internal("property store on a cell without a structure"))?;
        if let CellBody::Arguments { modified, .. } = self.heap.get_mut(object).body_mut() {
            *modified = true;
        }
        if let Some(offset) = self.structures.lookup(structure, atom) {
            self.heap.store_slot(object, offset, value);
            return Ok(PutOutcome::Replaced { structure, offset });
        }

        let transition = self.structures.transition_add(structure, atom);
        let slot = self.heap.push_slot(object, value);
        debug_assert_eq!(slot, transition.offset);
        if transition.structure != structure {
            self.heap.set_structure(object, transition.structure);
        }
        self.structure_changed(structure);
        Ok(PutOutcome::Added {
            from: structure,
            to: transition.structure,
            offset: transition.offset,
        })
    }

    /// `base.name` without cache feedback
    pub(crate) fn get_named(&mut self, base: u64, atom: Atom) -> VmResult<u64> {
        match self.decode(base) {
            value @ (Value::Undefined | Value::Null) => Err(VmError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                self.display(value),
                self.atoms.name(atom)
            ))),
            Value::Cell(id) => {
                if self.structure_of_cell(id).is_some() {
                    let found = self.lookup_property(id, atom);
                    return Ok(self.read_lookup(id, &found.lookup));
                }
                match self.heap.get(id).as_str().map(str::to_string) {
                    Some(text) => self.string_property(&text, atom),
                    None => Ok(self.undefined()),
                }
            }
            _ => Ok(self.undefined()),
        }
    }

    /// `length` and indexed characters of a string
    fn string_property(&mut self, text: &str, atom: Atom) -> VmResult<u64> {
        if atom == self.length_atom {
            return Ok(self.encoding.int32(text.chars().count() as i32));
        }
        let index = self.atoms.name(atom).parse::<usize>().ok();
        match index.and_then(|i| text.chars().nth(i)) {
            Some(c) => {
                let id = self.heap.intern_string(c.encode_utf8(&mut [0; 4]))?;
                Ok(self.encoding.cell(id))
            }
            None => Ok(self.undefined()),
        }
    }

    /// `base.name = value` without cache feedback. Stores to primitives other
    /// than null and undefined are dropped.
    pub(crate) fn put_named(&mut self, base: u64, atom: Atom, value: u64) -> VmResult<()> {
        match self.decode(base) {
            target @ (Value::Undefined | Value::Null) => Err(VmError::type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                self.display(target),
                self.atoms.name(atom)
            ))),
            Value::Cell(id) if self.structure_of_cell(id).is_some() => {
                self.define_own(id, atom, value)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Property name for a `get_by_val` / `put_by_val` key
    pub(crate) fn property_key(&mut self, key: u64) -> Atom {
        let name = match self.decode(key) {
            Value::Int32(n) => n.to_string(),
            other => self.display(other),
        };
        self.atoms.intern(&name)
    }

    /// `base` itself followed by its prototypes
    fn prototype_chain(&self, start: CellId) -> Vec<CellId> {
        let mut chain = vec![start];
        let mut cursor = self
            .structure_of_cell(start)
            .and_then(|s| self.structures.prototype(s));
        while let Some(proto) = cursor {
            chain.push(proto);
            cursor = self
                .structure_of_cell(proto)
                .and_then(|s| self.structures.prototype(s));
        }
        chain
    }

    pub(crate) fn set_prototype_of(&mut self, object: CellId, proto: Option<CellId>) -> VmResult<()> {
        let structure = self
            .structure_of_cell(object)
            .ok_or_else(|| VmError::type_error("Object.setPrototypeOf called on non-object"))?;
        if let Some(proto) = proto {
            if self.structure_of_cell(proto).is_none() {
                return Err(VmError::type_error(
                    "Object prototype may only be an Object or null",
                ));
            }
            check_acyclic(object, self.prototype_chain(proto).into_iter())?;
        }
        let to = self.structures.transition_prototype(structure, proto);
        self.heap.set_structure(object, to);
        if proto.is_some() {
            self.heap.write_barrier(object);
        }
        self.structure_changed(structure);
        Ok(())
    }

    /// Fire the watchpoints of `structure` after an object changed away from
    /// it or a dictionary structure changed in place
    pub(crate) fn structure_changed(&mut self, structure: StructureId) {
        let dependents = self.structures.fire(structure);
        if dependents.is_empty() {
            return;
        }
        self.stats.watchpoints_fired += 1;
        for dependent in dependents {
            let Some(code) = self.code_blocks.get(dependent.code_block as usize).cloned() else {
                continue;
            };
            let removed = code
                .code
                .property_cache(dependent.cache)
                .borrow_mut()
                .state
                .remove_dependents(structure);
            if removed == 0 {
                continue;
            }
            self.stats.invalidated_entries += removed as u64;
            tracing::debug!(
                code_block = %code.name(),
                cache = dependent.cache,
                structure = structure.0,
                removed,
                "watchpoint fired"
            );
            self.sync_property_site(&code, dependent.cache);
        }
    }

    // -- host API -----------------------------------------------------------

    /// Fresh empty object with no prototype
    pub fn new_object(&mut self) -> VmResult<Value> {
        Ok(Value::Cell(self.heap.alloc_object(self.object_structure)?))
    }

    pub fn new_string(&mut self, text: &str) -> VmResult<Value> {
        Ok(Value::Cell(self.heap.alloc_string(text)?))
    }

    /// Contents of a string value
    pub fn string_value(&self, value: Value) -> Option<String> {
        Some(self.heap.get(value.as_cell()?).as_str()?.to_string())
    }

    /// `object[name]`
    pub fn get(&mut self, object: Value, name: &str) -> VmResult<Value> {
        let atom = self.atoms.intern(name);
        let word = self.get_named(self.encode(object), atom)?;
        Ok(self.decode(word))
    }

    /// `object[name] = value`
    pub fn set(&mut self, object: Value, name: &str, value: Value) -> VmResult<()> {
        let atom = self.atoms.intern(name);
        self.put_named(self.encode(object), atom, self.encode(value))
    }

    /// Replace the prototype of `object`; `proto` is an object or null
    pub fn set_prototype(&mut self, object: Value, proto: Value) -> VmResult<()> {
        let object = object
            .as_cell()
            .ok_or_else(|| VmError::type_error("Object.setPrototypeOf called on non-object"))?;
        let proto = match proto {
            Value::Null => None,
            Value::Cell(id) => Some(id),
            _ => {
                return Err(VmError::type_error(
                    "Object prototype may only be an Object or null",
                ));
            }
        };
        self.set_prototype_of(object, proto)
    }

    /// Structure of an object value
    pub fn structure_of(&self, value: Value) -> Option<StructureId> {
        self.structure_of_cell(value.as_cell()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_jit(false))
    }

    #[test]
    fn properties_round_trip_through_the_prototype_chain() {
        let mut engine = engine();
        let proto = engine.new_object().unwrap();
        let object = engine.new_object().unwrap();
        engine.set(proto, "x", Value::Int32(7)).unwrap();
        engine.set_prototype(object, proto).unwrap();
        assert_eq!(engine.get(object, "x").unwrap(), Value::Int32(7));
        assert_eq!(engine.get(object, "y").unwrap(), Value::Undefined);

        engine.set(object, "x", Value::Int32(9)).unwrap();
        assert_eq!(engine.get(object, "x").unwrap(), Value::Int32(9));
        assert_eq!(engine.get(proto, "x").unwrap(), Value::Int32(7));
    }

    #[test]
    fn same_shape_objects_share_structures() {
        let mut engine = engine();
        let a = engine.new_object().unwrap();
        let b = engine.new_object().unwrap();
        for object in [a, b] {
            engine.set(object, "x", Value::Int32(1)).unwrap();
            engine.set(object, "y", Value::Int32(2)).unwrap();
        }
        assert_eq!(engine.structure_of(a), engine.structure_of(b));
    }

    #[test]
    fn cyclic_prototypes_are_rejected() {
        let mut engine = engine();
        let a = engine.new_object().unwrap();
        let b = engine.new_object().unwrap();
        engine.set_prototype(a, b).unwrap();
        let err = engine.set_prototype(b, a).unwrap_err();
        assert!(matches!(err, VmError::TypeError(_)));
        assert!(engine.set_prototype(a, a).is_err());
    }

    #[test]
    fn nullish_bases_raise_type_errors() {
        let mut engine = engine();
        let err = engine.get(Value::Undefined, "x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: Cannot read properties of undefined (reading 'x')"
        );
        assert!(engine.set(Value::Null, "x", Value::Int32(1)).is_err());
        assert!(engine.set(Value::Int32(3), "x", Value::Int32(1)).is_ok());
    }

    #[test]
    fn strings_expose_length_and_characters() {
        let mut engine = engine();
        let s = engine.new_string("héron").unwrap();
        assert_eq!(engine.get(s, "length").unwrap(), Value::Int32(5));
        let c = engine.get(s, "1").unwrap();
        assert_eq!(engine.string_value(c).as_deref(), Some("é"));
        assert_eq!(engine.get(s, "9").unwrap(), Value::Undefined);
    }
}
