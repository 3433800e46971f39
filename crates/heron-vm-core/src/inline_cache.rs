//! Property and call inline caches.
//!
//! The state machines live in the CodeBlock metadata and are shared by both
//! tiers. Whenever a state changes in a compiled CodeBlock the matching patch
//! site is rewritten: a monomorphic own access becomes the inline guard, any
//! other cacheable state becomes a synthesized routine and the generic state
//! installs the generic stub.

use heron_vm_bytecode::{
    CacheEntry, CallLinkState, PropertyAccess, PropertyCacheKind, PropertyCacheState,
};
use heron_vm_jit::{RoutineCase, StubKind};
use heron_vm_value::Value;

use crate::code::LinkedCodeBlock;
use crate::engine::Engine;
use crate::error::VmResult;
use crate::heap::CellBody;
use crate::object::{Lookup, PutOutcome};
use crate::structure::Dependent;

impl Engine {
    /// `get_by_id` through cache `index` of `code`
    pub(crate) fn get_by_id(&mut self, code: &LinkedCodeBlock, index: u32, base: u64) -> VmResult<u64> {
        let ident = code.code.property_cache(index).borrow().ident;
        let atom = code.identifier(ident);
        let receiver = self
            .encoding
            .as_cell(base)
            .and_then(|id| Some((id, self.structure_of_cell(id)?)));
        let Some((object, structure)) = receiver else {
            self.stats.ic_misses += 1;
            code.code.property_cache(index).borrow_mut().misses += 1;
            return self.get_named(base, atom);
        };

        let hit = {
            let mut ic = code.code.property_cache(index).borrow_mut();
            let access = ic.state.lookup(structure).map(|entry| entry.access.clone());
            match access {
                Some(access) => {
                    ic.hits += 1;
                    Some(access)
                }
                None => {
                    ic.misses += 1;
                    None
                }
            }
        };
        if let Some(access) = hit {
            self.stats.ic_hits += 1;
            return Ok(match access {
                PropertyAccess::Load { offset } => self.heap.slot(object, offset),
                PropertyAccess::ProtoLoad { holder, offset, .. } => self.heap.slot(holder, offset),
                _ => self.undefined(),
            });
        }

        self.stats.ic_misses += 1;
        let found = self.lookup_property(object, atom);
        let value = self.read_lookup(object, &found.lookup);
        if found.cacheable {
            let access = match found.lookup {
                Lookup::Own { offset } => PropertyAccess::Load { offset },
                Lookup::Proto {
                    holder,
                    offset,
                    chain,
                } => PropertyAccess::ProtoLoad {
                    holder,
                    offset,
                    chain,
                },
                Lookup::Absent { chain } => PropertyAccess::Absent { chain },
            };
            self.update_cache(code, index, CacheEntry::new(structure, access));
        }
        Ok(value)
    }

    /// `put_by_id` through cache `index` of `code`
    pub(crate) fn put_by_id(
        &mut self,
        code: &LinkedCodeBlock,
        index: u32,
        base: u64,
        value: u64,
    ) -> VmResult<()> {
        let ident = code.code.property_cache(index).borrow().ident;
        let atom = code.identifier(ident);
        let receiver = self
            .encoding
            .as_cell(base)
            .and_then(|id| Some((id, self.structure_of_cell(id)?)));
        let Some((object, structure)) = receiver else {
            self.stats.ic_misses += 1;
            code.code.property_cache(index).borrow_mut().misses += 1;
            return self.put_named(base, atom, value);
        };

        let hit = {
            let mut ic = code.code.property_cache(index).borrow_mut();
            let access = ic.state.lookup(structure).map(|entry| entry.access.clone());
            if access.is_some() {
                ic.hits += 1;
            } else {
                ic.misses += 1;
            }
            access
        };
        match hit {
            Some(PropertyAccess::Replace { offset }) => {
                self.stats.ic_hits += 1;
                self.heap.store_slot(object, offset, value);
                return Ok(());
            }
            Some(PropertyAccess::Transition {
                new_structure,
                offset,
            }) => {
                self.stats.ic_hits += 1;
                let slot = self.heap.push_slot(object, value);
                debug_assert_eq!(slot, offset);
                self.heap.set_structure(object, new_structure);
                self.structure_changed(structure);
                return Ok(());
            }
            _ => {}
        }

        self.stats.ic_misses += 1;
        self.stats.structure_lookups += 1;
        let outcome = self.define_own(object, atom, value)?;
        let entry = match outcome {
            PutOutcome::Replaced { structure, offset }
                if !self.structures.get(structure).is_dictionary() =>
            {
                Some(CacheEntry::new(structure, PropertyAccess::Replace { offset }))
            }
            PutOutcome::Added { from, to, offset }
                if !self.structures.get(from).is_dictionary()
                    && !self.structures.get(to).is_dictionary() =>
            {
                Some(CacheEntry::new(
                    from,
                    PropertyAccess::Transition {
                        new_structure: to,
                        offset,
                    },
                ))
            }
            _ => None,
        };
        if let Some(entry) = entry {
            self.update_cache(code, index, entry);
        }
        Ok(())
    }

    /// Advance the state machine of one site and repatch it
    fn update_cache(&mut self, code: &LinkedCodeBlock, index: u32, entry: CacheEntry) {
        let chain = entry.access.chain().to_vec();
        let (changed, state) = {
            let mut ic = code.code.property_cache(index).borrow_mut();
            let changed = ic.state.insert(entry, self.config.polymorphic_limit);
            (changed, ic.state.name())
        };
        if !changed {
            return;
        }
        if state != "generic" {
            let dependent = Dependent {
                code_block: code.id,
                cache: index,
            };
            for structure in chain {
                self.structures.watch(structure, dependent);
            }
        }
        tracing::trace!(code_block = %code.name(), cache = index, state, "property cache transition");
        self.sync_property_site(code, index);
    }

    /// Make the patch site of cache `index` reflect its current state
    pub(crate) fn sync_property_site(&mut self, code: &LinkedCodeBlock, index: u32) {
        let Some(compiled) = code.compiled() else {
            return;
        };
        let (kind, state) = {
            let ic = code.code.property_cache(index).borrow();
            (ic.kind, ic.state.clone())
        };
        let cases: Vec<RoutineCase> = state
            .entries()
            .iter()
            .filter_map(|entry| self.routine_case(entry))
            .collect();
        let Some(jit) = self.jit.as_mut() else {
            return;
        };
        let miss = jit.property_miss_stub(kind);
        let patch = &compiled.patch;

        match &state {
            PropertyCacheState::Uninitialized => patch.reset_property(index, miss),
            PropertyCacheState::Monomorphic(entry) => match entry.access {
                PropertyAccess::Load { offset } | PropertyAccess::Replace { offset } => {
                    patch.set_inline(index, entry.structure, offset);
                    patch.set_property_stub(index, miss);
                }
                _ if cases.is_empty() => patch.reset_property(index, miss),
                _ => {
                    patch.clear_inline(index);
                    let stub = jit.compile_property_routine(kind, &cases).unwrap_or(miss);
                    patch.set_property_stub(index, stub);
                }
            },
            PropertyCacheState::Polymorphic(_) => {
                patch.clear_inline(index);
                let stub = if cases.is_empty() {
                    miss
                } else {
                    jit.compile_property_routine(kind, &cases).unwrap_or(miss)
                };
                patch.set_property_stub(index, stub);
            }
            PropertyCacheState::Generic => {
                patch.clear_inline(index);
                let generic = match kind {
                    PropertyCacheKind::Get => StubKind::GetByIdGeneric,
                    PropertyCacheKind::Put => StubKind::PutByIdGeneric,
                };
                patch.set_property_stub(index, jit.stubs().get(generic));
            }
        }
    }

    /// Routine case for an entry; transitions always take the miss stub
    fn routine_case(&self, entry: &CacheEntry) -> Option<RoutineCase> {
        let structure = entry.structure;
        match &entry.access {
            PropertyAccess::Load { offset } => Some(RoutineCase::Load {
                structure,
                offset: *offset,
            }),
            PropertyAccess::ProtoLoad { holder, offset, .. } => Some(RoutineCase::ProtoLoad {
                structure,
                holder: self.heap.cell_ptr(*holder),
                offset: *offset,
            }),
            PropertyAccess::Absent { .. } => Some(RoutineCase::Absent { structure }),
            PropertyAccess::Replace { offset } => Some(RoutineCase::Replace {
                structure,
                offset: *offset,
            }),
            PropertyAccess::Transition { .. } => None,
        }
    }

    /// Record the callee seen at call link `index`
    pub(crate) fn record_call_link(&mut self, code: &LinkedCodeBlock, index: u32, callee: u64) {
        let Some(callee) = self.encoding.as_cell(callee) else {
            return;
        };
        let limit = self.config.call_polymorphic_limit;
        let (changed, state) = {
            let mut link = code.code.call_link(index).borrow_mut();
            if link.state.callees().contains(&callee) {
                link.hits += 1;
            } else {
                link.misses += 1;
            }
            let changed = link.state.insert(callee, limit);
            (changed, link.state.name())
        };
        if changed {
            tracing::trace!(code_block = %code.name(), link = index, state, "call link transition");
        }
    }

    /// Link or unlink the patch site of call link `index`
    pub(crate) fn repatch_call_site(&mut self, code: &LinkedCodeBlock, index: u32) {
        let Some(compiled) = code.compiled() else {
            return;
        };
        let Some(jit) = self.jit.as_ref() else {
            return;
        };
        let state = code.code.call_link(index).borrow().state.clone();
        match state {
            CallLinkState::Unlinked => {}
            CallLinkState::Monomorphic(callee) => {
                let Some(argc) = code.call_argc(index) else {
                    return;
                };
                let entry = match self.heap.get(callee).body() {
                    CellBody::Function { code_block } => self
                        .code_blocks
                        .get(*code_block as usize)
                        .filter(|target| argc >= target.code.num_parameters())
                        .and_then(|target| target.compiled()),
                    _ => None,
                };
                let Some(entry) = entry else {
                    return;
                };
                let word = self.encode(Value::Cell(callee));
                if compiled.patch.call_site(index).expected_callee() != word {
                    compiled.patch.link_call(index, word, entry.entry_address());
                    tracing::trace!(code_block = %code.name(), link = index, "call site linked");
                }
            }
            CallLinkState::Polymorphic(_) | CallLinkState::Generic => {
                let virtual_stub = jit.stubs().get(StubKind::CallVirtual);
                if compiled.patch.call_site(index).stub() != virtual_stub
                    || compiled.patch.is_linked(index)
                {
                    compiled.patch.unlink_call(index, virtual_stub);
                }
            }
        }
    }

    /// Bring every patch site of a freshly compiled CodeBlock up to date
    pub(crate) fn seed_patch_table(&mut self, code: &LinkedCodeBlock) {
        for index in 0..code.code.property_caches().len() as u32 {
            let initialized = !matches!(
                code.code.property_cache(index).borrow().state,
                PropertyCacheState::Uninitialized
            );
            if initialized {
                self.sync_property_site(code, index);
            }
        }
        for index in 0..code.code.call_links().len() as u32 {
            self.repatch_call_site(code, index);
        }
    }
}
