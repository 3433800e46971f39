//! Polymorphic property routines.
//!
//! When a property site sees more than one structure, the runtime asks the
//! compiler for a routine that tests each cached structure in turn and
//! performs the matching access. A routine has the same signature as the
//! site's miss stub and tail-calls that stub when no case matches, so the
//! site's stub slot can point at either.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{Block, InstBuilder, MemFlags, UserFuncName, Value, types};
use cranelift_frontend::FunctionBuilder;
use cranelift_module::{Linkage, Module};
use heron_vm_bytecode::{PropertyCacheKind, StructureId};
use heron_vm_value::Encoding;

use crate::compiler::{JitCompiler, JitError};
use crate::context::{JitContext, cell};
use crate::stubs::{StubKind, StubRefs};
use crate::value_ops::{NanBoxOps, TagPayloadOps, ValueOps};

/// One structure case of a routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineCase {
    /// Own slot load
    Load { structure: StructureId, offset: u32 },
    /// Load from a prototype cell. `holder` is the address of that cell,
    /// which never moves.
    ProtoLoad {
        structure: StructureId,
        holder: *const u8,
        offset: u32,
    },
    /// Property absent along the chain
    Absent { structure: StructureId },
    /// Store into an existing own slot
    Replace { structure: StructureId, offset: u32 },
}

impl RoutineCase {
    pub fn structure(&self) -> StructureId {
        match self {
            Self::Load { structure, .. }
            | Self::ProtoLoad { structure, .. }
            | Self::Absent { structure }
            | Self::Replace { structure, .. } => *structure,
        }
    }
}

impl JitCompiler {
    /// Synthesize a routine dispatching over `cases`.
    ///
    /// Put routines only store non-cell values; cell stores fall through to
    /// the miss stub, which applies the write barrier.
    pub fn compile_property_routine(
        &mut self,
        kind: PropertyCacheKind,
        cases: &[RoutineCase],
    ) -> Result<*const u8, JitError> {
        let result = self.compile_routine_inner(kind, cases);
        match &result {
            Ok(_) => self.stats_mut().stub_routines += 1,
            Err(err) => {
                self.module.clear_context(&mut self.context);
                tracing::debug!(error = %err, cases = cases.len(), "routine compilation failed");
            }
        }
        result
    }

    fn compile_routine_inner(
        &mut self,
        kind: PropertyCacheKind,
        cases: &[RoutineCase],
    ) -> Result<*const u8, JitError> {
        let call_conv = self.module.target_config().default_call_conv;
        let miss = match kind {
            PropertyCacheKind::Get => StubKind::GetByIdMiss,
            PropertyCacheKind::Put => StubKind::PutByIdMiss,
        };
        let signature = miss.make_signature(call_conv);
        let name = self.function_name("heron_routine", &format!("{kind:?}"));
        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;
        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(1, func_id.as_u32()),
            signature,
        );
        let stub_refs = StubRefs::declare(&self.stub_ids, &mut self.module, &mut self.context.func);

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            match self.encoding {
                Encoding::NanBox => {
                    build_routine::<NanBoxOps>(&mut builder, kind, cases, &stub_refs, miss)
                }
                Encoding::TagPayload => {
                    build_routine::<TagPayloadOps>(&mut builder, kind, cases, &stub_refs, miss)
                }
            }
            builder.seal_all_blocks();
            builder.finalize();
        }

        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;
        Ok(self.module.get_finalized_function(func_id))
    }
}

fn build_routine<V: ValueOps>(
    b: &mut FunctionBuilder<'_>,
    kind: PropertyCacheKind,
    cases: &[RoutineCase],
    stubs: &StubRefs,
    miss: StubKind,
) {
    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    let params: Vec<Value> = b.block_params(entry).to_vec();
    let (ctx, base) = (params[0], params[4]);

    let miss_block = b.create_block();
    b.set_cold_block(miss_block);
    let dispatch = b.create_block();

    let is_cell = V::is_cell(b, base);
    let guard = match kind {
        PropertyCacheKind::Get => is_cell,
        PropertyCacheKind::Put => {
            let value_is_cell = V::is_cell(b, params[5]);
            let plain = b.ins().bxor_imm(value_is_cell, 1);
            b.ins().band(is_cell, plain)
        }
    };
    b.ins().brif(guard, dispatch, &[], miss_block, &[]);

    b.switch_to_block(dispatch);
    let cells = b
        .ins()
        .load(types::I64, MemFlags::trusted(), ctx, JitContext::CELLS_OFFSET);
    let idx = V::unbox_cell_index(b, base);
    let scaled = b.ins().ishl_imm(idx, 3);
    let slot = b.ins().iadd(cells, scaled);
    let ptr = b.ins().load(types::I64, MemFlags::trusted(), slot, 0);
    let structure = b
        .ins()
        .load(types::I32, MemFlags::trusted(), ptr, cell::STRUCTURE);

    for case in cases {
        let hit = b.create_block();
        let next: Block = b.create_block();
        let matches = b.ins().icmp_imm(
            IntCC::Equal,
            structure,
            i64::from(case.structure().0),
        );
        b.ins().brif(matches, hit, &[], next, &[]);

        b.switch_to_block(hit);
        match *case {
            RoutineCase::Load { offset, .. } => {
                let v = load_slot(b, ptr, offset);
                b.ins().return_(&[v]);
            }
            RoutineCase::ProtoLoad { holder, offset, .. } => {
                let holder = b.ins().iconst(types::I64, holder as i64);
                let v = load_slot(b, holder, offset);
                b.ins().return_(&[v]);
            }
            RoutineCase::Absent { .. } => {
                let v = V::undefined(b);
                b.ins().return_(&[v]);
            }
            RoutineCase::Replace { offset, .. } => {
                let storage = b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), ptr, cell::STORAGE);
                b.ins().store(
                    MemFlags::trusted(),
                    params[5],
                    storage,
                    (offset * 8) as i32,
                );
                let status = b.ins().iconst(types::I64, 0);
                b.ins().return_(&[status]);
            }
        }
        b.switch_to_block(next);
    }
    b.ins().jump(miss_block, &[]);

    b.switch_to_block(miss_block);
    let inst = b.ins().call(stubs.get(miss), &params);
    let result = b.inst_results(inst)[0];
    b.ins().return_(&[result]);
}

fn load_slot(b: &mut FunctionBuilder<'_>, cell_ptr: Value, offset: u32) -> Value {
    let storage = b
        .ins()
        .load(types::I64, MemFlags::trusted(), cell_ptr, cell::STORAGE);
    b.ins()
        .load(types::I64, MemFlags::trusted(), storage, (offset * 8) as i32)
}
