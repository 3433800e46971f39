//! Baseline JIT compiler wrapper around Cranelift.

use cranelift_codegen::ir::UserFuncName;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, ModuleError, default_libcall_names};
use heron_vm_bytecode::{CodeBlock, PropertyCacheKind};
use heron_vm_value::Encoding;

use crate::patch::PatchTable;
use crate::stubs::{JitEntry, RuntimeStubs, SlowPathReason, StubFuncIds, StubKind, StubRefs};
use crate::translator::{self, TranslateInput};
use crate::value_ops::{NanBoxOps, TagPayloadOps};

/// Errors produced by the baseline JIT compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder or target ISA.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// Exception handlers resume in the middle of a function, which compiled
    /// code has no entry point for.
    #[error("code block '{0}' has exception handlers")]
    HasHandlers(String),

    /// Jump target is outside the code block.
    #[error("invalid jump target {target} from pc {pc}")]
    InvalidJumpTarget { pc: usize, target: i64 },

    /// Linked constant words do not match the constant pool.
    #[error("expected {expected} linked constants, got {actual}")]
    ConstantCount { expected: usize, actual: usize },
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

/// Everything needed to compile one CodeBlock.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub code: &'a CodeBlock,
    /// Engine id written into the frame header of compiled frames
    pub code_block_id: u32,
    /// Constant pool entries encoded as value words
    pub constants: &'a [u64],
}

/// Native code for one CodeBlock plus its patch points.
#[derive(Debug)]
pub struct CompiledCode {
    pub entry: JitEntry,
    pub patch: PatchTable,
}

impl CompiledCode {
    #[inline]
    pub fn entry_address(&self) -> *const u8 {
        self.entry as *const u8
    }
}

/// Compilation and slow-path counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitStats {
    pub compiled: u64,
    pub failed: u64,
    /// Polymorphic property routines synthesized
    pub stub_routines: u64,
    pub slow_paths: [u64; SlowPathReason::COUNT],
}

impl JitStats {
    #[inline]
    pub fn record_slow_path(&mut self, reason: SlowPathReason) {
        self.slow_paths[reason as usize] += 1;
    }

    #[inline]
    pub fn slow_path_count(&self, reason: SlowPathReason) -> u64 {
        self.slow_paths[reason as usize]
    }

    pub fn total_slow_paths(&self) -> u64 {
        self.slow_paths.iter().sum()
    }
}

/// Cranelift-backed baseline compiler for one engine.
pub struct JitCompiler {
    pub(crate) module: JITModule,
    pub(crate) function_builder_ctx: FunctionBuilderContext,
    pub(crate) context: cranelift_codegen::Context,
    pub(crate) stub_ids: StubFuncIds,
    pub(crate) stubs: RuntimeStubs,
    pub(crate) encoding: Encoding,
    pub(crate) next_function_id: u64,
    stats: JitStats,
}

impl JitCompiler {
    /// Create a compiler for the host ISA emitting `encoding` values and
    /// calling into `stubs`.
    pub fn new(encoding: Encoding, stubs: RuntimeStubs) -> Result<Self, JitError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| JitError::Builder(e.to_string()))?;
        let isa_builder = cranelift_native::builder().map_err(|e| JitError::Builder(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Builder(e.to_string()))?;

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        stubs.register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let stub_ids = StubFuncIds::declare(&mut module)?;

        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            stub_ids,
            stubs,
            encoding,
            next_function_id: 0,
            stats: JitStats::default(),
        })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn stubs(&self) -> &RuntimeStubs {
        &self.stubs
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut JitStats {
        &mut self.stats
    }

    /// Miss stub a property site of `kind` starts with
    pub fn property_miss_stub(&self, kind: PropertyCacheKind) -> *const u8 {
        match kind {
            PropertyCacheKind::Get => self.stubs.get(StubKind::GetByIdMiss),
            PropertyCacheKind::Put => self.stubs.get(StubKind::PutByIdMiss),
        }
    }

    pub(crate) fn function_name(&mut self, prefix: &str, name: &str) -> String {
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let id = self.next_function_id;
        self.next_function_id = self.next_function_id.saturating_add(1);
        format!("{prefix}_{sanitized}_{id}")
    }

    /// Compile a CodeBlock into native code.
    pub fn compile(&mut self, request: CompileRequest<'_>) -> Result<CompiledCode, JitError> {
        let result = self.compile_inner(request);
        match &result {
            Ok(_) => self.stats.compiled += 1,
            Err(err) => {
                self.stats.failed += 1;
                self.module.clear_context(&mut self.context);
                tracing::debug!(
                    code_block = %request.code.name,
                    error = %err,
                    "baseline compilation failed"
                );
            }
        }
        result
    }

    fn compile_inner(&mut self, request: CompileRequest<'_>) -> Result<CompiledCode, JitError> {
        let code = request.code;
        if !code.handlers().is_empty() {
            return Err(JitError::HasHandlers(code.name.clone()));
        }
        if request.constants.len() != code.constants().len() {
            return Err(JitError::ConstantCount {
                expected: code.constants().len(),
                actual: request.constants.len(),
            });
        }

        let patch = PatchTable::new(
            code.property_caches().len(),
            code.call_links().len(),
            |i| self.property_miss_stub(code.property_cache(i).borrow().kind),
            self.stubs.get(StubKind::CallLink),
            self.encoding.exception_sentinel(),
        );

        let call_conv = self.module.target_config().default_call_conv;
        let signature = StubKind::EntryCheckFailed.make_signature(call_conv);
        let name = self.function_name("heron_jit", &code.name);
        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;

        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );
        let stub_refs = StubRefs::declare(&self.stub_ids, &mut self.module, &mut self.context.func);

        {
            let input = TranslateInput {
                code,
                code_block_id: request.code_block_id,
                constants: request.constants,
                patch: &patch,
                call_conv,
            };
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            match self.encoding {
                Encoding::NanBox => {
                    translator::translate::<NanBoxOps>(&mut builder, &input, &stub_refs)?
                }
                Encoding::TagPayload => {
                    translator::translate::<TagPayloadOps>(&mut builder, &input, &stub_refs)?
                }
            }
            builder.finalize();
        }

        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;

        let code_ptr = self.module.get_finalized_function(func_id);
        let entry: JitEntry = unsafe {
            // SAFETY: the function was declared with the `(ctx, frame) -> i64`
            // signature that `JitEntry` describes.
            std::mem::transmute::<*const u8, JitEntry>(code_ptr)
        };
        tracing::debug!(
            code_block = %code.name,
            id = request.code_block_id,
            "baseline compiled"
        );
        Ok(CompiledCode { entry, patch })
    }
}

impl std::fmt::Debug for JitCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCompiler")
            .field("encoding", &self.encoding)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
