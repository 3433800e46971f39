//! Runtime stub ABI.
//!
//! Stubs are `extern "C"` functions implemented by the runtime. Every stub
//! takes the [`JitContext`](crate::JitContext) and the current frame pointer
//! first, then `i64` operands, and returns an `i64` value word or the
//! encoding's exception sentinel.
//!
//! Generated code stores the current bytecode offset into the frame header
//! before every stub call, so a stub always sees an exact call-site record.
//!
//! ```text
//! heron-vm-jit   (declares kinds + signatures, imports symbols)
//!       ↑
//! heron-vm-core  (implements the stubs, fills RuntimeStubs)
//! ```

use cranelift_codegen::ir::{self, AbiParam, types};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::JitError;

/// Signature of a compiled function: `(ctx, frame) -> value`
pub type JitEntry = unsafe extern "C" fn(*mut crate::JitContext, *mut u64) -> u64;

/// Identifies a runtime stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StubKind {
    /// `(ctx, frame, pc, reason) -> status`. Re-executes the instruction at
    /// `pc` with full semantics. Conditional jumps return 1 when taken.
    SlowPath = 0,
    /// `(ctx, frame) -> sentinel`. Prologue failed its depth, capacity or
    /// termination check.
    EntryCheckFailed = 1,
    /// `(ctx, frame, pc, site, base) -> value`
    GetByIdMiss = 2,
    /// `(ctx, frame, pc, site, base) -> value`
    GetByIdGeneric = 3,
    /// `(ctx, frame, pc, site, base, value) -> status`
    PutByIdMiss = 4,
    /// `(ctx, frame, pc, site, base, value) -> status`
    PutByIdGeneric = 5,
    /// `(ctx, frame, pc, site, callee_frame) -> value`. Performs the call and
    /// links the site when possible.
    CallLink = 6,
    /// `(ctx, frame, pc, site, callee_frame) -> value`. Performs the call
    /// without linking.
    CallVirtual = 7,
}

pub const STUB_COUNT: usize = 8;

impl StubKind {
    pub const ALL: [StubKind; STUB_COUNT] = [
        Self::SlowPath,
        Self::EntryCheckFailed,
        Self::GetByIdMiss,
        Self::GetByIdGeneric,
        Self::PutByIdMiss,
        Self::PutByIdGeneric,
        Self::CallLink,
        Self::CallVirtual,
    ];

    /// Symbol name used for Cranelift import resolution
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::SlowPath => "heron_stub_slow_path",
            Self::EntryCheckFailed => "heron_stub_entry_check_failed",
            Self::GetByIdMiss => "heron_stub_get_by_id_miss",
            Self::GetByIdGeneric => "heron_stub_get_by_id_generic",
            Self::PutByIdMiss => "heron_stub_put_by_id_miss",
            Self::PutByIdGeneric => "heron_stub_put_by_id_generic",
            Self::CallLink => "heron_stub_call_link",
            Self::CallVirtual => "heron_stub_call_virtual",
        }
    }

    /// Number of parameters including ctx and frame
    pub fn param_count(self) -> usize {
        match self {
            Self::EntryCheckFailed => 2,
            Self::SlowPath => 4,
            Self::GetByIdMiss | Self::GetByIdGeneric | Self::CallLink | Self::CallVirtual => 5,
            Self::PutByIdMiss | Self::PutByIdGeneric => 6,
        }
    }

    pub fn make_signature(self, call_conv: CallConv) -> ir::Signature {
        signature(call_conv, self.param_count())
    }
}

/// `params` i64 parameters returning one i64
pub(crate) fn signature(call_conv: CallConv, params: usize) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    for _ in 0..params {
        sig.params.push(AbiParam::new(types::I64));
    }
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// Why generated code left its fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlowPathReason {
    /// An operand had a tag the fast path does not handle
    TypeMismatch = 0,
    /// Int32 arithmetic overflowed
    ArithmeticOverflow = 1,
    /// The int32 result would have been negative zero
    NegativeZero = 2,
    /// Receiver structure differed from the cached one
    ShapeMismatch = 3,
    /// Callee differed from the linked one
    CallLinkMiss = 4,
    /// Instruction has no inline fast path
    NotInlined = 5,
    /// Termination was requested at a loop back edge
    Termination = 6,
}

impl SlowPathReason {
    pub const COUNT: usize = 7;

    pub const ALL: [SlowPathReason; Self::COUNT] = [
        Self::TypeMismatch,
        Self::ArithmeticOverflow,
        Self::NegativeZero,
        Self::ShapeMismatch,
        Self::CallLinkMiss,
        Self::NotInlined,
        Self::Termination,
    ];

    pub fn from_raw(raw: i64) -> Option<Self> {
        usize::try_from(raw).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TypeMismatch => "type-mismatch",
            Self::ArithmeticOverflow => "arithmetic-overflow",
            Self::NegativeZero => "negative-zero",
            Self::ShapeMismatch => "shape-mismatch",
            Self::CallLinkMiss => "call-link-miss",
            Self::NotInlined => "not-inlined",
            Self::Termination => "termination",
        }
    }
}

/// Table of stub addresses, filled by the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeStubs {
    ptrs: [*const u8; STUB_COUNT],
}

impl RuntimeStubs {
    /// # Safety
    ///
    /// Every pointer must be an `extern "C"` function with the signature
    /// documented on its [`StubKind`].
    pub unsafe fn new(ptrs: [*const u8; STUB_COUNT]) -> Self {
        Self { ptrs }
    }

    #[inline]
    pub fn get(&self, kind: StubKind) -> *const u8 {
        self.ptrs[kind as usize]
    }

    pub fn register_symbols(&self, builder: &mut JITBuilder) {
        for kind in StubKind::ALL {
            builder.symbol(kind.symbol_name(), self.get(kind));
        }
    }
}

/// Module-level ids of the imported stubs
pub(crate) struct StubFuncIds {
    ids: [FuncId; STUB_COUNT],
}

impl StubFuncIds {
    pub fn declare<M: Module>(module: &mut M) -> Result<Self, JitError> {
        let call_conv = module.target_config().default_call_conv;
        let mut ids = Vec::with_capacity(STUB_COUNT);
        for kind in StubKind::ALL {
            let sig = kind.make_signature(call_conv);
            ids.push(module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?);
        }
        let ids = ids
            .try_into()
            .map_err(|_| JitError::Builder("stub declaration count mismatch".into()))?;
        Ok(Self { ids })
    }

    #[inline]
    pub fn get(&self, kind: StubKind) -> FuncId {
        self.ids[kind as usize]
    }
}

/// Stub references declared into one function being compiled
pub(crate) struct StubRefs {
    refs: [ir::FuncRef; STUB_COUNT],
}

impl StubRefs {
    pub fn declare<M: Module>(ids: &StubFuncIds, module: &mut M, func: &mut ir::Function) -> Self {
        Self {
            refs: StubKind::ALL.map(|kind| module.declare_func_in_func(ids.get(kind), func)),
        }
    }

    #[inline]
    pub fn get(&self, kind: StubKind) -> ir::FuncRef {
        self.refs[kind as usize]
    }
}
