//! # Heron VM JIT
//!
//! Baseline Cranelift JIT: one native function per CodeBlock, with inline
//! fast paths for the common operand types and calls into runtime stubs for
//! everything else.
//!
//! Compiled code and the interpreter share the register file, the frame
//! layout and the value encoding, so either tier can run any frame and a
//! slow path can re-execute a single instruction in the runtime.

#![warn(clippy::all)]

pub mod compiler;
pub mod context;
pub mod patch;
pub mod stub_routines;
pub mod stubs;
mod translator;
pub mod value_ops;

pub use compiler::{CompileRequest, CompiledCode, JitCompiler, JitError, JitStats};
pub use context::JitContext;
pub use patch::{CallSite, PatchTable, PropertySite};
pub use stub_routines::RoutineCase;
pub use stubs::{JitEntry, RuntimeStubs, STUB_COUNT, SlowPathReason, StubKind};
pub use value_ops::{NanBoxOps, TagPayloadOps, ValueOps};
