//! # Heron VM Core
//!
//! Execution engine of the Heron VM: installed CodeBlocks, the heap and
//! object model, the register file, the interpreter, inline caches and the
//! runtime stubs the baseline JIT calls into.
//!
//! Both tiers run frames in one shared register file with one value
//! encoding, so a call may cross between interpreted and compiled code in
//! either direction and a compiled frame can re-execute any instruction
//! through the interpreter's handlers.

#![warn(clippy::all)]

pub mod code;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod heap;
mod inline_cache;
pub mod interpreter;
mod object;
pub mod ops;
mod stubs;
pub mod structure;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, FunctionRef, HostFn, TerminationHandle};
pub use error::{ExecutionTier, StackFrameInfo, ThrownValue, VmError, VmResult};
pub use interpreter::ExecutionState;
pub use heron_vm_value::{CellId, Encoding, Value};
