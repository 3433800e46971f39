//! # Heron VM Bytecode
//!
//! The binary contract between a bytecode producer and the engine.
//!
//! - **Flat**: a CodeBlock's instructions are one `u32` slot array
//! - **Fixed length**: every opcode's slot count comes from [`OPCODE_TABLE`]
//! - **Frame relative**: operands are word offsets from the frame pointer
//! - **Metadata slots**: property access, calls and arithmetic carry an index
//!   into per-site metadata owned by the [`CodeBlock`]

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod builder;
pub mod code_block;
pub mod constant;
pub mod error;
pub mod metadata;
pub mod opcode;
pub mod operand;

pub use builder::{CallFrameLayout, CodeBlockBuilder, Label};
pub use code_block::{CodeBlock, HandlerInfo, Instruction, LineInfo};
pub use constant::{Constant, ConstantPool};
pub use error::{BytecodeError, Result};
pub use metadata::{
    ArithProfile, CacheEntry, CallLinkInfo, CallLinkState, PropertyAccess, PropertyCacheKind,
    PropertyCacheState, PropertyInlineCache, StructureId,
};
pub use opcode::{OPCODE_COUNT, OPCODE_TABLE, Opcode, OpcodeInfo, OperandKind};
pub use operand::{FIRST_CONSTANT_REGISTER, VirtualRegister, header};
