//! Bytecode errors

use thiserror::Error;

/// Errors found while assembling or validating a CodeBlock
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("invalid opcode {opcode} at offset {offset}")]
    InvalidOpcode { offset: usize, opcode: u32 },

    #[error("instruction at offset {offset} runs past the end of the stream")]
    Truncated { offset: usize },

    #[error("label {0} was never bound")]
    UnboundLabel(u32),

    #[error("label {0} was bound twice")]
    LabelRebound(u32),

    #[error("jump at offset {offset} targets {target}, which is not an instruction start")]
    InvalidJumpTarget { offset: usize, target: i64 },

    #[error("local register loc{local} at offset {offset} exceeds the frame's {num_locals} locals")]
    LocalOutOfRange {
        offset: usize,
        local: u32,
        num_locals: u32,
    },

    #[error("argument register arg{index} at offset {offset} exceeds the {num_parameters} declared parameters")]
    ArgumentOutOfRange {
        offset: usize,
        index: u32,
        num_parameters: u32,
    },

    #[error("register {register} at offset {offset} names a frame header slot")]
    HeaderRegister { offset: usize, register: i32 },

    #[error("constant k{index} at offset {offset} is outside the constant pool")]
    ConstantOutOfRange { offset: usize, index: u32 },

    #[error("{what} index {index} at offset {offset} is out of range")]
    MetadataOutOfRange {
        offset: usize,
        what: &'static str,
        index: u32,
    },

    #[error("exception handler [{start}, {end}) -> {target} is malformed")]
    InvalidHandler { start: u32, end: u32, target: u32 },

    #[error("call frame released out of order")]
    CallFrameOrder,

    #[error("code block '{0}' is empty")]
    Empty(String),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
