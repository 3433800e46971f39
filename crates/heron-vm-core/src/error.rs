//! VM error types

use heron_vm_value::Value;
use serde::Serialize;
use thiserror::Error;

/// VM execution errors
#[derive(Debug, Error)]
pub enum VmError {
    /// Type error (e.g., calling a non-function)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Reference error (unresolvable scope variable)
    #[error("ReferenceError: {0}")]
    ReferenceError(String),

    /// Range error
    #[error("RangeError: {0}")]
    RangeError(String),

    /// Call depth or register file exhausted
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    /// Thrown language value
    #[error("Uncaught exception: {0}")]
    Exception(Box<ThrownValue>),

    /// Host requested termination. Skips every handler.
    #[error("Execution terminated")]
    Terminated,

    /// Cell table is full
    #[error("OutOfMemory")]
    OutOfMemory,

    /// Installation of an invalid CodeBlock
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] heron_vm_bytecode::BytecodeError),

    /// Broken engine invariant
    #[error("InternalError: {0}")]
    Internal(String),
}

/// A thrown value and the stack at the throw point
#[derive(Debug)]
pub struct ThrownValue {
    /// The thrown value. Cells are only meaningful to the engine that threw.
    pub value: Value,
    /// The thrown value rendered with ToString
    pub message: String,
    /// Innermost frame first
    pub stack: Vec<StackFrameInfo>,
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Which tier ran a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTier {
    Interpreter,
    Baseline,
}

/// One frame of a backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrameInfo {
    /// CodeBlock name
    pub function: String,
    pub bytecode_offset: u32,
    pub line: Option<u32>,
    pub tier: ExecutionTier,
}

impl std::fmt::Display for StackFrameInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at {} (bc#{}", self.function, self.bytecode_offset)?;
        if let Some(line) = self.line {
            write!(f, ", line {line}")?;
        }
        let tier = match self.tier {
            ExecutionTier::Interpreter => "interpreter",
            ExecutionTier::Baseline => "baseline",
        };
        write!(f, ") [{tier}]")
    }
}

impl VmError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a reference error
    pub fn reference_error(msg: impl Into<String>) -> Self {
        Self::ReferenceError(msg.into())
    }

    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether handler tables may intercept this error
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            Self::TypeError(_)
                | Self::ReferenceError(_)
                | Self::RangeError(_)
                | Self::StackOverflow
                | Self::Exception(_)
        )
    }

    pub fn thrown(&self) -> Option<&ThrownValue> {
        match self {
            Self::Exception(thrown) => Some(thrown),
            _ => None,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_and_internal_errors_are_uncatchable() {
        assert!(VmError::StackOverflow.is_catchable());
        assert!(VmError::type_error("x").is_catchable());
        assert!(!VmError::Terminated.is_catchable());
        assert!(!VmError::OutOfMemory.is_catchable());
        assert!(!VmError::internal("bug").is_catchable());
    }

    #[test]
    fn frame_display() {
        let frame = StackFrameInfo {
            function: "fib".into(),
            bytecode_offset: 12,
            line: Some(3),
            tier: ExecutionTier::Baseline,
        };
        assert_eq!(frame.to_string(), "at fib (bc#12, line 3) [baseline]");
        assert_eq!(
            VmError::StackOverflow.to_string(),
            "RangeError: Maximum call stack size exceeded"
        );
    }
}
