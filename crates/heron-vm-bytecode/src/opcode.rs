//! Opcode table
//!
//! [`OPCODE_TABLE`] is indexed by opcode id. Every entry names the opcode and
//! describes its operand slots, so the instruction length is a constant and
//! the next instruction is always `pc + length`.

use serde::Serialize;

/// What an operand slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperandKind {
    /// Register written by the instruction
    Dst,
    /// Register or constant read by the instruction
    Src,
    /// Register read and written in place
    SrcDst,
    /// Signed jump offset relative to the instruction start
    Jump,
    /// Identifier table index
    Ident,
    /// Property inline cache index
    PropertyCache,
    /// Call link index
    CallLink,
    /// Arithmetic profile index
    ArithProfile,
    /// Unsigned immediate (argument count, size, slot index)
    Count,
    /// Signed frame offset of a callee frame
    FrameOffset,
    /// First local index free for a varargs callee frame
    FirstFree,
    /// Nested function declaration index
    FunctionDecl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum Opcode {
    Enter,
    Nop,
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,
    Inc,
    Dec,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
    URShift,
    BitNot,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    NotEq,
    StrictEq,
    NotStrictEq,
    Not,
    ToNumber,
    Jmp,
    JTrue,
    JFalse,
    JLess,
    JNLess,
    JLessEq,
    JNLessEq,
    LoopHint,
    NewObject,
    GetById,
    PutById,
    GetByVal,
    PutByVal,
    NewFunction,
    Call,
    CallVarargs,
    Ret,
    Throw,
    Catch,
    CreateArguments,
    GetScope,
    CreateLexicalEnvironment,
    GetClosureVar,
    PutClosureVar,
    GetCallee,
    ArgumentCount,
}

/// Static description of one opcode
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub name: &'static str,
    /// Slot count including the opcode slot
    pub length: usize,
    pub operands: &'static [OperandKind],
}

const fn info(opcode: Opcode, name: &'static str, operands: &'static [OperandKind]) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        name,
        length: 1 + operands.len(),
        operands,
    }
}

use OperandKind::*;

const BINARY_PROFILED: &[OperandKind] = &[Dst, Src, Src, ArithProfile];
const BINARY: &[OperandKind] = &[Dst, Src, Src];
const UNARY: &[OperandKind] = &[Dst, Src];
const COMPARE_JUMP: &[OperandKind] = &[Src, Src, Jump];

pub const OPCODE_COUNT: usize = 54;

pub static OPCODE_TABLE: [OpcodeInfo; OPCODE_COUNT] = [
    info(Opcode::Enter, "enter", &[]),
    info(Opcode::Nop, "nop", &[]),
    info(Opcode::Mov, "mov", UNARY),
    info(Opcode::Add, "add", BINARY_PROFILED),
    info(Opcode::Sub, "sub", BINARY_PROFILED),
    info(Opcode::Mul, "mul", BINARY_PROFILED),
    info(Opcode::Div, "div", BINARY_PROFILED),
    info(Opcode::Mod, "mod", BINARY_PROFILED),
    info(Opcode::Negate, "negate", &[Dst, Src, ArithProfile]),
    info(Opcode::Inc, "inc", &[SrcDst]),
    info(Opcode::Dec, "dec", &[SrcDst]),
    info(Opcode::BitAnd, "bitand", BINARY),
    info(Opcode::BitOr, "bitor", BINARY),
    info(Opcode::BitXor, "bitxor", BINARY),
    info(Opcode::LShift, "lshift", BINARY),
    info(Opcode::RShift, "rshift", BINARY),
    info(Opcode::URShift, "urshift", BINARY),
    info(Opcode::BitNot, "bitnot", UNARY),
    info(Opcode::Less, "less", BINARY),
    info(Opcode::LessEq, "lesseq", BINARY),
    info(Opcode::Greater, "greater", BINARY),
    info(Opcode::GreaterEq, "greatereq", BINARY),
    info(Opcode::Eq, "eq", BINARY),
    info(Opcode::NotEq, "neq", BINARY),
    info(Opcode::StrictEq, "stricteq", BINARY),
    info(Opcode::NotStrictEq, "nstricteq", BINARY),
    info(Opcode::Not, "not", UNARY),
    info(Opcode::ToNumber, "to_number", UNARY),
    info(Opcode::Jmp, "jmp", &[Jump]),
    info(Opcode::JTrue, "jtrue", &[Src, Jump]),
    info(Opcode::JFalse, "jfalse", &[Src, Jump]),
    info(Opcode::JLess, "jless", COMPARE_JUMP),
    info(Opcode::JNLess, "jnless", COMPARE_JUMP),
    info(Opcode::JLessEq, "jlesseq", COMPARE_JUMP),
    info(Opcode::JNLessEq, "jnlesseq", COMPARE_JUMP),
    info(Opcode::LoopHint, "loop_hint", &[]),
    info(Opcode::NewObject, "new_object", &[Dst]),
    info(Opcode::GetById, "get_by_id", &[Dst, Src, Ident, PropertyCache]),
    info(Opcode::PutById, "put_by_id", &[Src, Ident, Src, PropertyCache]),
    info(Opcode::GetByVal, "get_by_val", BINARY),
    info(Opcode::PutByVal, "put_by_val", &[Src, Src, Src]),
    info(Opcode::NewFunction, "new_function", &[Dst, FunctionDecl]),
    info(Opcode::Call, "call", &[Dst, Src, Count, FrameOffset, CallLink]),
    info(
        Opcode::CallVarargs,
        "call_varargs",
        &[Dst, Src, Src, Src, FirstFree, CallLink],
    ),
    info(Opcode::Ret, "ret", &[Src]),
    info(Opcode::Throw, "throw", &[Src]),
    info(Opcode::Catch, "catch", &[Dst]),
    info(Opcode::CreateArguments, "create_arguments", &[Dst]),
    info(Opcode::GetScope, "get_scope", &[Dst]),
    info(
        Opcode::CreateLexicalEnvironment,
        "create_lexical_environment",
        &[Dst, Count],
    ),
    info(Opcode::GetClosureVar, "get_closure_var", &[Dst, Src, Count]),
    info(Opcode::PutClosureVar, "put_closure_var", &[Src, Count, Src]),
    info(Opcode::GetCallee, "get_callee", &[Dst]),
    info(Opcode::ArgumentCount, "argument_count", &[Dst]),
];

impl Opcode {
    #[inline]
    pub fn from_u8(id: u8) -> Option<Self> {
        OPCODE_TABLE.get(id as usize).map(|info| info.opcode)
    }

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn info(self) -> &'static OpcodeInfo {
        &OPCODE_TABLE[self as usize]
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Slot count including the opcode slot
    #[inline]
    pub fn length(self) -> usize {
        self.info().length
    }

    pub fn is_jump(self) -> bool {
        self.info().operands.contains(&OperandKind::Jump)
    }

    /// Instructions after which control never falls through
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jmp | Self::Ret | Self::Throw)
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod | Self::Negate
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
