//! Installed CodeBlocks

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use heron_vm_bytecode::{CodeBlock, Instruction, Opcode, OperandKind, VirtualRegister};
use heron_vm_jit::CompiledCode;

use crate::structure::Atom;

/// Execution tier of a CodeBlock
#[derive(Debug, Default)]
pub enum JitState {
    #[default]
    Interpreted,
    Compiled(Rc<CompiledCode>),
    /// Compilation failed; never retried
    NotCompilable,
}

/// A CodeBlock linked into one engine: constants encoded, identifiers
/// interned and nested declarations installed.
#[derive(Debug)]
pub struct LinkedCodeBlock {
    pub id: u32,
    pub code: CodeBlock,
    /// Constant pool as value words
    pub constants: Box<[u64]>,
    /// Identifier table as atoms
    pub identifiers: Box<[Atom]>,
    /// Engine ids of the nested function declarations
    pub decls: Box<[u32]>,
    /// Static argument count of each call link; `None` for varargs sites
    call_argc: Box<[Option<u32>]>,
    /// Some instruction overwrites a passed argument register
    writes_arguments: bool,
    counter: Cell<u32>,
    pub(crate) jit: RefCell<JitState>,
}

impl LinkedCodeBlock {
    pub(crate) fn new(
        id: u32,
        code: CodeBlock,
        constants: Box<[u64]>,
        identifiers: Box<[Atom]>,
        decls: Box<[u32]>,
    ) -> Self {
        let mut call_argc = vec![None; code.call_links().len()];
        let mut writes_arguments = false;
        for inst in code.iter() {
            writes_arguments |= overwrites_argument(&inst);
            if inst.opcode == Opcode::Call
                && let Some(slot) = call_argc.get_mut(inst.operand(4) as usize)
            {
                *slot = Some(inst.operand(2));
            }
        }
        Self {
            id,
            call_argc: call_argc.into_boxed_slice(),
            writes_arguments,
            code,
            constants,
            identifiers,
            decls,
            counter: Cell::new(0),
            jit: RefCell::new(JitState::Interpreted),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.code.name
    }

    #[inline]
    pub fn constant(&self, reg: VirtualRegister) -> Option<u64> {
        reg.to_constant().map(|k| self.constants[k as usize])
    }

    #[inline]
    pub fn identifier(&self, index: u32) -> Atom {
        self.identifiers[index as usize]
    }

    /// Argument count, including `this`, passed at call link `index`
    #[inline]
    pub fn call_argc(&self, index: u32) -> Option<u32> {
        self.call_argc.get(index as usize).copied().flatten()
    }

    /// Whether the argument registers can diverge from the values the
    /// frame was called with
    #[inline]
    pub fn writes_arguments(&self) -> bool {
        self.writes_arguments
    }

    /// Entry and back-edge count
    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter.get()
    }

    #[inline]
    pub(crate) fn bump(&self) -> u32 {
        let next = self.counter.get().saturating_add(1);
        self.counter.set(next);
        next
    }

    pub fn compiled(&self) -> Option<Rc<CompiledCode>> {
        match &*self.jit.borrow() {
            JitState::Compiled(code) => Some(Rc::clone(code)),
            _ => None,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(&*self.jit.borrow(), JitState::Compiled(_))
    }

    pub fn is_not_compilable(&self) -> bool {
        matches!(&*self.jit.borrow(), JitState::NotCompilable)
    }
}

/// `inst` stores into an argument register other than `this`
fn overwrites_argument(inst: &Instruction<'_>) -> bool {
    inst.opcode
        .info()
        .operands
        .iter()
        .enumerate()
        .any(|(i, kind)| {
            matches!(kind, OperandKind::Dst | OperandKind::SrcDst)
                && inst.reg(i).to_argument().is_some_and(|k| k >= 1)
        })
}
