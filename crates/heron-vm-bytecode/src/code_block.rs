//! CodeBlock: one compiled function or script

use std::cell::RefCell;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::constant::Constant;
use crate::error::{BytecodeError, Result};
use crate::metadata::{ArithProfile, CallLinkInfo, PropertyInlineCache};
use crate::opcode::{Opcode, OperandKind};
use crate::operand::VirtualRegister;

/// Exception handler covering the half-open bytecode range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub start: u32,
    pub end: u32,
    pub target: u32,
}

impl HandlerInfo {
    #[inline]
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Source line for instructions starting at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInfo {
    pub offset: u32,
    pub line: u32,
}

/// Borrowed view of one instruction
#[derive(Debug, Clone, Copy)]
pub struct Instruction<'a> {
    pub offset: usize,
    pub opcode: Opcode,
    operands: &'a [u32],
}

impl<'a> Instruction<'a> {
    #[inline]
    pub fn operand(&self, i: usize) -> u32 {
        self.operands[i]
    }

    #[inline]
    pub fn reg(&self, i: usize) -> VirtualRegister {
        VirtualRegister::from_slot(self.operands[i])
    }

    /// Absolute target of a jump operand
    #[inline]
    pub fn jump_target(&self, i: usize) -> i64 {
        self.offset as i64 + i64::from(self.operands[i] as i32)
    }

    #[inline]
    pub fn operands(&self) -> &'a [u32] {
        self.operands
    }

    #[inline]
    pub fn next_offset(&self) -> usize {
        self.offset + self.opcode.length()
    }
}

/// Compiled unit: instruction stream, constants and per-site metadata.
#[derive(Debug)]
pub struct CodeBlock {
    pub name: String,
    pub(crate) instructions: Box<[u32]>,
    pub(crate) constants: Box<[Constant]>,
    pub(crate) identifiers: Box<[Box<str>]>,
    pub(crate) function_decls: Vec<CodeBlock>,
    pub(crate) handlers: Box<[HandlerInfo]>,
    pub(crate) lines: Box<[LineInfo]>,
    /// Parameter count including `this`
    pub(crate) num_parameters: u32,
    pub(crate) num_locals: u32,
    pub(crate) arith_profiles: Box<[ArithProfile]>,
    pub(crate) property_caches: Box<[RefCell<PropertyInlineCache>]>,
    pub(crate) call_links: Box<[RefCell<CallLinkInfo>]>,
}

impl CodeBlock {
    #[inline]
    pub fn instructions(&self) -> &[u32] {
        &self.instructions
    }

    #[inline]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[inline]
    pub fn identifiers(&self) -> &[Box<str>] {
        &self.identifiers
    }

    #[inline]
    pub fn identifier(&self, index: u32) -> &str {
        &self.identifiers[index as usize]
    }

    #[inline]
    pub fn handlers(&self) -> &[HandlerInfo] {
        &self.handlers
    }

    #[inline]
    pub fn lines(&self) -> &[LineInfo] {
        &self.lines
    }

    #[inline]
    pub fn num_parameters(&self) -> u32 {
        self.num_parameters
    }

    #[inline]
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    #[inline]
    pub fn arith_profile(&self, index: u32) -> &ArithProfile {
        &self.arith_profiles[index as usize]
    }

    #[inline]
    pub fn arith_profiles(&self) -> &[ArithProfile] {
        &self.arith_profiles
    }

    #[inline]
    pub fn property_cache(&self, index: u32) -> &RefCell<PropertyInlineCache> {
        &self.property_caches[index as usize]
    }

    #[inline]
    pub fn property_caches(&self) -> &[RefCell<PropertyInlineCache>] {
        &self.property_caches
    }

    #[inline]
    pub fn call_link(&self, index: u32) -> &RefCell<CallLinkInfo> {
        &self.call_links[index as usize]
    }

    #[inline]
    pub fn call_links(&self) -> &[RefCell<CallLinkInfo>] {
        &self.call_links
    }

    pub fn function_decls(&self) -> &[CodeBlock] {
        &self.function_decls
    }

    /// Move nested declarations out; the engine installs them separately.
    pub fn take_function_decls(&mut self) -> Vec<CodeBlock> {
        std::mem::take(&mut self.function_decls)
    }

    /// Decode the instruction starting at `offset`
    #[inline]
    pub fn instruction_at(&self, offset: usize) -> Instruction<'_> {
        let opcode = Opcode::from_u8(self.instructions[offset] as u8)
            .unwrap_or_else(|| unreachable!("validated stream holds an invalid opcode"));
        Instruction {
            offset,
            opcode,
            operands: &self.instructions[offset + 1..offset + opcode.length()],
        }
    }

    pub fn iter(&self) -> InstructionIter<'_> {
        InstructionIter {
            block: self,
            offset: 0,
        }
    }

    /// First handler whose range covers `offset`
    pub fn handler_for(&self, offset: u32) -> Option<&HandlerInfo> {
        self.handlers.iter().find(|h| h.covers(offset))
    }

    /// Source line of the instruction at `offset`
    pub fn line_for(&self, offset: u32) -> Option<u32> {
        let idx = self.lines.partition_point(|l| l.offset <= offset);
        idx.checked_sub(1).map(|i| self.lines[i].line)
    }

    /// Check every instruction and operand. Called by the builder; the
    /// engine relies on a validated stream.
    pub fn validate(&self) -> Result<()> {
        if self.instructions.is_empty() {
            return Err(BytecodeError::Empty(self.name.clone()));
        }
        let mut starts = vec![false; self.instructions.len() + 1];
        let mut offset = 0;
        while offset < self.instructions.len() {
            let raw = self.instructions[offset];
            let opcode = u8::try_from(raw)
                .ok()
                .and_then(Opcode::from_u8)
                .ok_or(BytecodeError::InvalidOpcode { offset, opcode: raw })?;
            if offset + opcode.length() > self.instructions.len() {
                return Err(BytecodeError::Truncated { offset });
            }
            starts[offset] = true;
            offset += opcode.length();
        }

        for inst in self.iter() {
            for (i, kind) in inst.opcode.info().operands.iter().enumerate() {
                self.validate_operand(&inst, i, *kind, &starts)?;
            }
        }

        for h in self.handlers.iter() {
            let in_range = |o: u32| (o as usize) <= self.instructions.len();
            if h.start >= h.end
                || !in_range(h.end)
                || !starts[h.start as usize]
                || !starts.get(h.target as usize).copied().unwrap_or(false)
            {
                return Err(BytecodeError::InvalidHandler {
                    start: h.start,
                    end: h.end,
                    target: h.target,
                });
            }
        }
        Ok(())
    }

    fn validate_operand(
        &self,
        inst: &Instruction<'_>,
        i: usize,
        kind: OperandKind,
        starts: &[bool],
    ) -> Result<()> {
        let offset = inst.offset;
        let slot = inst.operand(i);
        let check_index = |len: usize, what: &'static str| {
            if (slot as usize) < len {
                Ok(())
            } else {
                Err(BytecodeError::MetadataOutOfRange {
                    offset,
                    what,
                    index: slot,
                })
            }
        };
        match kind {
            OperandKind::Dst | OperandKind::Src | OperandKind::SrcDst => {
                let reg = inst.reg(i);
                if let Some(index) = reg.to_constant() {
                    if kind != OperandKind::Src || index as usize >= self.constants.len() {
                        return Err(BytecodeError::ConstantOutOfRange { offset, index });
                    }
                } else if let Some(local) = reg.to_local() {
                    if local >= self.num_locals {
                        return Err(BytecodeError::LocalOutOfRange {
                            offset,
                            local,
                            num_locals: self.num_locals,
                        });
                    }
                } else if let Some(index) = reg.to_argument() {
                    if index >= self.num_parameters {
                        return Err(BytecodeError::ArgumentOutOfRange {
                            offset,
                            index,
                            num_parameters: self.num_parameters,
                        });
                    }
                } else {
                    return Err(BytecodeError::HeaderRegister {
                        offset,
                        register: reg.0,
                    });
                }
                Ok(())
            }
            OperandKind::Jump => {
                let target = inst.jump_target(i);
                let valid = target >= 0
                    && (target as usize) < self.instructions.len()
                    && starts[target as usize];
                if valid {
                    Ok(())
                } else {
                    Err(BytecodeError::InvalidJumpTarget { offset, target })
                }
            }
            OperandKind::Ident => check_index(self.identifiers.len(), "identifier"),
            OperandKind::PropertyCache => check_index(self.property_caches.len(), "property cache"),
            OperandKind::CallLink => check_index(self.call_links.len(), "call link"),
            OperandKind::ArithProfile => check_index(self.arith_profiles.len(), "arith profile"),
            OperandKind::FunctionDecl => check_index(self.function_decls.len(), "function decl"),
            OperandKind::FirstFree => {
                if slot <= self.num_locals {
                    Ok(())
                } else {
                    Err(BytecodeError::LocalOutOfRange {
                        offset,
                        local: slot,
                        num_locals: self.num_locals,
                    })
                }
            }
            OperandKind::Count | OperandKind::FrameOffset => Ok(()),
        }
    }

    /// Human-readable listing
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} (params={}, locals={}, {} slots)",
            self.name,
            self.num_parameters,
            self.num_locals,
            self.instructions.len()
        );
        for inst in self.iter() {
            let _ = write!(out, "  [{:4}] {:<26}", inst.offset, inst.opcode.name());
            let kinds = inst.opcode.info().operands;
            let rendered: Vec<String> = kinds
                .iter()
                .enumerate()
                .map(|(i, kind)| self.render_operand(&inst, i, *kind))
                .collect();
            let _ = writeln!(out, "{}", rendered.join(", "));
        }
        if !self.constants.is_empty() {
            let _ = writeln!(out, "  constants:");
            for (i, c) in self.constants.iter().enumerate() {
                let _ = writeln!(out, "    k{i} = {c:?}");
            }
        }
        for h in self.handlers.iter() {
            let _ = writeln!(out, "  handler [{}, {}) -> {}", h.start, h.end, h.target);
        }
        out
    }

    fn render_operand(&self, inst: &Instruction<'_>, i: usize, kind: OperandKind) -> String {
        let slot = inst.operand(i);
        match kind {
            OperandKind::Dst | OperandKind::Src | OperandKind::SrcDst => inst.reg(i).to_string(),
            OperandKind::Jump => format!("->{}", inst.jump_target(i)),
            OperandKind::Ident => format!("id{}({})", slot, self.identifier(slot)),
            OperandKind::PropertyCache => format!("ic{slot}"),
            OperandKind::CallLink => format!("link{slot}"),
            OperandKind::ArithProfile => format!("prof{slot}"),
            OperandKind::FunctionDecl => format!("f{slot}"),
            OperandKind::FrameOffset => format!("frame{}", slot as i32),
            OperandKind::FirstFree => format!("free{slot}"),
            OperandKind::Count => slot.to_string(),
        }
    }
}

pub struct InstructionIter<'a> {
    block: &'a CodeBlock,
    offset: usize,
}

impl<'a> Iterator for InstructionIter<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.instructions.len() {
            return None;
        }
        let inst = self.block.instruction_at(self.offset);
        self.offset = inst.next_offset();
        Some(inst)
    }
}
