//! Programmatic CodeBlock assembly.
//!
//! ```
//! use heron_vm_bytecode::CodeBlockBuilder;
//!
//! let mut b = CodeBlockBuilder::new("add").parameters(2);
//! let sum = b.new_register();
//! let (a, c) = (b.param(0), b.param(1));
//! b.emit_add(sum, a, c);
//! b.emit_ret(sum);
//! let code = b.build().unwrap();
//! assert_eq!(code.num_parameters(), 3);
//! ```
//!
//! Call frames are reserved at the top of the local area with
//! [`CodeBlockBuilder::call_frame`] and released by the call that uses them.
//! Registers allocated after a call frame was released may overlap it and
//! must not be live across that call.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::code_block::{CodeBlock, HandlerInfo, LineInfo};
use crate::constant::{Constant, ConstantPool};
use crate::error::{BytecodeError, Result};
use crate::metadata::{ArithProfile, CallLinkInfo, PropertyCacheKind, PropertyInlineCache};
use crate::opcode::{Opcode, OperandKind};
use crate::operand::{VirtualRegister, header};

/// Jump destination, bound to an offset with [`CodeBlockBuilder::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Registers reserved for an outgoing call.
///
/// The callee frame pointer is `fp + register_offset`; `this` and the
/// arguments are the callee's argument slots seen from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrameLayout {
    base: u32,
    argc: u32,
    pub register_offset: i32,
}

impl CallFrameLayout {
    /// Argument count including `this`
    #[inline]
    pub fn argc(&self) -> u32 {
        self.argc
    }

    #[inline]
    pub fn this(&self) -> VirtualRegister {
        self.argument(0)
    }

    /// Argument `k` of the callee; argument 0 is `this`
    #[inline]
    pub fn argument(&self, k: u32) -> VirtualRegister {
        debug_assert!(k < self.argc);
        VirtualRegister(self.register_offset + header::SIZE + k as i32)
    }

    fn size(&self) -> u32 {
        self.argc + header::SIZE as u32
    }
}

pub struct CodeBlockBuilder {
    name: String,
    instructions: Vec<u32>,
    constants: ConstantPool,
    identifiers: Vec<Box<str>>,
    identifier_index: FxHashMap<Box<str>, u32>,
    function_decls: Vec<CodeBlock>,
    handlers: Vec<(Label, Label, Label)>,
    lines: Vec<LineInfo>,
    num_parameters: u32,
    next_local: u32,
    max_locals: u32,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, usize, Label)>,
    arith_profiles: u32,
    property_caches: Vec<PropertyInlineCache>,
    call_links: u32,
    error: Option<BytecodeError>,
}

impl CodeBlockBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            constants: ConstantPool::new(),
            identifiers: Vec::new(),
            identifier_index: FxHashMap::default(),
            function_decls: Vec::new(),
            handlers: Vec::new(),
            lines: Vec::new(),
            num_parameters: 1,
            next_local: 0,
            max_locals: 0,
            labels: Vec::new(),
            fixups: Vec::new(),
            arith_profiles: 0,
            property_caches: Vec::new(),
            call_links: 0,
            error: None,
        }
    }

    /// Declared parameter count, not counting `this`
    pub fn parameters(mut self, count: u32) -> Self {
        self.num_parameters = count + 1;
        self
    }

    #[inline]
    pub fn this_register(&self) -> VirtualRegister {
        VirtualRegister::argument(0)
    }

    /// Declared parameter `index` (0-based, `this` excluded)
    #[inline]
    pub fn param(&self, index: u32) -> VirtualRegister {
        VirtualRegister::argument(index + 1)
    }

    pub fn new_register(&mut self) -> VirtualRegister {
        let reg = VirtualRegister::local(self.next_local);
        self.next_local += 1;
        self.max_locals = self.max_locals.max(self.next_local);
        reg
    }

    #[inline]
    pub fn current_offset(&self) -> u32 {
        self.instructions.len() as u32
    }

    // -- constants ----------------------------------------------------------

    pub fn constant(&mut self, constant: Constant) -> VirtualRegister {
        VirtualRegister::constant(self.constants.add(constant))
    }

    pub fn int(&mut self, n: i32) -> VirtualRegister {
        self.constant(Constant::Int32(n))
    }

    pub fn double(&mut self, d: f64) -> VirtualRegister {
        self.constant(Constant::Double(d))
    }

    pub fn string(&mut self, s: &str) -> VirtualRegister {
        self.constant(Constant::string(s))
    }

    pub fn boolean(&mut self, b: bool) -> VirtualRegister {
        self.constant(Constant::Boolean(b))
    }

    pub fn undefined(&mut self) -> VirtualRegister {
        self.constant(Constant::Undefined)
    }

    pub fn null(&mut self) -> VirtualRegister {
        self.constant(Constant::Null)
    }

    fn identifier(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.identifier_index.get(name) {
            return idx;
        }
        let idx = self.identifiers.len() as u32;
        self.identifiers.push(name.into());
        self.identifier_index.insert(name.into(), idx);
        idx
    }

    /// Nested function usable with [`Self::emit_new_function`]
    pub fn add_function(&mut self, decl: CodeBlock) -> u32 {
        self.function_decls.push(decl);
        (self.function_decls.len() - 1) as u32
    }

    // -- labels, lines, handlers --------------------------------------------

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            self.error.get_or_insert(BytecodeError::LabelRebound(label.0));
            return;
        }
        *slot = Some(self.instructions.len() as u32);
    }

    /// Instructions emitted from now on belong to `line`
    pub fn set_line(&mut self, line: u32) {
        let offset = self.current_offset();
        match self.lines.last_mut() {
            Some(last) if last.offset == offset => last.line = line,
            Some(last) if last.line == line => {}
            _ => self.lines.push(LineInfo { offset, line }),
        }
    }

    /// Exceptions thrown in `[start, end)` resume at `target`
    pub fn add_handler(&mut self, start: Label, end: Label, target: Label) {
        self.handlers.push((start, end, target));
    }

    // -- raw emission -------------------------------------------------------

    fn emit(&mut self, opcode: Opcode, operands: &[u32]) -> usize {
        debug_assert_eq!(operands.len() + 1, opcode.length(), "{opcode} operand count");
        let start = self.instructions.len();
        self.instructions.push(u32::from(opcode.id()));
        self.instructions.extend_from_slice(operands);
        start
    }

    fn emit_with_jump(&mut self, opcode: Opcode, leading: &[u32], label: Label) {
        let mut operands = leading.to_vec();
        operands.push(0);
        let start = self.emit(opcode, &operands);
        self.fixups.push((start, start + operands.len(), label));
    }

    fn arith_profile(&mut self) -> u32 {
        self.arith_profiles += 1;
        self.arith_profiles - 1
    }

    fn property_cache(&mut self, kind: PropertyCacheKind, ident: u32) -> u32 {
        self.property_caches.push(PropertyInlineCache::new(kind, ident));
        (self.property_caches.len() - 1) as u32
    }

    fn call_link(&mut self) -> u32 {
        self.call_links += 1;
        self.call_links - 1
    }

    // -- instructions -------------------------------------------------------

    pub fn emit_enter(&mut self) {
        self.emit(Opcode::Enter, &[]);
    }

    pub fn emit_nop(&mut self) {
        self.emit(Opcode::Nop, &[]);
    }

    pub fn emit_mov(&mut self, dst: VirtualRegister, src: VirtualRegister) {
        self.emit(Opcode::Mov, &[dst.to_slot(), src.to_slot()]);
    }

    /// `add`, `sub`, `mul`, `div` or `mod`
    pub fn emit_arith(
        &mut self,
        opcode: Opcode,
        dst: VirtualRegister,
        lhs: VirtualRegister,
        rhs: VirtualRegister,
    ) {
        debug_assert!(matches!(
            opcode,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
        ));
        let profile = self.arith_profile();
        self.emit(opcode, &[dst.to_slot(), lhs.to_slot(), rhs.to_slot(), profile]);
    }

    pub fn emit_add(&mut self, dst: VirtualRegister, lhs: VirtualRegister, rhs: VirtualRegister) {
        self.emit_arith(Opcode::Add, dst, lhs, rhs);
    }

    pub fn emit_sub(&mut self, dst: VirtualRegister, lhs: VirtualRegister, rhs: VirtualRegister) {
        self.emit_arith(Opcode::Sub, dst, lhs, rhs);
    }

    pub fn emit_mul(&mut self, dst: VirtualRegister, lhs: VirtualRegister, rhs: VirtualRegister) {
        self.emit_arith(Opcode::Mul, dst, lhs, rhs);
    }

    pub fn emit_div(&mut self, dst: VirtualRegister, lhs: VirtualRegister, rhs: VirtualRegister) {
        self.emit_arith(Opcode::Div, dst, lhs, rhs);
    }

    pub fn emit_mod(&mut self, dst: VirtualRegister, lhs: VirtualRegister, rhs: VirtualRegister) {
        self.emit_arith(Opcode::Mod, dst, lhs, rhs);
    }

    pub fn emit_negate(&mut self, dst: VirtualRegister, src: VirtualRegister) {
        let profile = self.arith_profile();
        self.emit(Opcode::Negate, &[dst.to_slot(), src.to_slot(), profile]);
    }

    pub fn emit_inc(&mut self, reg: VirtualRegister) {
        self.emit(Opcode::Inc, &[reg.to_slot()]);
    }

    pub fn emit_dec(&mut self, reg: VirtualRegister) {
        self.emit(Opcode::Dec, &[reg.to_slot()]);
    }

    /// Any `dst, lhs, rhs` opcode: bitwise, comparison, `get_by_val`
    pub fn emit_binary(
        &mut self,
        opcode: Opcode,
        dst: VirtualRegister,
        lhs: VirtualRegister,
        rhs: VirtualRegister,
    ) {
        debug_assert_eq!(
            opcode.info().operands,
            &[OperandKind::Dst, OperandKind::Src, OperandKind::Src]
        );
        self.emit(opcode, &[dst.to_slot(), lhs.to_slot(), rhs.to_slot()]);
    }

    /// Any `dst, src` opcode: `mov`, `not`, `bitnot`, `to_number`
    pub fn emit_unary(&mut self, opcode: Opcode, dst: VirtualRegister, src: VirtualRegister) {
        debug_assert_eq!(opcode.info().operands, &[OperandKind::Dst, OperandKind::Src]);
        self.emit(opcode, &[dst.to_slot(), src.to_slot()]);
    }

    pub fn emit_jmp(&mut self, target: Label) {
        self.emit_with_jump(Opcode::Jmp, &[], target);
    }

    pub fn emit_jtrue(&mut self, cond: VirtualRegister, target: Label) {
        self.emit_with_jump(Opcode::JTrue, &[cond.to_slot()], target);
    }

    pub fn emit_jfalse(&mut self, cond: VirtualRegister, target: Label) {
        self.emit_with_jump(Opcode::JFalse, &[cond.to_slot()], target);
    }

    /// `jless`, `jnless`, `jlesseq` or `jnlesseq`
    pub fn emit_compare_jump(
        &mut self,
        opcode: Opcode,
        lhs: VirtualRegister,
        rhs: VirtualRegister,
        target: Label,
    ) {
        debug_assert!(matches!(
            opcode,
            Opcode::JLess | Opcode::JNLess | Opcode::JLessEq | Opcode::JNLessEq
        ));
        self.emit_with_jump(opcode, &[lhs.to_slot(), rhs.to_slot()], target);
    }

    pub fn emit_loop_hint(&mut self) {
        self.emit(Opcode::LoopHint, &[]);
    }

    pub fn emit_new_object(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::NewObject, &[dst.to_slot()]);
    }

    /// `dst = base.name`; returns the property cache index
    pub fn emit_get_by_id(&mut self, dst: VirtualRegister, base: VirtualRegister, name: &str) -> u32 {
        let ident = self.identifier(name);
        let cache = self.property_cache(PropertyCacheKind::Get, ident);
        self.emit(Opcode::GetById, &[dst.to_slot(), base.to_slot(), ident, cache]);
        cache
    }

    /// `base.name = value`; returns the property cache index
    pub fn emit_put_by_id(&mut self, base: VirtualRegister, name: &str, value: VirtualRegister) -> u32 {
        let ident = self.identifier(name);
        let cache = self.property_cache(PropertyCacheKind::Put, ident);
        self.emit(Opcode::PutById, &[base.to_slot(), ident, value.to_slot(), cache]);
        cache
    }

    pub fn emit_get_by_val(&mut self, dst: VirtualRegister, base: VirtualRegister, key: VirtualRegister) {
        self.emit(Opcode::GetByVal, &[dst.to_slot(), base.to_slot(), key.to_slot()]);
    }

    pub fn emit_put_by_val(&mut self, base: VirtualRegister, key: VirtualRegister, value: VirtualRegister) {
        self.emit(Opcode::PutByVal, &[base.to_slot(), key.to_slot(), value.to_slot()]);
    }

    pub fn emit_new_function(&mut self, dst: VirtualRegister, decl: u32) {
        self.emit(Opcode::NewFunction, &[dst.to_slot(), decl]);
    }

    /// Reserve registers for a call passing `argc` values including `this`
    pub fn call_frame(&mut self, argc: u32) -> CallFrameLayout {
        debug_assert!(argc >= 1, "argc includes `this`");
        let base = self.next_local;
        let size = argc + header::SIZE as u32;
        self.next_local += size;
        self.max_locals = self.max_locals.max(self.next_local);
        CallFrameLayout {
            base,
            argc,
            register_offset: -((base + size) as i32),
        }
    }

    fn release_call_frame(&mut self, frame: &CallFrameLayout) {
        if frame.base + frame.size() == self.next_local {
            self.next_local = frame.base;
        } else {
            self.error.get_or_insert(BytecodeError::CallFrameOrder);
        }
    }

    /// `dst = callee.call(frame.this, frame.args...)`; returns the call link index
    pub fn emit_call(
        &mut self,
        dst: VirtualRegister,
        callee: VirtualRegister,
        frame: &CallFrameLayout,
    ) -> u32 {
        let link = self.call_link();
        self.emit(
            Opcode::Call,
            &[
                dst.to_slot(),
                callee.to_slot(),
                frame.argc,
                frame.register_offset as u32,
                link,
            ],
        );
        self.release_call_frame(frame);
        link
    }

    /// Call spreading an arguments object or array-like `arguments`
    pub fn emit_call_varargs(
        &mut self,
        dst: VirtualRegister,
        callee: VirtualRegister,
        this: VirtualRegister,
        arguments: VirtualRegister,
    ) -> u32 {
        let link = self.call_link();
        let first_free = self.next_local;
        self.emit(
            Opcode::CallVarargs,
            &[
                dst.to_slot(),
                callee.to_slot(),
                this.to_slot(),
                arguments.to_slot(),
                first_free,
                link,
            ],
        );
        link
    }

    pub fn emit_ret(&mut self, value: VirtualRegister) {
        self.emit(Opcode::Ret, &[value.to_slot()]);
    }

    pub fn emit_throw(&mut self, value: VirtualRegister) {
        self.emit(Opcode::Throw, &[value.to_slot()]);
    }

    pub fn emit_catch(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::Catch, &[dst.to_slot()]);
    }

    pub fn emit_create_arguments(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::CreateArguments, &[dst.to_slot()]);
    }

    pub fn emit_get_scope(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::GetScope, &[dst.to_slot()]);
    }

    /// New scope with `size` variables whose parent is the current scope.
    /// It becomes the frame's scope.
    pub fn emit_create_lexical_environment(&mut self, dst: VirtualRegister, size: u32) {
        self.emit(Opcode::CreateLexicalEnvironment, &[dst.to_slot(), size]);
    }

    pub fn emit_get_closure_var(&mut self, dst: VirtualRegister, scope: VirtualRegister, index: u32) {
        self.emit(Opcode::GetClosureVar, &[dst.to_slot(), scope.to_slot(), index]);
    }

    pub fn emit_put_closure_var(&mut self, scope: VirtualRegister, index: u32, value: VirtualRegister) {
        self.emit(Opcode::PutClosureVar, &[scope.to_slot(), index, value.to_slot()]);
    }

    pub fn emit_get_callee(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::GetCallee, &[dst.to_slot()]);
    }

    pub fn emit_argument_count(&mut self, dst: VirtualRegister) {
        self.emit(Opcode::ArgumentCount, &[dst.to_slot()]);
    }

    // -- finish -------------------------------------------------------------

    fn resolve(&self, label: Label) -> Result<u32> {
        self.labels[label.0 as usize].ok_or(BytecodeError::UnboundLabel(label.0))
    }

    pub fn build(mut self) -> Result<CodeBlock> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for &(start, slot, label) in &self.fixups {
            let target = self.resolve(label)?;
            self.instructions[slot] = (target as i64 - start as i64) as i32 as u32;
        }
        let handlers = self
            .handlers
            .iter()
            .map(|&(start, end, target)| {
                Ok(HandlerInfo {
                    start: self.resolve(start)?,
                    end: self.resolve(end)?,
                    target: self.resolve(target)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let code = CodeBlock {
            name: self.name,
            instructions: self.instructions.into_boxed_slice(),
            constants: self.constants.into_vec().into_boxed_slice(),
            identifiers: self.identifiers.into_boxed_slice(),
            function_decls: self.function_decls,
            handlers: handlers.into_boxed_slice(),
            lines: self.lines.into_boxed_slice(),
            num_parameters: self.num_parameters,
            num_locals: self.max_locals,
            arith_profiles: (0..self.arith_profiles)
                .map(|_| ArithProfile::default())
                .collect(),
            property_caches: self.property_caches.into_iter().map(RefCell::new).collect(),
            call_links: (0..self.call_links)
                .map(|_| RefCell::new(CallLinkInfo::default()))
                .collect(),
        };
        code.validate()?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_backward_jumps_resolve() {
        let mut b = CodeBlockBuilder::new("loop");
        let i = b.new_register();
        let zero = b.int(0);
        let ten = b.int(10);
        b.emit_mov(i, zero);
        let top = b.new_label();
        let done = b.new_label();
        b.bind(top);
        b.emit_loop_hint();
        b.emit_compare_jump(Opcode::JNLess, i, ten, done);
        b.emit_inc(i);
        b.emit_jmp(top);
        b.bind(done);
        b.emit_ret(i);
        let code = b.build().unwrap();

        let jumps: Vec<_> = code
            .iter()
            .filter(|inst| inst.opcode.is_jump())
            .map(|inst| {
                let last = inst.opcode.length() - 2;
                inst.jump_target(last)
            })
            .collect();
        assert_eq!(jumps, vec![12, 3]);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = CodeBlockBuilder::new("bad");
        let l = b.new_label();
        b.emit_jmp(l);
        assert_eq!(b.build().unwrap_err(), BytecodeError::UnboundLabel(0));
    }

    #[test]
    fn call_frame_sits_at_top_of_locals() {
        let mut b = CodeBlockBuilder::new("caller");
        let f = b.new_register();
        let r = b.new_register();
        let frame = b.call_frame(3);
        assert_eq!(frame.register_offset, -(2 + 6 + 3));
        assert_eq!(frame.this(), VirtualRegister::local(2 + 3 - 1));
        assert_eq!(frame.argument(2), VirtualRegister::local(2));
        let undef = b.undefined();
        b.emit_mov(frame.this(), undef);
        b.emit_call(r, f, &frame);
        b.emit_ret(r);
        let code = b.build().unwrap();
        assert_eq!(code.num_locals(), 11);
        assert!(code.disassemble().contains("call"));
    }

    #[test]
    fn handlers_and_lines() {
        let mut b = CodeBlockBuilder::new("try");
        let e = b.new_register();
        let start = b.new_label();
        let end = b.new_label();
        let handler = b.new_label();
        b.set_line(1);
        b.bind(start);
        let v = b.int(1);
        b.emit_throw(v);
        b.bind(end);
        b.set_line(2);
        b.bind(handler);
        b.emit_catch(e);
        b.emit_ret(e);
        b.add_handler(start, end, handler);
        let code = b.build().unwrap();
        assert_eq!(code.handler_for(0).map(|h| h.target), Some(2));
        assert!(code.handler_for(2).is_none());
        assert_eq!(code.line_for(0), Some(1));
        assert_eq!(code.line_for(3), Some(2));
    }

    #[test]
    fn validation_rejects_out_of_range_locals() {
        let mut b = CodeBlockBuilder::new("bad");
        let undef = b.undefined();
        b.emit_mov(VirtualRegister::local(5), undef);
        b.emit_ret(undef);
        assert!(matches!(
            b.build(),
            Err(BytecodeError::LocalOutOfRange { local: 5, .. })
        ));
    }
}
