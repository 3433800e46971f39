//! Bytecode to Cranelift IR translation.
//!
//! Registers stay in the register file: every instruction loads its operands
//! from `frame + offset * 8` and stores its result back. Operand registers
//! are never written before all guards of an instruction pass, so a slow path
//! can re-execute the instruction from memory with full semantics.
//!
//! # Guard pattern
//!
//! ```text
//!   [current block]
//!     │  tag / overflow / structure checks
//!     ├──────────────────┐
//!     ▼                  ▼
//!   [fast path]      [slow path, cold]  ← stub call with a SlowPathReason
//!     │                  │
//!     └────────┬─────────┘
//!              ▼
//!          [done]
//! ```

use std::marker::PhantomData;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{Block, InstBuilder, MemFlags, SigRef, Value, types};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::FunctionBuilder;
use heron_vm_bytecode::{
    ArithProfile, CodeBlock, Constant, Instruction, Opcode, OperandKind, VirtualRegister,
};
use heron_vm_value::ValueRepr;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::JitError;
use crate::context::{JitContext, cell, frame};
use crate::patch::{CallSite, PatchTable, PropertySite};
use crate::stubs::{SlowPathReason, StubKind, StubRefs, signature};
use crate::value_ops::ValueOps;

pub(crate) struct TranslateInput<'a> {
    pub code: &'a CodeBlock,
    pub code_block_id: u32,
    /// Linked constant words, parallel to the constant pool
    pub constants: &'a [u64],
    pub patch: &'a PatchTable,
    pub call_conv: CallConv,
}

pub(crate) fn translate<V: ValueOps>(
    builder: &mut FunctionBuilder<'_>,
    input: &TranslateInput<'_>,
    stubs: &StubRefs,
) -> Result<(), JitError> {
    Translator::<V>::new(builder, input, stubs)?.run()
}

#[derive(Clone, Copy)]
enum Relation {
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl Relation {
    fn signed(self) -> IntCC {
        match self {
            Self::Less => IntCC::SignedLessThan,
            Self::LessEq => IntCC::SignedLessThanOrEqual,
            Self::Greater => IntCC::SignedGreaterThan,
            Self::GreaterEq => IntCC::SignedGreaterThanOrEqual,
        }
    }

    fn unsigned(self) -> IntCC {
        match self {
            Self::Less => IntCC::UnsignedLessThan,
            Self::LessEq => IntCC::UnsignedLessThanOrEqual,
            Self::Greater => IntCC::UnsignedGreaterThan,
            Self::GreaterEq => IntCC::UnsignedGreaterThanOrEqual,
        }
    }

    fn float(self) -> FloatCC {
        match self {
            Self::Less => FloatCC::LessThan,
            Self::LessEq => FloatCC::LessThanOrEqual,
            Self::Greater => FloatCC::GreaterThan,
            Self::GreaterEq => FloatCC::GreaterThanOrEqual,
        }
    }
}

struct Signatures {
    property_get: SigRef,
    property_put: SigRef,
    call_stub: SigRef,
    entry: SigRef,
}

struct Translator<'a, 'f, V> {
    b: &'a mut FunctionBuilder<'f>,
    input: &'a TranslateInput<'a>,
    stubs: &'a StubRefs,
    sigs: Signatures,
    ctx: Value,
    frame: Value,
    blocks: FxHashMap<usize, Block>,
    exception_exit: Block,
    _ops: PhantomData<V>,
}

fn jump_operand(inst: &Instruction<'_>) -> Option<usize> {
    inst.opcode
        .info()
        .operands
        .iter()
        .position(|kind| *kind == OperandKind::Jump)
}

impl<'a, 'f, V: ValueOps> Translator<'a, 'f, V> {
    fn new(
        b: &'a mut FunctionBuilder<'f>,
        input: &'a TranslateInput<'a>,
        stubs: &'a StubRefs,
    ) -> Result<Self, JitError> {
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let ctx = b.block_params(entry)[0];
        let frame = b.block_params(entry)[1];

        let sigs = Signatures {
            property_get: b.import_signature(signature(input.call_conv, 5)),
            property_put: b.import_signature(signature(input.call_conv, 6)),
            call_stub: b.import_signature(signature(input.call_conv, 5)),
            entry: b.import_signature(signature(input.call_conv, 2)),
        };

        let code = input.code;
        let len = code.instructions().len();
        let mut leaders = FxHashSet::default();
        leaders.insert(0usize);
        for inst in code.iter() {
            if let Some(i) = jump_operand(&inst) {
                let target = inst.jump_target(i);
                if target < 0 || target as usize > len {
                    return Err(JitError::InvalidJumpTarget {
                        pc: inst.offset,
                        target,
                    });
                }
                leaders.insert(target as usize);
                leaders.insert(inst.next_offset());
            } else if inst.opcode.is_terminator() {
                leaders.insert(inst.next_offset());
            }
        }
        let mut blocks = FxHashMap::default();
        // A leader at `len` is the implicit `return undefined` at the end.
        for offset in leaders.into_iter().filter(|o| *o <= len) {
            blocks.insert(offset, b.create_block());
        }

        let exception_exit = b.create_block();
        b.set_cold_block(exception_exit);

        Ok(Self {
            b,
            input,
            stubs,
            sigs,
            ctx,
            frame,
            blocks,
            exception_exit,
            _ops: PhantomData,
        })
    }

    fn run(mut self) -> Result<(), JitError> {
        self.prologue();
        let mut terminated = true;
        for inst in self.input.code.iter() {
            if let Some(&block) = self.blocks.get(&inst.offset) {
                if !terminated {
                    self.b.ins().jump(block, &[]);
                }
                self.b.switch_to_block(block);
            }
            terminated = self.instruction(&inst)?;
        }
        let len = self.input.code.instructions().len();
        if let Some(&end) = self.blocks.get(&len) {
            if !terminated {
                self.b.ins().jump(end, &[]);
            }
            self.b.switch_to_block(end);
            terminated = false;
        }
        if !terminated {
            let undefined = V::undefined(self.b);
            self.leave(undefined);
        }

        self.b.switch_to_block(self.exception_exit);
        let sentinel = V::sentinel(self.b);
        self.leave(sentinel);

        self.b.seal_all_blocks();
        Ok(())
    }

    // -- frame and register access -----------------------------------------

    fn constant(&self, reg: VirtualRegister) -> Option<&'a Constant> {
        reg.to_constant()
            .map(|k| &self.input.code.constants()[k as usize])
    }

    fn load(&mut self, reg: VirtualRegister) -> Value {
        match reg.to_constant() {
            Some(k) => self
                .b
                .ins()
                .iconst(types::I64, self.input.constants[k as usize] as i64),
            None => self.b.ins().load(
                types::I64,
                MemFlags::trusted(),
                self.frame,
                frame::register(reg.offset()),
            ),
        }
    }

    fn store(&mut self, reg: VirtualRegister, value: Value) {
        debug_assert!(!reg.is_constant());
        self.b.ins().store(
            MemFlags::trusted(),
            value,
            self.frame,
            frame::register(reg.offset()),
        );
    }

    fn record_pc(&mut self, pc: usize) {
        let v = self.b.ins().iconst(types::I32, pc as i64);
        self.b
            .ins()
            .store(MemFlags::trusted(), v, self.frame, frame::BYTECODE_OFFSET);
    }

    fn ctx_field(&mut self, ty: types::Type, offset: i32) -> Value {
        self.b.ins().load(ty, MemFlags::trusted(), self.ctx, offset)
    }

    /// Address of the cell a cell word refers to
    fn cell_ptr(&mut self, word: Value) -> Value {
        let cells = self.ctx_field(types::I64, JitContext::CELLS_OFFSET);
        let idx = V::unbox_cell_index(self.b, word);
        let scaled = self.b.ins().ishl_imm(idx, 3);
        let slot = self.b.ins().iadd(cells, scaled);
        self.b.ins().load(types::I64, MemFlags::trusted(), slot, 0)
    }

    fn leave(&mut self, value: Value) {
        let depth = self.ctx_field(types::I32, JitContext::CALL_DEPTH_OFFSET);
        let depth = self.b.ins().iadd_imm(depth, -1);
        self.b.ins().store(
            MemFlags::trusted(),
            depth,
            self.ctx,
            JitContext::CALL_DEPTH_OFFSET,
        );
        self.b.ins().return_(&[value]);
    }

    fn prologue(&mut self) {
        let code = self.input.code;
        let tagged_id = u64::from(self.input.code_block_id) | frame::JIT_FRAME_FLAG;
        let id = self.b.ins().iconst(types::I64, tagged_id as i64);
        self.b
            .ins()
            .store(MemFlags::trusted(), id, self.frame, frame::CODE_BLOCK);

        let callee = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), self.frame, frame::CALLEE);
        let callee_cell = self.cell_ptr(callee);
        let scope = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), callee_cell, cell::SCOPE);
        self.b
            .ins()
            .store(MemFlags::trusted(), scope, self.frame, frame::SCOPE);

        let depth = self.ctx_field(types::I32, JitContext::CALL_DEPTH_OFFSET);
        let max = self.ctx_field(types::I32, JitContext::MAX_CALL_DEPTH_OFFSET);
        let too_deep = self
            .b
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, depth, max);
        let base = self.ctx_field(types::I64, JitContext::REGISTER_BASE_OFFSET);
        let lowest = self
            .b
            .ins()
            .iadd_imm(self.frame, -(i64::from(code.num_locals()) * 8));
        let no_room = self.b.ins().icmp(IntCC::UnsignedLessThan, lowest, base);
        let flag_ptr = self.ctx_field(types::I64, JitContext::TERMINATE_OFFSET);
        let flag = self
            .b
            .ins()
            .load(types::I8, MemFlags::trusted(), flag_ptr, 0);
        let terminated = self.b.ins().icmp_imm(IntCC::NotEqual, flag, 0);
        let fail = self.b.ins().bor(too_deep, no_room);
        let fail = self.b.ins().bor(fail, terminated);

        let fail_block = self.b.create_block();
        self.b.set_cold_block(fail_block);
        let body = self.b.create_block();
        self.b.ins().brif(fail, fail_block, &[], body, &[]);

        self.b.switch_to_block(fail_block);
        self.record_pc(0);
        let stub = self.stubs.get(StubKind::EntryCheckFailed);
        let inst = self.b.ins().call(stub, &[self.ctx, self.frame]);
        let result = self.b.inst_results(inst)[0];
        self.b.ins().return_(&[result]);

        self.b.switch_to_block(body);
        let depth = self.b.ins().iadd_imm(depth, 1);
        self.b.ins().store(
            MemFlags::trusted(),
            depth,
            self.ctx,
            JitContext::CALL_DEPTH_OFFSET,
        );
        let undefined = V::undefined(self.b);
        for i in 0..code.num_locals() {
            self.store(VirtualRegister::local(i), undefined);
        }
        let first = self.blocks[&0];
        self.b.ins().jump(first, &[]);
    }

    // -- guards and slow paths ---------------------------------------------

    /// `None` when the operand is a constant int32 and needs no check
    fn int_guard(&mut self, reg: VirtualRegister, v: Value) -> Option<Value> {
        match self.constant(reg) {
            Some(Constant::Int32(_)) => None,
            Some(_) => Some(self.b.ins().iconst(types::I8, 0)),
            None => Some(V::is_int32(self.b, v)),
        }
    }

    fn number_guard(&mut self, reg: VirtualRegister, v: Value) -> Option<Value> {
        match self.constant(reg) {
            Some(Constant::Int32(_) | Constant::Double(_)) => None,
            Some(_) => Some(self.b.ins().iconst(types::I8, 0)),
            None => Some(V::is_number(self.b, v)),
        }
    }

    fn both(&mut self, a: Option<Value>, b: Option<Value>) -> Option<Value> {
        match (a, b) {
            (Some(a), Some(b)) => Some(self.b.ins().band(a, b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    fn branch(
        &mut self,
        guard: Option<Value>,
        then: Block,
        then_args: &[BlockArg],
        otherwise: Block,
        otherwise_args: &[BlockArg],
    ) {
        match guard {
            None => {
                self.b.ins().jump(then, then_args);
            }
            Some(cond) => {
                self.b
                    .ins()
                    .brif(cond, then, then_args, otherwise, otherwise_args);
            }
        }
    }

    fn operand_f64(&mut self, reg: VirtualRegister, v: Value) -> Value {
        match self.constant(reg) {
            Some(Constant::Int32(n)) => self.b.ins().f64const(f64::from(*n)),
            Some(Constant::Double(d)) => self.b.ins().f64const(*d),
            _ => V::number_to_f64(self.b, v),
        }
    }

    /// Cold block taking the slow-path reason as its parameter
    fn slow_block(&mut self) -> Block {
        let block = self.b.create_block();
        self.b.append_block_param(block, types::I64);
        self.b.set_cold_block(block);
        block
    }

    fn reason(&mut self, reason: SlowPathReason) -> BlockArg {
        BlockArg::Value(self.b.ins().iconst(types::I64, reason as i64))
    }

    fn check_exception(&mut self, result: Value) {
        let thrown = V::is_sentinel(self.b, result);
        let cont = self.b.create_block();
        self.b
            .ins()
            .brif(thrown, self.exception_exit, &[], cont, &[]);
        self.b.switch_to_block(cont);
    }

    /// Re-execute the instruction at `pc` in the runtime
    fn slow_call(&mut self, pc: usize, reason: Value) -> Value {
        self.record_pc(pc);
        let pcv = self.b.ins().iconst(types::I64, pc as i64);
        let stub = self.stubs.get(StubKind::SlowPath);
        let inst = self
            .b
            .ins()
            .call(stub, &[self.ctx, self.frame, pcv, reason]);
        let status = self.b.inst_results(inst)[0];
        self.check_exception(status);
        status
    }

    /// Fill `slow` with a re-execution and continue at `done`
    fn finish_slow(&mut self, slow: Block, pc: usize, done: Block) {
        self.b.switch_to_block(slow);
        let reason = self.b.block_params(slow)[0];
        self.slow_call(pc, reason);
        self.b.ins().jump(done, &[]);
    }

    /// Fill `slow` for a conditional jump: the stub reports whether it is taken
    fn finish_slow_branch(&mut self, slow: Block, pc: usize, taken: Block, fallthrough: Block) {
        self.b.switch_to_block(slow);
        let reason = self.b.block_params(slow)[0];
        let status = self.slow_call(pc, reason);
        let is_taken = self.b.ins().icmp_imm(IntCC::NotEqual, status, 0);
        self.b
            .ins()
            .brif(is_taken, taken, &[], fallthrough, &[]);
    }

    fn not_inlined(&mut self, pc: usize) {
        let reason = self
            .b
            .ins()
            .iconst(types::I64, SlowPathReason::NotInlined as i64);
        self.slow_call(pc, reason);
    }

    fn jump_blocks(&self, inst: &Instruction<'_>) -> (Block, Block) {
        let target = jump_operand(inst)
            .map(|i| inst.jump_target(i) as usize)
            .unwrap_or(inst.offset);
        (self.blocks[&target], self.blocks[&inst.next_offset()])
    }

    // -- instructions -------------------------------------------------------

    /// Translate one instruction. Returns `true` when control never falls
    /// through to the next one.
    fn instruction(&mut self, inst: &Instruction<'_>) -> Result<bool, JitError> {
        let pc = inst.offset;
        match inst.opcode {
            Opcode::Enter | Opcode::Nop => {}
            Opcode::Mov => {
                let v = self.load(inst.reg(1));
                self.store(inst.reg(0), v);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul => self.arith(inst),
            Opcode::Div => self.div(inst),
            Opcode::Mod => self.modulo(inst),
            Opcode::Negate => self.negate(inst),
            Opcode::Inc => self.increment(inst, 1),
            Opcode::Dec => self.increment(inst, -1),
            Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::LShift
            | Opcode::RShift
            | Opcode::URShift => self.bitwise(inst),
            Opcode::BitNot => self.bitnot(inst),
            Opcode::Less => self.relational(inst, Relation::Less),
            Opcode::LessEq => self.relational(inst, Relation::LessEq),
            Opcode::Greater => self.relational(inst, Relation::Greater),
            Opcode::GreaterEq => self.relational(inst, Relation::GreaterEq),
            Opcode::Eq | Opcode::NotEq | Opcode::StrictEq | Opcode::NotStrictEq => {
                self.equality(inst)
            }
            Opcode::Not => self.not(inst),
            Opcode::ToNumber => self.to_number(inst),
            Opcode::Jmp => {
                let (target, _) = self.jump_blocks(inst);
                self.b.ins().jump(target, &[]);
                return Ok(true);
            }
            Opcode::JTrue => {
                self.truthy_jump(inst, false);
                return Ok(true);
            }
            Opcode::JFalse => {
                self.truthy_jump(inst, true);
                return Ok(true);
            }
            Opcode::JLess => {
                self.compare_jump(inst, Relation::Less, false);
                return Ok(true);
            }
            Opcode::JNLess => {
                self.compare_jump(inst, Relation::Less, true);
                return Ok(true);
            }
            Opcode::JLessEq => {
                self.compare_jump(inst, Relation::LessEq, false);
                return Ok(true);
            }
            Opcode::JNLessEq => {
                self.compare_jump(inst, Relation::LessEq, true);
                return Ok(true);
            }
            Opcode::LoopHint => self.loop_hint(pc),
            Opcode::GetById => self.get_by_id(inst),
            Opcode::PutById => self.put_by_id(inst),
            Opcode::Call => self.call(inst),
            Opcode::Ret => {
                let v = self.load(inst.reg(0));
                self.leave(v);
                return Ok(true);
            }
            Opcode::Throw => {
                self.not_inlined(pc);
                self.b.ins().jump(self.exception_exit, &[]);
                return Ok(true);
            }
            Opcode::GetScope => {
                let scope = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), self.frame, frame::SCOPE);
                self.store(inst.reg(0), scope);
            }
            Opcode::GetCallee => {
                let callee = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), self.frame, frame::CALLEE);
                self.store(inst.reg(0), callee);
            }
            Opcode::ArgumentCount => {
                let argc = self.b.ins().load(
                    types::I32,
                    MemFlags::trusted(),
                    self.frame,
                    frame::ARGUMENT_COUNT,
                );
                let without_this = self.b.ins().iadd_imm(argc, -1);
                let boxed = V::box_int32(self.b, without_this);
                self.store(inst.reg(0), boxed);
            }
            Opcode::NewObject
            | Opcode::GetByVal
            | Opcode::PutByVal
            | Opcode::NewFunction
            | Opcode::CallVarargs
            | Opcode::Catch
            | Opcode::CreateArguments
            | Opcode::CreateLexicalEnvironment
            | Opcode::GetClosureVar
            | Opcode::PutClosureVar => self.not_inlined(pc),
        }
        Ok(false)
    }

    fn arith(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, lr, rr) = (inst.reg(0), inst.reg(1), inst.reg(2));
        let l = self.load(lr);
        let r = self.load(rr);

        let int_block = self.b.create_block();
        let box_block = self.b.create_block();
        let num_check = self.b.create_block();
        let double_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let lg = self.int_guard(lr, l);
        let rg = self.int_guard(rr, r);
        let guard = self.both(lg, rg);
        self.branch(guard, int_block, &[], num_check, &[]);

        self.b.switch_to_block(int_block);
        let li = V::unbox_int32(self.b, l);
        let ri = V::unbox_int32(self.b, r);
        let l64 = self.b.ins().sextend(types::I64, li);
        let r64 = self.b.ins().sextend(types::I64, ri);
        let wide = match inst.opcode {
            Opcode::Add => self.b.ins().iadd(l64, r64),
            Opcode::Sub => self.b.ins().isub(l64, r64),
            _ => self.b.ins().imul(l64, r64),
        };
        let narrow = self.b.ins().ireduce(types::I32, wide);
        let back = self.b.ins().sextend(types::I64, narrow);
        let fits = self.b.ins().icmp(IntCC::Equal, wide, back);
        let overflow = self.reason(SlowPathReason::ArithmeticOverflow);
        if inst.opcode == Opcode::Mul {
            let zero_check = self.b.create_block();
            self.b
                .ins()
                .brif(fits, zero_check, &[], slow, &[overflow]);
            self.b.switch_to_block(zero_check);
            let is_zero = self.b.ins().icmp_imm(IntCC::Equal, narrow, 0);
            let signs = self.b.ins().bor(li, ri);
            let negative = self.b.ins().icmp_imm(IntCC::SignedLessThan, signs, 0);
            let negative_zero = self.b.ins().band(is_zero, negative);
            let reason = self.reason(SlowPathReason::NegativeZero);
            self.b
                .ins()
                .brif(negative_zero, slow, &[reason], box_block, &[]);
        } else {
            self.b
                .ins()
                .brif(fits, box_block, &[], slow, &[overflow]);
        }

        self.b.switch_to_block(box_block);
        let boxed = V::box_int32(self.b, narrow);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(num_check);
        let lg = self.number_guard(lr, l);
        let rg = self.number_guard(rr, r);
        let guard = self.both(lg, rg);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, double_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(double_block);
        let lf = self.operand_f64(lr, l);
        let rf = self.operand_f64(rr, r);
        let result = match inst.opcode {
            Opcode::Add => self.b.ins().fadd(lf, rf),
            Opcode::Sub => self.b.ins().fsub(lf, rf),
            _ => self.b.ins().fmul(lf, rf),
        };
        let boxed = V::box_double(self.b, result);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn div(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, lr, rr) = (inst.reg(0), inst.reg(1), inst.reg(2));
        let profile = self.input.code.arith_profile(inst.operand(3)).as_ptr() as i64;
        let l = self.load(lr);
        let r = self.load(rr);

        let int_block = self.b.create_block();
        let exact_block = self.b.create_block();
        let quotient_block = self.b.create_block();
        let num_check = self.b.create_block();
        let double_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let lg = self.int_guard(lr, l);
        let rg = self.int_guard(rr, r);
        let guard = self.both(lg, rg);
        self.branch(guard, int_block, &[], num_check, &[]);

        // Int32 only for a non-zero divisor, not MIN / -1, not 0 / negative
        // and an exact quotient.
        self.b.switch_to_block(int_block);
        let li = V::unbox_int32(self.b, l);
        let ri = V::unbox_int32(self.b, r);
        let nonzero = self.b.ins().icmp_imm(IntCC::NotEqual, ri, 0);
        let l_min = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, li, i64::from(i32::MIN));
        let r_neg_one = self.b.ins().icmp_imm(IntCC::Equal, ri, -1);
        let min_by_neg_one = self.b.ins().band(l_min, r_neg_one);
        let l_zero = self.b.ins().icmp_imm(IntCC::Equal, li, 0);
        let r_negative = self.b.ins().icmp_imm(IntCC::SignedLessThan, ri, 0);
        let negative_zero = self.b.ins().band(l_zero, r_negative);
        let bad = self.b.ins().bor(min_by_neg_one, negative_zero);
        let good = self.b.ins().bxor_imm(bad, 1);
        let ok = self.b.ins().band(nonzero, good);
        self.b
            .ins()
            .brif(ok, exact_block, &[], double_block, &[]);

        self.b.switch_to_block(exact_block);
        let rem = self.b.ins().srem(li, ri);
        let exact = self.b.ins().icmp_imm(IntCC::Equal, rem, 0);
        self.b
            .ins()
            .brif(exact, quotient_block, &[], double_block, &[]);

        self.b.switch_to_block(quotient_block);
        let quotient = self.b.ins().sdiv(li, ri);
        let boxed = V::box_int32(self.b, quotient);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(num_check);
        let lg = self.number_guard(lr, l);
        let rg = self.number_guard(rr, r);
        let guard = self.both(lg, rg);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, double_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(double_block);
        let lf = self.operand_f64(lr, l);
        let rf = self.operand_f64(rr, r);
        let result = self.b.ins().fdiv(lf, rf);
        let truncated = self.b.ins().trunc(result);
        let non_integral = self.b.ins().fcmp(FloatCC::NotEqual, truncated, result);
        let flag = self
            .b
            .ins()
            .iconst(types::I8, i64::from(ArithProfile::NON_INTEGRAL));
        let none = self.b.ins().iconst(types::I8, 0);
        let bits = self.b.ins().select(non_integral, flag, none);
        let profile_addr = self.b.ins().iconst(types::I64, profile);
        let old = self
            .b
            .ins()
            .load(types::I8, MemFlags::trusted(), profile_addr, 0);
        let new = self.b.ins().bor(old, bits);
        self.b
            .ins()
            .store(MemFlags::trusted(), new, profile_addr, 0);
        let boxed = V::box_double(self.b, result);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn modulo(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, lr, rr) = (inst.reg(0), inst.reg(1), inst.reg(2));
        let l = self.load(lr);
        let r = self.load(rr);

        let int_block = self.b.create_block();
        let rem_block = self.b.create_block();
        let box_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let lg = self.int_guard(lr, l);
        let rg = self.int_guard(rr, r);
        let guard = self.both(lg, rg);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, int_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(int_block);
        let li = V::unbox_int32(self.b, l);
        let ri = V::unbox_int32(self.b, r);
        let nonzero = self.b.ins().icmp_imm(IntCC::NotEqual, ri, 0);
        let l_min = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, li, i64::from(i32::MIN));
        let r_neg_one = self.b.ins().icmp_imm(IntCC::Equal, ri, -1);
        let min_by_neg_one = self.b.ins().band(l_min, r_neg_one);
        let fine = self.b.ins().bxor_imm(min_by_neg_one, 1);
        let ok = self.b.ins().band(nonzero, fine);
        let overflow = self.reason(SlowPathReason::ArithmeticOverflow);
        self.b
            .ins()
            .brif(ok, rem_block, &[], slow, &[overflow]);

        self.b.switch_to_block(rem_block);
        let rem = self.b.ins().srem(li, ri);
        let is_zero = self.b.ins().icmp_imm(IntCC::Equal, rem, 0);
        let l_negative = self.b.ins().icmp_imm(IntCC::SignedLessThan, li, 0);
        let negative_zero = self.b.ins().band(is_zero, l_negative);
        let reason = self.reason(SlowPathReason::NegativeZero);
        self.b
            .ins()
            .brif(negative_zero, slow, &[reason], box_block, &[]);

        self.b.switch_to_block(box_block);
        let boxed = V::box_int32(self.b, rem);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn negate(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, src) = (inst.reg(0), inst.reg(1));
        let v = self.load(src);

        let int_block = self.b.create_block();
        let neg_block = self.b.create_block();
        let num_check = self.b.create_block();
        let double_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let guard = self.int_guard(src, v);
        self.branch(guard, int_block, &[], num_check, &[]);

        // -0 and -MIN are doubles
        self.b.switch_to_block(int_block);
        let n = V::unbox_int32(self.b, v);
        let is_zero = self.b.ins().icmp_imm(IntCC::Equal, n, 0);
        let is_min = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, n, i64::from(i32::MIN));
        let special = self.b.ins().bor(is_zero, is_min);
        self.b
            .ins()
            .brif(special, double_block, &[], neg_block, &[]);

        self.b.switch_to_block(neg_block);
        let negated = self.b.ins().ineg(n);
        let boxed = V::box_int32(self.b, negated);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(num_check);
        let guard = self.number_guard(src, v);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, double_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(double_block);
        let f = self.operand_f64(src, v);
        let negated = self.b.ins().fneg(f);
        let boxed = V::box_double(self.b, negated);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn increment(&mut self, inst: &Instruction<'_>, delta: i64) {
        let pc = inst.offset;
        let reg = inst.reg(0);
        let v = self.load(reg);

        let int_block = self.b.create_block();
        let box_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let guard = V::is_int32(self.b, v);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.b
            .ins()
            .brif(guard, int_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(int_block);
        let n = V::unbox_int32(self.b, v);
        let wide = self.b.ins().sextend(types::I64, n);
        let wide = self.b.ins().iadd_imm(wide, delta);
        let narrow = self.b.ins().ireduce(types::I32, wide);
        let back = self.b.ins().sextend(types::I64, narrow);
        let fits = self.b.ins().icmp(IntCC::Equal, wide, back);
        let overflow = self.reason(SlowPathReason::ArithmeticOverflow);
        self.b
            .ins()
            .brif(fits, box_block, &[], slow, &[overflow]);

        self.b.switch_to_block(box_block);
        let boxed = V::box_int32(self.b, narrow);
        self.store(reg, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn bitwise(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, lr, rr) = (inst.reg(0), inst.reg(1), inst.reg(2));
        let l = self.load(lr);
        let r = self.load(rr);

        let int_block = self.b.create_block();
        let box_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let lg = self.int_guard(lr, l);
        let rg = self.int_guard(rr, r);
        let guard = self.both(lg, rg);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, int_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(int_block);
        let li = V::unbox_int32(self.b, l);
        let ri = V::unbox_int32(self.b, r);
        // Shift amounts are taken modulo 32 by the instructions themselves.
        let result = match inst.opcode {
            Opcode::BitAnd => self.b.ins().band(li, ri),
            Opcode::BitOr => self.b.ins().bor(li, ri),
            Opcode::BitXor => self.b.ins().bxor(li, ri),
            Opcode::LShift => self.b.ins().ishl(li, ri),
            Opcode::RShift => self.b.ins().sshr(li, ri),
            _ => self.b.ins().ushr(li, ri),
        };
        if inst.opcode == Opcode::URShift {
            // Results above i32::MAX are doubles
            let too_big = self.b.ins().icmp_imm(IntCC::SignedLessThan, result, 0);
            let reason = self.reason(SlowPathReason::ArithmeticOverflow);
            self.b
                .ins()
                .brif(too_big, slow, &[reason], box_block, &[]);
        } else {
            self.b.ins().jump(box_block, &[]);
        }

        self.b.switch_to_block(box_block);
        let boxed = V::box_int32(self.b, result);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn bitnot(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, src) = (inst.reg(0), inst.reg(1));
        let v = self.load(src);

        let int_block = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let guard = self.int_guard(src, v);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, int_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(int_block);
        let n = V::unbox_int32(self.b, v);
        let inverted = self.b.ins().bnot(n);
        let boxed = V::box_int32(self.b, inverted);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    /// Inline comparison of `lr` and `rr`. Switches to a block where the
    /// returned `i8` condition is available; guard failures go to `slow`.
    fn compare(
        &mut self,
        relation: Relation,
        lr: VirtualRegister,
        rr: VirtualRegister,
        slow: Block,
    ) -> Value {
        let l = self.load(lr);
        let r = self.load(rr);
        let merge = self.b.create_block();
        self.b.append_block_param(merge, types::I8);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);

        let char_operand = match (self.constant(lr), self.constant(rr)) {
            (None, Some(c)) => c.single_char().map(|ch| (l, ch, true)),
            (Some(c), None) => c.single_char().map(|ch| (r, ch, false)),
            _ => None,
        };

        if let Some((v, ch, constant_on_right)) = char_operand {
            // One-character string against a one-character constant:
            // compare code points.
            let cell_block = self.b.create_block();
            let char_block = self.b.create_block();
            let is_cell = V::is_cell(self.b, v);
            self.b
                .ins()
                .brif(is_cell, cell_block, &[], slow, &[mismatch]);

            self.b.switch_to_block(cell_block);
            let ptr = self.cell_ptr(v);
            let code = self
                .b
                .ins()
                .load(types::I32, MemFlags::trusted(), ptr, cell::CHAR_CODE);
            let is_char = self.b.ins().icmp_imm(
                IntCC::NotEqual,
                code,
                i64::from(cell::NO_CHAR_CODE),
            );
            let mismatch = self.reason(SlowPathReason::TypeMismatch);
            self.b
                .ins()
                .brif(is_char, char_block, &[], slow, &[mismatch]);

            self.b.switch_to_block(char_block);
            let constant = self.b.ins().iconst(types::I32, i64::from(u32::from(ch)));
            let cond = if constant_on_right {
                self.b.ins().icmp(relation.unsigned(), code, constant)
            } else {
                self.b.ins().icmp(relation.unsigned(), constant, code)
            };
            self.b.ins().jump(merge, &[BlockArg::Value(cond)]);
        } else {
            let int_block = self.b.create_block();
            let num_check = self.b.create_block();
            let double_block = self.b.create_block();

            let lg = self.int_guard(lr, l);
            let rg = self.int_guard(rr, r);
            let guard = self.both(lg, rg);
            self.branch(guard, int_block, &[], num_check, &[]);

            self.b.switch_to_block(int_block);
            let li = V::unbox_int32(self.b, l);
            let ri = V::unbox_int32(self.b, r);
            let cond = self.b.ins().icmp(relation.signed(), li, ri);
            self.b.ins().jump(merge, &[BlockArg::Value(cond)]);

            self.b.switch_to_block(num_check);
            let lg = self.number_guard(lr, l);
            let rg = self.number_guard(rr, r);
            let guard = self.both(lg, rg);
            let mismatch = self.reason(SlowPathReason::TypeMismatch);
            self.branch(guard, double_block, &[], slow, &[mismatch]);

            self.b.switch_to_block(double_block);
            let lf = self.operand_f64(lr, l);
            let rf = self.operand_f64(rr, r);
            let cond = self.b.ins().fcmp(relation.float(), lf, rf);
            self.b.ins().jump(merge, &[BlockArg::Value(cond)]);
        }

        self.b.switch_to_block(merge);
        self.b.block_params(merge)[0]
    }

    fn relational(&mut self, inst: &Instruction<'_>, relation: Relation) {
        let pc = inst.offset;
        let slow = self.slow_block();
        let done = self.b.create_block();
        let cond = self.compare(relation, inst.reg(1), inst.reg(2), slow);
        let boxed = V::box_bool(self.b, cond);
        self.store(inst.reg(0), boxed);
        self.b.ins().jump(done, &[]);
        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn compare_jump(&mut self, inst: &Instruction<'_>, relation: Relation, negated: bool) {
        let pc = inst.offset;
        let (taken, fallthrough) = self.jump_blocks(inst);
        let slow = self.slow_block();
        let cond = self.compare(relation, inst.reg(0), inst.reg(1), slow);
        let cond = if negated {
            self.b.ins().bxor_imm(cond, 1)
        } else {
            cond
        };
        self.b
            .ins()
            .brif(cond, taken, &[], fallthrough, &[]);
        self.finish_slow_branch(slow, pc, taken, fallthrough);
    }

    fn equality(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, lr, rr) = (inst.reg(0), inst.reg(1), inst.reg(2));
        let strict = matches!(inst.opcode, Opcode::StrictEq | Opcode::NotStrictEq);
        let negated = matches!(inst.opcode, Opcode::NotEq | Opcode::NotStrictEq);
        let l = self.load(lr);
        let r = self.load(rr);

        let int_block = self.b.create_block();
        let other = self.b.create_block();
        let merge = self.b.create_block();
        self.b.append_block_param(merge, types::I8);
        let slow = self.slow_block();
        let done = self.b.create_block();

        let lg = self.int_guard(lr, l);
        let rg = self.int_guard(rr, r);
        let guard = self.both(lg, rg);
        self.branch(guard, int_block, &[], other, &[]);

        self.b.switch_to_block(int_block);
        let li = V::unbox_int32(self.b, l);
        let ri = V::unbox_int32(self.b, r);
        let cond = self.b.ins().icmp(IntCC::Equal, li, ri);
        self.b.ins().jump(merge, &[BlockArg::Value(cond)]);

        self.b.switch_to_block(other);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        if strict {
            // A boolean, null or undefined operand has exactly one encoding,
            // so word equality decides.
            let words = self.b.create_block();
            let l_simple = self.simple(l);
            let r_simple = self.simple(r);
            let either = self.b.ins().bor(l_simple, r_simple);
            self.b
                .ins()
                .brif(either, words, &[], slow, &[mismatch]);
            self.b.switch_to_block(words);
            let cond = self.b.ins().icmp(IntCC::Equal, l, r);
            self.b.ins().jump(merge, &[BlockArg::Value(cond)]);
        } else {
            self.b.ins().jump(slow, &[mismatch]);
        }

        self.b.switch_to_block(merge);
        let cond = self.b.block_params(merge)[0];
        let cond = if negated {
            self.b.ins().bxor_imm(cond, 1)
        } else {
            cond
        };
        let boxed = V::box_bool(self.b, cond);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    /// Neither a number nor a cell
    fn simple(&mut self, v: Value) -> Value {
        let number = V::is_number(self.b, v);
        let cell = V::is_cell(self.b, v);
        let either = self.b.ins().bor(number, cell);
        self.b.ins().bxor_imm(either, 1)
    }

    fn not(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, src) = (inst.reg(0), inst.reg(1));
        let v = self.load(src);

        let fast = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let is_true = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, v, V::Repr::TRUE as i64);
        let is_false = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, v, V::Repr::FALSE as i64);
        let is_bool = self.b.ins().bor(is_true, is_false);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.b
            .ins()
            .brif(is_bool, fast, &[], slow, &[mismatch]);

        self.b.switch_to_block(fast);
        let boxed = V::box_bool(self.b, is_false);
        self.store(dst, boxed);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    fn to_number(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, src) = (inst.reg(0), inst.reg(1));
        let v = self.load(src);

        let fast = self.b.create_block();
        let slow = self.slow_block();
        let done = self.b.create_block();

        let guard = self.number_guard(src, v);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.branch(guard, fast, &[], slow, &[mismatch]);

        self.b.switch_to_block(fast);
        self.store(dst, v);
        self.b.ins().jump(done, &[]);

        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    /// `jtrue` / `jfalse`: booleans and int32 decide inline
    fn truthy_jump(&mut self, inst: &Instruction<'_>, jump_if_false: bool) {
        let pc = inst.offset;
        let (taken, fallthrough) = self.jump_blocks(inst);
        let v = self.load(inst.reg(0));

        let bool_block = self.b.create_block();
        let int_check = self.b.create_block();
        let int_block = self.b.create_block();
        let merge = self.b.create_block();
        self.b.append_block_param(merge, types::I8);
        let slow = self.slow_block();

        let is_true = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, v, V::Repr::TRUE as i64);
        let is_false = self
            .b
            .ins()
            .icmp_imm(IntCC::Equal, v, V::Repr::FALSE as i64);
        let is_bool = self.b.ins().bor(is_true, is_false);
        self.b
            .ins()
            .brif(is_bool, bool_block, &[], int_check, &[]);

        self.b.switch_to_block(bool_block);
        self.b.ins().jump(merge, &[BlockArg::Value(is_true)]);

        self.b.switch_to_block(int_check);
        let is_int = V::is_int32(self.b, v);
        let mismatch = self.reason(SlowPathReason::TypeMismatch);
        self.b
            .ins()
            .brif(is_int, int_block, &[], slow, &[mismatch]);

        self.b.switch_to_block(int_block);
        let n = V::unbox_int32(self.b, v);
        let nonzero = self.b.ins().icmp_imm(IntCC::NotEqual, n, 0);
        self.b.ins().jump(merge, &[BlockArg::Value(nonzero)]);

        self.b.switch_to_block(merge);
        let truthy = self.b.block_params(merge)[0];
        let cond = if jump_if_false {
            self.b.ins().bxor_imm(truthy, 1)
        } else {
            truthy
        };
        self.b
            .ins()
            .brif(cond, taken, &[], fallthrough, &[]);

        self.finish_slow_branch(slow, pc, taken, fallthrough);
    }

    fn loop_hint(&mut self, pc: usize) {
        let slow = self.slow_block();
        let done = self.b.create_block();
        let flag_ptr = self.ctx_field(types::I64, JitContext::TERMINATE_OFFSET);
        let flag = self
            .b
            .ins()
            .load(types::I8, MemFlags::trusted(), flag_ptr, 0);
        let reason = self.reason(SlowPathReason::Termination);
        self.b.ins().brif(flag, slow, &[reason], done, &[]);
        self.finish_slow(slow, pc, done);
        self.b.switch_to_block(done);
    }

    // -- inline caches ------------------------------------------------------

    fn get_by_id(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, base_reg) = (inst.reg(0), inst.reg(1));
        let site = self.input.patch.property_site(inst.operand(3)).address() as i64;
        let base = self.load(base_reg);

        let check = self.b.create_block();
        let hit = self.b.create_block();
        let miss = self.b.create_block();
        self.b.set_cold_block(miss);
        let done = self.b.create_block();

        let is_cell = V::is_cell(self.b, base);
        self.b.ins().brif(is_cell, check, &[], miss, &[]);

        self.b.switch_to_block(check);
        let site_addr = self.b.ins().iconst(types::I64, site);
        let ptr = self.cell_ptr(base);
        let structure = self
            .b
            .ins()
            .load(types::I32, MemFlags::trusted(), ptr, cell::STRUCTURE);
        let expected = self.b.ins().load(
            types::I32,
            MemFlags::trusted(),
            site_addr,
            PropertySite::STRUCTURE_OFFSET,
        );
        let matches = self.b.ins().icmp(IntCC::Equal, structure, expected);
        self.b.ins().brif(matches, hit, &[], miss, &[]);

        self.b.switch_to_block(hit);
        let storage = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), ptr, cell::STORAGE);
        let slot = self.slot_address(site_addr, storage);
        let value = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), slot, 0);
        self.store(dst, value);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(miss);
        self.record_pc(pc);
        let site_addr = self.b.ins().iconst(types::I64, site);
        let pcv = self.b.ins().iconst(types::I64, pc as i64);
        let stub = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            PropertySite::STUB_OFFSET,
        );
        let call = self.b.ins().call_indirect(
            self.sigs.property_get,
            stub,
            &[self.ctx, self.frame, pcv, site_addr, base],
        );
        let value = self.b.inst_results(call)[0];
        self.check_exception(value);
        self.store(dst, value);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(done);
    }

    fn put_by_id(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (base_reg, value_reg) = (inst.reg(0), inst.reg(2));
        let site = self.input.patch.property_site(inst.operand(3)).address() as i64;
        let base = self.load(base_reg);
        let value = self.load(value_reg);

        let check = self.b.create_block();
        let hit = self.b.create_block();
        let miss = self.b.create_block();
        self.b.set_cold_block(miss);
        let done = self.b.create_block();

        // Cell stores need the write barrier and always go through a stub.
        let base_is_cell = V::is_cell(self.b, base);
        let value_is_cell = V::is_cell(self.b, value);
        let value_plain = self.b.ins().bxor_imm(value_is_cell, 1);
        let inline_ok = self.b.ins().band(base_is_cell, value_plain);
        self.b.ins().brif(inline_ok, check, &[], miss, &[]);

        self.b.switch_to_block(check);
        let site_addr = self.b.ins().iconst(types::I64, site);
        let ptr = self.cell_ptr(base);
        let structure = self
            .b
            .ins()
            .load(types::I32, MemFlags::trusted(), ptr, cell::STRUCTURE);
        let expected = self.b.ins().load(
            types::I32,
            MemFlags::trusted(),
            site_addr,
            PropertySite::STRUCTURE_OFFSET,
        );
        let matches = self.b.ins().icmp(IntCC::Equal, structure, expected);
        self.b.ins().brif(matches, hit, &[], miss, &[]);

        self.b.switch_to_block(hit);
        let storage = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), ptr, cell::STORAGE);
        let slot = self.slot_address(site_addr, storage);
        self.b
            .ins()
            .store(MemFlags::trusted(), value, slot, 0);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(miss);
        self.record_pc(pc);
        let site_addr = self.b.ins().iconst(types::I64, site);
        let pcv = self.b.ins().iconst(types::I64, pc as i64);
        let stub = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            PropertySite::STUB_OFFSET,
        );
        let call = self.b.ins().call_indirect(
            self.sigs.property_put,
            stub,
            &[self.ctx, self.frame, pcv, site_addr, base, value],
        );
        let status = self.b.inst_results(call)[0];
        self.check_exception(status);
        self.b.ins().jump(done, &[]);

        self.b.switch_to_block(done);
    }

    /// `storage + site.offset * 8`
    fn slot_address(&mut self, site_addr: Value, storage: Value) -> Value {
        let offset = self.b.ins().load(
            types::I32,
            MemFlags::trusted(),
            site_addr,
            PropertySite::SLOT_OFFSET,
        );
        let offset = self.b.ins().uextend(types::I64, offset);
        let scaled = self.b.ins().ishl_imm(offset, 3);
        self.b.ins().iadd(storage, scaled)
    }

    fn call(&mut self, inst: &Instruction<'_>) {
        let pc = inst.offset;
        let (dst, callee_reg) = (inst.reg(0), inst.reg(1));
        let argc = inst.operand(2);
        let register_offset = inst.operand(3) as i32;
        let site = self.input.patch.call_site(inst.operand(4)).address() as i64;

        let callee = self.load(callee_reg);
        let callee_frame = self
            .b
            .ins()
            .iadd_imm(self.frame, i64::from(register_offset) * 8);

        // Header of the callee frame
        self.b
            .ins()
            .store(MemFlags::trusted(), callee, callee_frame, frame::CALLEE);
        let argc = self.b.ins().iconst(types::I64, i64::from(argc));
        self.b
            .ins()
            .store(MemFlags::trusted(), argc, callee_frame, frame::ARGUMENT_COUNT);
        let base = self.ctx_field(types::I64, JitContext::REGISTER_BASE_OFFSET);
        let distance = self.b.ins().isub(self.frame, base);
        let index = self.b.ins().ushr_imm(distance, 3);
        let caller = self.b.ins().iadd_imm(index, 1);
        self.b
            .ins()
            .store(MemFlags::trusted(), caller, callee_frame, frame::CALLER_FRAME);
        let return_location = self.b.ins().iconst(types::I64, pc as i64);
        self.b.ins().store(
            MemFlags::trusted(),
            return_location,
            callee_frame,
            frame::RETURN_LOCATION,
        );
        self.record_pc(pc);

        let direct = self.b.create_block();
        let via_stub = self.b.create_block();
        self.b.set_cold_block(via_stub);
        let merge = self.b.create_block();
        self.b.append_block_param(merge, types::I64);

        let site_addr = self.b.ins().iconst(types::I64, site);
        let expected = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            CallSite::EXPECTED_CALLEE_OFFSET,
        );
        let linked = self.b.ins().icmp(IntCC::Equal, callee, expected);
        self.b.ins().brif(linked, direct, &[], via_stub, &[]);

        self.b.switch_to_block(direct);
        let entry = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            CallSite::ENTRY_OFFSET,
        );
        let call = self
            .b
            .ins()
            .call_indirect(self.sigs.entry, entry, &[self.ctx, callee_frame]);
        let result = self.b.inst_results(call)[0];
        self.b.ins().jump(merge, &[BlockArg::Value(result)]);

        self.b.switch_to_block(via_stub);
        let pcv = self.b.ins().iconst(types::I64, pc as i64);
        let stub = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            CallSite::STUB_OFFSET,
        );
        let call = self.b.ins().call_indirect(
            self.sigs.call_stub,
            stub,
            &[self.ctx, self.frame, pcv, site_addr, callee_frame],
        );
        let result = self.b.inst_results(call)[0];
        self.b.ins().jump(merge, &[BlockArg::Value(result)]);

        self.b.switch_to_block(merge);
        let result = self.b.block_params(merge)[0];
        self.check_exception(result);
        self.store(dst, result);
    }
}
