//! Bytecode interpreter.
//!
//! Dispatch goes through [`HANDLERS`], a table of handler functions indexed
//! by opcode id. A handler executes one instruction against the frame at
//! `fp` and tells the loop where to go next. Calls between bytecode frames do
//! not recurse on the native stack; the loop switches frames in place and
//! only re-enters itself through host functions and runtime stubs.
//!
//! The same handlers serve the baseline tier's slow paths through
//! [`Engine::execute_one`].

use std::rc::Rc;

use heron_vm_bytecode::{ArithProfile, Instruction, OPCODE_COUNT, VirtualRegister, header};
use heron_vm_jit::{CompileRequest, CompiledCode, JitContext};
use heron_vm_value::arith::{self, to_int32};
use heron_vm_value::{ArithOp, BitOp, CellId, Number, RelOp, Value};

use crate::code::{JitState, LinkedCodeBlock};
use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::heap::CellBody;

/// Where execution of the outermost activation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    /// Searching handler tables for an exception
    Unwinding,
    Returned,
}

/// What the loop does after a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(usize),
    /// Enter the callee frame prepared at `frame`; its result goes to `dst`
    Call { frame: usize, dst: VirtualRegister },
    Return(u64),
}

/// Result of entering a prepared call frame
enum Entered {
    /// Host function; already finished
    Done(u64),
    /// Compiled callee; run its entry on `frame`
    Native {
        frame: usize,
        code: Rc<CompiledCode>,
        id: u32,
    },
    /// Interpreted callee; its frame is set up
    Interpreted(usize),
}

enum CalleeKind {
    Code(u32),
    Host(u32),
    NotCallable,
}

type Handler = fn(&mut Engine, &LinkedCodeBlock, usize, &Instruction<'_>) -> VmResult<Flow>;

/// Handler table, indexed by opcode id
static HANDLERS: [Handler; OPCODE_COUNT] = [
    op_nop, // enter
    op_nop,
    op_mov,
    op_add,
    op_sub,
    op_mul,
    op_div,
    op_mod,
    op_negate,
    op_inc,
    op_dec,
    op_bitand,
    op_bitor,
    op_bitxor,
    op_lshift,
    op_rshift,
    op_urshift,
    op_bitnot,
    op_less,
    op_lesseq,
    op_greater,
    op_greatereq,
    op_eq,
    op_neq,
    op_stricteq,
    op_nstricteq,
    op_not,
    op_to_number,
    op_jmp,
    op_jtrue,
    op_jfalse,
    op_jless,
    op_jnless,
    op_jlesseq,
    op_jnlesseq,
    op_loop_hint,
    op_new_object,
    op_get_by_id,
    op_put_by_id,
    op_get_by_val,
    op_put_by_val,
    op_new_function,
    op_call,
    op_call_varargs,
    op_ret,
    op_throw,
    op_catch,
    op_create_arguments,
    op_get_scope,
    op_create_lexical_environment,
    op_get_closure_var,
    op_put_closure_var,
    op_get_callee,
    op_argument_count,
];

impl Engine {
    /// Enter the prepared call frame at `cfp` and run it to completion
    pub(crate) fn call_frame(&mut self, cfp: usize) -> VmResult<u64> {
        match self.enter_call(cfp)? {
            Entered::Done(word) => Ok(word),
            Entered::Native { frame, code, id } => self.invoke_native(frame, &code, id),
            Entered::Interpreted(fp) => self.run(fp),
        }
    }

    /// Check and set up the frame at `cfp`, whose header already holds the
    /// callee, the argument count and the caller link
    fn enter_call(&mut self, cfp: usize) -> VmResult<Entered> {
        if self.termination_requested() {
            return Err(VmError::Terminated);
        }
        let callee = self.registers.callee(cfp);
        let callee_cell = self.encoding.as_cell(callee);
        let kind = match callee_cell.map(|id| self.heap.get(id).body()) {
            Some(CellBody::Function { code_block }) => CalleeKind::Code(*code_block),
            Some(CellBody::HostFunction { index }) => CalleeKind::Host(*index),
            _ => CalleeKind::NotCallable,
        };
        let id = match kind {
            CalleeKind::Code(id) => id,
            CalleeKind::Host(index) => return self.call_host(cfp, index).map(Entered::Done),
            CalleeKind::NotCallable => {
                return Err(VmError::type_error(format!(
                    "{} is not a function",
                    self.display(self.decode(callee))
                )));
            }
        };

        if self.ctx.call_depth >= self.ctx.max_call_depth {
            return Err(VmError::StackOverflow);
        }
        let code = self
            .code_blocks
            .get(id as usize)
            .cloned()
            .ok_or_else(|| VmError::internal(format!("function refers to missing code block {id}")))?;
        let argc = self.registers.argument_count(cfp);
        let fp = self
            .registers
            .fixup_arity(cfp, argc, code.code.num_parameters(), self.undefined())
            .ok_or(VmError::StackOverflow)?;
        let locals = code.code.num_locals();
        if !self.registers.has_room(fp, locals) {
            return Err(VmError::StackOverflow);
        }

        code.bump();
        self.tier_up(&code);
        if let Some(compiled) = code.compiled() {
            return Ok(Entered::Native {
                frame: fp,
                code: compiled,
                id,
            });
        }

        let scope = callee_cell.map_or(self.undefined(), |cell| self.heap.get(cell).scope());
        self.registers.set_code_block(fp, id);
        self.registers.set_scope(fp, scope);
        self.registers.set_bytecode_offset(fp, 0);
        self.registers.init_locals(fp, locals, self.undefined());
        self.ctx.call_depth += 1;
        self.stats.interpreted_calls += 1;
        self.top_call_frame = Some(fp);
        Ok(Entered::Interpreted(fp))
    }

    fn call_host(&mut self, cfp: usize, index: u32) -> VmResult<u64> {
        let f = self
            .host_function(index)
            .ok_or_else(|| VmError::internal(format!("missing host function {index}")))?;
        let argc = self.registers.argument_count(cfp);
        let this = self.decode(self.registers.argument(cfp, 0));
        let args: Vec<Value> = (1..argc)
            .map(|k| self.decode(self.registers.argument(cfp, k)))
            .collect();
        self.registers.set_code_block(cfp, u32::MAX);
        let saved = self.top_call_frame;
        self.top_call_frame = Some(cfp);
        self.stats.host_calls += 1;
        let result = f(self, this, &args);
        self.top_call_frame = saved;
        Ok(self.encode(result?))
    }

    /// Compile `code` once its counter reaches the threshold
    fn tier_up(&mut self, code: &Rc<LinkedCodeBlock>) {
        if code.counter() < self.config.jit_threshold
            || !matches!(*code.jit.borrow(), JitState::Interpreted)
        {
            return;
        }
        let Some(jit) = self.jit.as_mut() else {
            return;
        };
        let result = jit.compile(CompileRequest {
            code: &code.code,
            code_block_id: code.id,
            constants: &code.constants,
        });
        match result {
            Ok(compiled) => {
                *code.jit.borrow_mut() = JitState::Compiled(Rc::new(compiled));
                self.stats.tier_ups += 1;
                tracing::debug!(code_block = %code.name(), counter = code.counter(), "tiered up to baseline");
                self.seed_patch_table(code);
            }
            Err(err) => {
                *code.jit.borrow_mut() = JitState::NotCompilable;
                self.stats.compile_failures += 1;
                tracing::debug!(code_block = %code.name(), error = %err, "staying in the interpreter");
            }
        }
    }

    #[allow(unsafe_code)]
    fn invoke_native(&mut self, frame: usize, code: &CompiledCode, id: u32) -> VmResult<u64> {
        self.ctx.runtime = (self as *mut Self).cast();
        if let Some(profiler) = &self.profiler {
            profiler.publish_native(id);
        }
        self.stats.native_calls += 1;
        let ctx: *mut JitContext = &mut *self.ctx;
        let frame_ptr = self.registers.frame_ptr(frame);
        // SAFETY: the entry was produced for this engine's encoding and
        // register layout. `frame` holds a complete header with room for the
        // callee's locals, and ctx points at this engine for every stub the
        // code calls.
        let word = unsafe { (code.entry)(ctx, frame_ptr) };
        if word == self.encoding.exception_sentinel() {
            return Err(self
                .pending_exception
                .take()
                .unwrap_or_else(|| VmError::internal("compiled code raised without an exception")));
        }
        Ok(word)
    }

    /// Interpret from the freshly entered frame `entry` until it returns
    fn run(&mut self, entry: usize) -> VmResult<u64> {
        self.state = ExecutionState::Running;
        let mut fp = entry;
        let mut code = self.frame_code(fp)?;
        let mut pc = 0usize;

        loop {
            let (flow, next) = if pc < code.code.instructions().len() {
                let inst = code.code.instruction_at(pc);
                self.registers.set_bytecode_offset(fp, pc as u32);
                self.top_call_frame = Some(fp);
                if let Some(profiler) = &self.profiler {
                    profiler.publish(code.id, pc as u32, inst.opcode);
                    if self.config.opcode_histogram {
                        profiler.count(inst.opcode);
                    }
                }
                let flow = HANDLERS[inst.opcode as usize](self, &code, fp, &inst);
                (flow, inst.next_offset())
            } else {
                (Ok(Flow::Return(self.undefined())), pc)
            };

            let failure = match flow {
                Ok(Flow::Next) => {
                    pc = next;
                    continue;
                }
                Ok(Flow::Jump(target)) => {
                    pc = target;
                    continue;
                }
                Ok(Flow::Return(word)) => {
                    self.ctx.call_depth = self.ctx.call_depth.saturating_sub(1);
                    if fp == entry {
                        return Ok(word);
                    }
                    let location = self.registers.return_location(fp) as usize;
                    fp = self
                        .registers
                        .caller_frame(fp)
                        .ok_or_else(|| VmError::internal("interpreted frame without a caller"))?;
                    code = self.frame_code(fp)?;
                    let call = code.code.instruction_at(location);
                    self.write(fp, call.reg(0), word);
                    pc = call.next_offset();
                    continue;
                }
                Ok(Flow::Call { frame, dst }) => match self.enter_call(frame) {
                    Ok(Entered::Done(word)) => {
                        self.write(fp, dst, word);
                        pc = next;
                        continue;
                    }
                    Ok(Entered::Native {
                        frame,
                        code: callee,
                        id,
                    }) => match self.invoke_native(frame, &callee, id) {
                        Ok(word) => {
                            self.write(fp, dst, word);
                            pc = next;
                            continue;
                        }
                        Err(err) => err,
                    },
                    Ok(Entered::Interpreted(callee_fp)) => {
                        fp = callee_fp;
                        code = self.frame_code(fp)?;
                        pc = 0;
                        continue;
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };

            (fp, code, pc) = self.unwind(entry, fp, failure)?;
        }
    }

    /// Walk from `fp` toward `entry` looking for a handler covering each
    /// frame's current bytecode offset. Frames without one are popped.
    fn unwind(
        &mut self,
        entry: usize,
        mut fp: usize,
        err: VmError,
    ) -> VmResult<(usize, Rc<LinkedCodeBlock>, usize)> {
        self.state = ExecutionState::Unwinding;
        let mut err = self.materialize(err);
        loop {
            let code = self.frame_code(fp)?;
            let offset = self.registers.bytecode_offset(fp);
            if err.is_catchable()
                && let Some(handler) = code.code.handler_for(offset)
            {
                let target = handler.target as usize;
                if matches!(err, VmError::StackOverflow) {
                    self.top_call_frame = Some(fp);
                    err = self.materialize(VmError::range_error("Maximum call stack size exceeded"));
                }
                tracing::trace!(code_block = %code.name(), offset, target, "exception caught");
                self.pending_exception = Some(err);
                self.state = ExecutionState::Running;
                return Ok((fp, code, target));
            }
            self.ctx.call_depth = self.ctx.call_depth.saturating_sub(1);
            if fp == entry {
                return Err(err);
            }
            fp = self
                .registers
                .caller_frame(fp)
                .ok_or_else(|| VmError::internal("interpreted frame without a caller"))?;
        }
    }

    /// Execute the single instruction at `pc` of the frame at `fp`. Returns
    /// 1 when a conditional jump is taken and 0 otherwise.
    pub(crate) fn execute_one(&mut self, fp: usize, pc: usize) -> VmResult<u64> {
        let code = self.frame_code(fp)?;
        if pc >= code.code.instructions().len() {
            return Err(VmError::internal(format!("slow path at bc#{pc} past the end")));
        }
        let inst = code.code.instruction_at(pc);
        match HANDLERS[inst.opcode as usize](self, &code, fp, &inst)? {
            Flow::Next => Ok(0),
            Flow::Jump(_) => Ok(1),
            Flow::Call { frame, dst } => {
                let word = self.call_frame(frame)?;
                self.write(fp, dst, word);
                Ok(0)
            }
            Flow::Return(_) => Err(VmError::internal("return reached through a slow path")),
        }
    }

    /// Fill the header of the callee frame at `cfp`
    fn prepare_frame(&mut self, cfp: usize, caller: usize, pc: usize, callee: u64, argc: u32) {
        self.registers.set_callee(cfp, callee);
        self.registers.set(cfp, header::ARGUMENT_COUNT, u64::from(argc));
        self.registers.set_caller_frame(cfp, Some(caller));
        self.registers.set_return_location(cfp, pc as u64);
    }

    /// Arguments for a varargs call made by `code` running in the frame at `fp`
    fn spread_arguments(&mut self, code: &LinkedCodeBlock, fp: usize, arguments: u64) -> VmResult<Vec<u64>> {
        let Some(id) = self.encoding.as_cell(arguments) else {
            if self.decode(arguments).is_nullish() {
                return Ok(Vec::new());
            }
            return Err(VmError::type_error(
                "CreateListFromArrayLike called on non-object",
            ));
        };
        if let CellBody::Arguments {
            frame,
            callee,
            modified: false,
        } = *self.heap.get(id).body()
            && frame == fp
            && callee == self.registers.callee(fp)
            && !code.writes_arguments()
        {
            self.stats.varargs_fast += 1;
            let argc = self.registers.argument_count(fp);
            return Ok((1..argc).map(|k| self.registers.argument(fp, k)).collect());
        }
        if self.structure_of_cell(id).is_none() {
            return Err(VmError::type_error(
                "CreateListFromArrayLike called on non-object",
            ));
        }

        self.stats.varargs_generic += 1;
        let length = self.get_named(arguments, self.length_atom)?;
        let length = arith::to_uint32(self.to_numeric(length).as_f64()) as usize;
        if length > self.registers.len() {
            return Err(VmError::range_error("too many arguments in function call"));
        }
        let mut args = Vec::with_capacity(length);
        for index in 0..length {
            let atom = self.atoms.intern(&index.to_string());
            args.push(self.get_named(arguments, atom)?);
        }
        Ok(args)
    }

    /// Scope cell and slot holding closure variable `index`, counting from
    /// the innermost scope outward
    fn closure_slot(&self, scope: u64, index: u32) -> VmResult<(CellId, u32)> {
        let mut cursor = self.encoding.as_cell(scope);
        let mut remaining = index;
        while let Some(id) = cursor {
            let cell = self.heap.get(id);
            let CellBody::Scope { parent } = cell.body() else {
                break;
            };
            let size = cell.slots().len() as u32;
            if remaining < size {
                return Ok((id, remaining));
            }
            remaining -= size;
            cursor = *parent;
        }
        Err(VmError::reference_error(format!(
            "closure variable {index} is not defined"
        )))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[inline]
fn binary_operands(
    engine: &Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
) -> (u64, u64) {
    (
        engine.read(code, fp, inst.reg(1)),
        engine.read(code, fp, inst.reg(2)),
    )
}

fn profile_flags(lhs: Number, rhs: Number, result: Number, non_number: bool) -> u8 {
    let ints = matches!((lhs, rhs), (Number::Int(_), Number::Int(_)));
    let mut flags = if non_number {
        ArithProfile::NON_NUMBER_OPERANDS
    } else if ints {
        ArithProfile::INT32_OPERANDS
    } else {
        ArithProfile::DOUBLE_OPERANDS
    };
    if let Number::Double(d) = result {
        if d == 0.0 && d.is_sign_negative() {
            flags |= ArithProfile::NEGATIVE_ZERO;
        } else if d.is_finite() && d.fract() != 0.0 {
            flags |= ArithProfile::NON_INTEGRAL;
        } else if ints {
            flags |= ArithProfile::OVERFLOWED;
        }
    }
    flags
}

fn arithmetic(
    engine: &mut Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
    op: ArithOp,
) -> VmResult<Flow> {
    let (l, r) = binary_operands(engine, code, fp, inst);
    let result = if op == ArithOp::Add && (engine.encoding.is_cell(l) || engine.encoding.is_cell(r)) {
        code.code
            .arith_profile(inst.operand(3))
            .record(ArithProfile::NON_NUMBER_OPERANDS);
        engine.concat(l, r)?
    } else {
        let (ln, rn) = (engine.to_numeric(l), engine.to_numeric(r));
        let result = op.apply(ln, rn);
        let non_number = !engine.decode(l).is_number() || !engine.decode(r).is_number();
        code.code
            .arith_profile(inst.operand(3))
            .record(profile_flags(ln, rn, result, non_number));
        engine.encode(result.into())
    };
    engine.write(fp, inst.reg(0), result);
    Ok(Flow::Next)
}

fn op_nop(_: &mut Engine, _: &LinkedCodeBlock, _: usize, _: &Instruction<'_>) -> VmResult<Flow> {
    Ok(Flow::Next)
}

fn op_mov(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let value = engine.read(code, fp, inst.reg(1));
    engine.write(fp, inst.reg(0), value);
    Ok(Flow::Next)
}

fn op_add(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    arithmetic(engine, code, fp, inst, ArithOp::Add)
}

fn op_sub(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    arithmetic(engine, code, fp, inst, ArithOp::Sub)
}

fn op_mul(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    arithmetic(engine, code, fp, inst, ArithOp::Mul)
}

fn op_div(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    arithmetic(engine, code, fp, inst, ArithOp::Div)
}

fn op_mod(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    arithmetic(engine, code, fp, inst, ArithOp::Mod)
}

fn op_negate(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let word = engine.read(code, fp, inst.reg(1));
    let operand = engine.to_numeric(word);
    let result = arith::negate(operand);
    let non_number = !engine.decode(word).is_number();
    code.code
        .arith_profile(inst.operand(2))
        .record(profile_flags(operand, operand, result, non_number));
    engine.write(fp, inst.reg(0), engine.encode(result.into()));
    Ok(Flow::Next)
}

fn step(engine: &mut Engine, fp: usize, inst: &Instruction<'_>, delta: i32) -> VmResult<Flow> {
    let reg = inst.reg(0);
    let current = engine.registers.get(fp, reg.offset());
    let result = arith::increment(engine.to_numeric(current), delta);
    engine.write(fp, reg, engine.encode(result.into()));
    Ok(Flow::Next)
}

fn op_inc(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    step(engine, fp, inst, 1)
}

fn op_dec(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    step(engine, fp, inst, -1)
}

fn int32_of(engine: &Engine, word: u64) -> i32 {
    match engine.to_numeric(word) {
        Number::Int(n) => n,
        Number::Double(d) => to_int32(d),
    }
}

fn bitwise(
    engine: &mut Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
    op: BitOp,
) -> VmResult<Flow> {
    let (l, r) = binary_operands(engine, code, fp, inst);
    let result = op.apply(int32_of(engine, l), int32_of(engine, r));
    engine.write(fp, inst.reg(0), engine.encode(result.into()));
    Ok(Flow::Next)
}

fn op_bitand(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::And)
}

fn op_bitor(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::Or)
}

fn op_bitxor(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::Xor)
}

fn op_lshift(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::Shl)
}

fn op_rshift(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::Shr)
}

fn op_urshift(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    bitwise(engine, code, fp, inst, BitOp::UShr)
}

fn op_bitnot(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let word = engine.read(code, fp, inst.reg(1));
    let result = !int32_of(engine, word);
    engine.write(fp, inst.reg(0), engine.encoding.int32(result));
    Ok(Flow::Next)
}

fn compare(
    engine: &mut Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
    op: RelOp,
) -> VmResult<Flow> {
    let (l, r) = binary_operands(engine, code, fp, inst);
    let result = engine.relational(op, l, r);
    engine.write(fp, inst.reg(0), engine.encoding.boolean(result));
    Ok(Flow::Next)
}

fn op_less(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare(engine, code, fp, inst, RelOp::Less)
}

fn op_lesseq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare(engine, code, fp, inst, RelOp::LessEq)
}

fn op_greater(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare(engine, code, fp, inst, RelOp::Greater)
}

fn op_greatereq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare(engine, code, fp, inst, RelOp::GreaterEq)
}

fn equality(
    engine: &mut Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
    strict: bool,
    negated: bool,
) -> VmResult<Flow> {
    let (l, r) = binary_operands(engine, code, fp, inst);
    let equal = if strict {
        engine.strict_equals(l, r)
    } else {
        engine.loose_equals(l, r)
    };
    engine.write(fp, inst.reg(0), engine.encoding.boolean(equal != negated));
    Ok(Flow::Next)
}

fn op_eq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    equality(engine, code, fp, inst, false, false)
}

fn op_neq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    equality(engine, code, fp, inst, false, true)
}

fn op_stricteq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    equality(engine, code, fp, inst, true, false)
}

fn op_nstricteq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    equality(engine, code, fp, inst, true, true)
}

fn op_not(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let word = engine.read(code, fp, inst.reg(1));
    let result = !engine.to_boolean(word);
    engine.write(fp, inst.reg(0), engine.encoding.boolean(result));
    Ok(Flow::Next)
}

fn op_to_number(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let word = engine.read(code, fp, inst.reg(1));
    let result = if engine.decode(word).is_number() {
        word
    } else {
        let n = engine.to_numeric(word);
        engine.encode(n.into())
    };
    engine.write(fp, inst.reg(0), result);
    Ok(Flow::Next)
}

fn op_jmp(_: &mut Engine, _: &LinkedCodeBlock, _: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    Ok(Flow::Jump(inst.jump_target(0) as usize))
}

fn branch(taken: bool, inst: &Instruction<'_>, operand: usize) -> VmResult<Flow> {
    Ok(if taken {
        Flow::Jump(inst.jump_target(operand) as usize)
    } else {
        Flow::Next
    })
}

fn op_jtrue(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let cond = engine.read(code, fp, inst.reg(0));
    branch(engine.to_boolean(cond), inst, 1)
}

fn op_jfalse(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let cond = engine.read(code, fp, inst.reg(0));
    branch(!engine.to_boolean(cond), inst, 1)
}

fn compare_jump(
    engine: &mut Engine,
    code: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
    op: RelOp,
    negated: bool,
) -> VmResult<Flow> {
    let l = engine.read(code, fp, inst.reg(0));
    let r = engine.read(code, fp, inst.reg(1));
    let holds = engine.relational(op, l, r);
    branch(holds != negated, inst, 2)
}

fn op_jless(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare_jump(engine, code, fp, inst, RelOp::Less, false)
}

fn op_jnless(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare_jump(engine, code, fp, inst, RelOp::Less, true)
}

fn op_jlesseq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare_jump(engine, code, fp, inst, RelOp::LessEq, false)
}

fn op_jnlesseq(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    compare_jump(engine, code, fp, inst, RelOp::LessEq, true)
}

fn op_loop_hint(engine: &mut Engine, code: &LinkedCodeBlock, _: usize, _: &Instruction<'_>) -> VmResult<Flow> {
    if engine.termination_requested() {
        return Err(VmError::Terminated);
    }
    code.bump();
    Ok(Flow::Next)
}

fn op_new_object(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let id = engine.heap.alloc_object(engine.object_structure)?;
    engine.write(fp, inst.reg(0), engine.encoding.cell(id));
    Ok(Flow::Next)
}

fn op_get_by_id(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let base = engine.read(code, fp, inst.reg(1));
    let value = engine.get_by_id(code, inst.operand(3), base)?;
    engine.write(fp, inst.reg(0), value);
    Ok(Flow::Next)
}

fn op_put_by_id(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let base = engine.read(code, fp, inst.reg(0));
    let value = engine.read(code, fp, inst.reg(2));
    engine.put_by_id(code, inst.operand(3), base, value)?;
    Ok(Flow::Next)
}

fn op_get_by_val(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let (base, key) = binary_operands(engine, code, fp, inst);
    let atom = engine.property_key(key);
    let value = engine.get_named(base, atom)?;
    engine.write(fp, inst.reg(0), value);
    Ok(Flow::Next)
}

fn op_put_by_val(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let base = engine.read(code, fp, inst.reg(0));
    let key = engine.read(code, fp, inst.reg(1));
    let value = engine.read(code, fp, inst.reg(2));
    let atom = engine.property_key(key);
    engine.put_named(base, atom, value)?;
    Ok(Flow::Next)
}

fn op_new_function(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let decl = inst.operand(1);
    let id = code
        .decls
        .get(decl as usize)
        .copied()
        .ok_or_else(|| VmError::internal(format!("missing function declaration {decl}")))?;
    let scope = engine.registers.scope(fp);
    let cell = engine.heap.alloc_function(engine.object_structure, id, scope)?;
    engine.write(fp, inst.reg(0), engine.encoding.cell(cell));
    Ok(Flow::Next)
}

fn op_call(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let callee = engine.read(code, fp, inst.reg(1));
    let argc = inst.operand(2);
    let offset = inst.operand(3) as i32;
    let cfp = fp
        .checked_add_signed(offset as isize)
        .ok_or(VmError::StackOverflow)?;
    engine.record_call_link(code, inst.operand(4), callee);
    engine.prepare_frame(cfp, fp, inst.offset, callee, argc);
    Ok(Flow::Call {
        frame: cfp,
        dst: inst.reg(0),
    })
}

fn op_call_varargs(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let callee = engine.read(code, fp, inst.reg(1));
    let this = engine.read(code, fp, inst.reg(2));
    let arguments = engine.read(code, fp, inst.reg(3));
    let first_free = inst.operand(4) as usize;
    engine.record_call_link(code, inst.operand(5), callee);

    let args = engine.spread_arguments(code, fp, arguments)?;
    let argc = args.len() + 1;
    let cfp = fp
        .checked_sub(first_free + header::SIZE as usize + argc)
        .ok_or(VmError::StackOverflow)?;
    engine.prepare_frame(cfp, fp, inst.offset, callee, argc as u32);
    engine.registers.set_argument(cfp, 0, this);
    for (k, word) in args.into_iter().enumerate() {
        engine.registers.set_argument(cfp, k as u32 + 1, word);
    }
    Ok(Flow::Call {
        frame: cfp,
        dst: inst.reg(0),
    })
}

fn op_ret(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    Ok(Flow::Return(engine.read(code, fp, inst.reg(0))))
}

fn op_throw(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let value = engine.decode(engine.read(code, fp, inst.reg(0)));
    Err(engine.throw_value(value))
}

fn op_catch(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let value = match engine.pending_exception.take() {
        Some(VmError::Exception(thrown)) => engine.encode(thrown.value),
        Some(other) => match engine.materialize(other) {
            VmError::Exception(thrown) => engine.encode(thrown.value),
            err => return Err(err),
        },
        None => engine.undefined(),
    };
    engine.write(fp, inst.reg(0), value);
    Ok(Flow::Next)
}

fn op_create_arguments(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let argc = engine.registers.argument_count(fp);
    let callee = engine.registers.callee(fp);
    let structure = engine.structures.dictionary(None);
    let id = engine.heap.alloc_arguments(structure, fp, callee)?;
    for k in 1..argc {
        let atom = engine.atoms.intern(&(k - 1).to_string());
        let word = engine.registers.argument(fp, k);
        engine.define_own(id, atom, word)?;
    }
    let length = engine.encoding.int32(argc.saturating_sub(1) as i32);
    engine.define_own(id, engine.length_atom, length)?;
    if let CellBody::Arguments { modified, .. } = engine.heap.get_mut(id).body_mut() {
        *modified = false;
    }
    engine.write(fp, inst.reg(0), engine.encoding.cell(id));
    Ok(Flow::Next)
}

fn op_get_scope(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let scope = engine.registers.scope(fp);
    engine.write(fp, inst.reg(0), scope);
    Ok(Flow::Next)
}

fn op_create_lexical_environment(
    engine: &mut Engine,
    _: &LinkedCodeBlock,
    fp: usize,
    inst: &Instruction<'_>,
) -> VmResult<Flow> {
    let parent = engine.encoding.as_cell(engine.registers.scope(fp));
    let scope = engine.heap.alloc_scope(inst.operand(1), parent)?;
    let word = engine.encoding.cell(scope);
    engine.registers.set_scope(fp, word);
    engine.write(fp, inst.reg(0), word);
    Ok(Flow::Next)
}

fn op_get_closure_var(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let scope = engine.read(code, fp, inst.reg(1));
    let (cell, slot) = engine.closure_slot(scope, inst.operand(2))?;
    let value = engine.heap.slot(cell, slot);
    engine.write(fp, inst.reg(0), value);
    Ok(Flow::Next)
}

fn op_put_closure_var(engine: &mut Engine, code: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let scope = engine.read(code, fp, inst.reg(0));
    let value = engine.read(code, fp, inst.reg(2));
    let (cell, slot) = engine.closure_slot(scope, inst.operand(1))?;
    engine.heap.store_slot(cell, slot, value);
    Ok(Flow::Next)
}

fn op_get_callee(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let callee = engine.registers.callee(fp);
    engine.write(fp, inst.reg(0), callee);
    Ok(Flow::Next)
}

fn op_argument_count(engine: &mut Engine, _: &LinkedCodeBlock, fp: usize, inst: &Instruction<'_>) -> VmResult<Flow> {
    let argc = engine.registers.argument_count(fp);
    let count = engine.encoding.int32(argc.saturating_sub(1) as i32);
    engine.write(fp, inst.reg(0), count);
    Ok(Flow::Next)
}
