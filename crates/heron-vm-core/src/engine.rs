//! The engine: installed code, heap, register file and the public API.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use heron_profiler::{Profiler, ProfilerContext};
use heron_vm_bytecode::{CodeBlock, Constant, StructureId, VirtualRegister, header};
use heron_vm_jit::{JitCompiler, JitContext, JitStats};
use heron_vm_value::{CellId, Encoding, Value};
use serde::Serialize;

use crate::code::LinkedCodeBlock;
use crate::config::EngineConfig;
use crate::error::{ExecutionTier, StackFrameInfo, ThrownValue, VmError, VmResult};
use crate::frame::{HOST_RETURN, RegisterFile};
use crate::heap::{CellBody, Heap};
use crate::interpreter::ExecutionState;
use crate::stubs;
use crate::structure::{Atom, Atoms, Structures};

/// Native callback callable from bytecode: `(engine, this, args)`
pub type HostFn = Rc<dyn Fn(&mut Engine, Value, &[Value]) -> VmResult<Value>>;

pub(crate) struct HostFunction {
    pub name: String,
    pub f: HostFn,
}

/// An installed top-level CodeBlock and the function cell wrapping it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRef {
    cell: CellId,
    code_block: u32,
}

impl FunctionRef {
    /// The function as a callable value
    pub fn value(&self) -> Value {
        Value::Cell(self.cell)
    }

    pub fn code_block_id(&self) -> u32 {
        self.code_block
    }
}

/// Requests termination of a running engine from any thread.
///
/// The engine checks the flag at loop back edges and call entries and raises
/// [`VmError::Terminated`], which no handler can catch.
#[derive(Debug, Clone)]
pub struct TerminationHandle(Arc<AtomicBool>);

impl TerminationHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Generic property lookups performed on cache misses
    pub structure_lookups: u64,
    pub ic_hits: u64,
    pub ic_misses: u64,
    pub watchpoints_fired: u64,
    /// Cache entries removed by fired watchpoints
    pub invalidated_entries: u64,
    pub interpreted_calls: u64,
    pub native_calls: u64,
    pub host_calls: u64,
    pub tier_ups: u64,
    pub compile_failures: u64,
    pub varargs_fast: u64,
    pub varargs_generic: u64,
    pub write_barriers: u64,
    pub cells: u64,
    pub structures: u64,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) encoding: Encoding,
    pub(crate) heap: Heap,
    pub(crate) structures: Structures,
    pub(crate) atoms: Atoms,
    pub(crate) registers: RegisterFile,
    pub(crate) code_blocks: Vec<Rc<LinkedCodeBlock>>,
    pub(crate) host_functions: Vec<HostFunction>,
    pub(crate) jit: Option<JitCompiler>,
    pub(crate) ctx: Box<JitContext>,
    pub(crate) terminate: Arc<AtomicBool>,
    /// Innermost frame that is executing or waiting in a stub
    pub(crate) top_call_frame: Option<usize>,
    /// Exception travelling to a `catch` or out of compiled code
    pub(crate) pending_exception: Option<VmError>,
    pub(crate) stats: EngineStats,
    pub(crate) profiler: Option<Arc<ProfilerContext>>,
    pub(crate) state: ExecutionState,
    /// Nested host entries currently running
    activations: u32,
    pub(crate) object_structure: StructureId,
    pub(crate) length_atom: Atom,
    pub(crate) name_atom: Atom,
    pub(crate) message_atom: Atom,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine that publishes its position into `profiler`
    pub fn with_profiler(config: EngineConfig, profiler: &Profiler) -> Self {
        Self::build(config, Some(profiler.context()))
    }

    fn build(config: EngineConfig, profiler: Option<Arc<ProfilerContext>>) -> Self {
        let encoding = config.encoding;
        let mut structures = Structures::new();
        let object_structure = structures.root(None);
        let mut atoms = Atoms::default();
        let length_atom = atoms.intern("length");
        let name_atom = atoms.intern("name");
        let message_atom = atoms.intern("message");

        let jit = if config.jit_enabled {
            match JitCompiler::new(encoding, stubs::runtime_stubs()) {
                Ok(jit) => Some(jit),
                Err(err) => {
                    tracing::debug!(error = %err, "baseline JIT unavailable, interpreting only");
                    None
                }
            }
        } else {
            None
        };

        let heap = Heap::new(config.heap_capacity, encoding);
        let registers = RegisterFile::new(config.register_file_words, encoding.undefined());
        let terminate = Arc::new(AtomicBool::new(false));
        let mut ctx = Box::new(JitContext::new(config.max_call_depth));
        ctx.cells = heap.table_ptr();
        ctx.register_base = registers.base_ptr();
        ctx.terminate = Arc::as_ptr(&terminate);

        if let Some(profiler) = &profiler
            && config.opcode_histogram
            && !profiler.histogram_enabled()
        {
            tracing::debug!("opcode histogram requested but the profiler was started without it");
        }

        Self {
            config,
            encoding,
            heap,
            structures,
            atoms,
            registers,
            code_blocks: Vec::new(),
            host_functions: Vec::new(),
            jit,
            ctx,
            terminate,
            top_call_frame: None,
            pending_exception: None,
            stats: EngineStats::default(),
            profiler,
            state: ExecutionState::Returned,
            activations: 0,
            object_structure,
            length_atom,
            name_atom,
            message_atom,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether the baseline JIT is available
    pub fn jit_enabled(&self) -> bool {
        self.jit.is_some()
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn structures(&self) -> &Structures {
        &self.structures
    }

    /// Current call depth across both tiers
    pub fn call_depth(&self) -> u32 {
        self.ctx.call_depth
    }

    pub fn termination_handle(&self) -> TerminationHandle {
        TerminationHandle(Arc::clone(&self.terminate))
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            write_barriers: self.heap.barrier_count(),
            cells: self.heap.len() as u64,
            structures: self.structures.len() as u64,
            ..self.stats.clone()
        }
    }

    pub fn jit_stats(&self) -> Option<&JitStats> {
        self.jit.as_ref().map(JitCompiler::stats)
    }

    pub fn code_block(&self, id: u32) -> Option<&LinkedCodeBlock> {
        self.code_blocks.get(id as usize).map(|code| &**code)
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = &LinkedCodeBlock> {
        self.code_blocks.iter().map(|code| &**code)
    }

    /// CodeBlock id of a bytecode function value
    pub fn function_code_block(&self, function: Value) -> Option<u32> {
        match self.heap.get(function.as_cell()?).body() {
            CellBody::Function { code_block } => Some(*code_block),
            _ => None,
        }
    }

    // -- installation -------------------------------------------------------

    /// Validate and link a CodeBlock and its nested declarations
    pub fn install(&mut self, code: CodeBlock) -> VmResult<FunctionRef> {
        let id = self.link(code)?;
        let cell = self
            .heap
            .alloc_function(self.object_structure, id, self.encoding.undefined())?;
        Ok(FunctionRef {
            cell,
            code_block: id,
        })
    }

    fn link(&mut self, mut code: CodeBlock) -> VmResult<u32> {
        code.validate()?;
        let decls = code
            .take_function_decls()
            .into_iter()
            .map(|decl| self.link(decl))
            .collect::<VmResult<Vec<_>>>()?;
        let constants = code
            .constants()
            .iter()
            .map(|c| self.link_constant(c))
            .collect::<VmResult<Vec<_>>>()?;
        let identifiers: Vec<Atom> = code
            .identifiers()
            .iter()
            .map(|name| self.atoms.intern(name))
            .collect();

        let id = self.code_blocks.len() as u32;
        if let Some(profiler) = &self.profiler {
            let lines: Vec<(u32, u32)> = code.lines().iter().map(|l| (l.offset, l.line)).collect();
            profiler.register_code_block(id, &code.name, &lines);
        }
        tracing::debug!(code_block = %code.name, id, "installed");
        self.code_blocks.push(Rc::new(LinkedCodeBlock::new(
            id,
            code,
            constants.into_boxed_slice(),
            identifiers.into_boxed_slice(),
            decls.into_boxed_slice(),
        )));
        Ok(id)
    }

    fn link_constant(&mut self, constant: &Constant) -> VmResult<u64> {
        let e = self.encoding;
        Ok(match constant {
            Constant::Undefined => e.undefined(),
            Constant::Null => e.null(),
            Constant::Boolean(b) => e.boolean(*b),
            Constant::Int32(n) => e.int32(*n),
            Constant::Double(d) => e.double(*d),
            Constant::String(s) => e.cell(self.heap.intern_string(s)?),
        })
    }

    /// Native callback callable from bytecode
    pub fn new_host_function(
        &mut self,
        name: &str,
        f: impl Fn(&mut Engine, Value, &[Value]) -> VmResult<Value> + 'static,
    ) -> VmResult<Value> {
        let index = self.host_functions.len() as u32;
        let cell = self.heap.alloc_host_function(self.object_structure, index)?;
        self.host_functions.push(HostFunction {
            name: name.to_string(),
            f: Rc::new(f),
        });
        Ok(Value::Cell(cell))
    }

    // -- execution ----------------------------------------------------------

    /// Run an installed function
    pub fn execute(&mut self, function: &FunctionRef, this: Value, args: &[Value]) -> VmResult<Value> {
        self.call(function.value(), this, args)
    }

    /// Call any callable value. Usable re-entrantly from host functions.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        let argc = args.len() + 1;
        let needed = header::SIZE as usize + argc;
        let floor = self.floor();
        if floor < needed {
            return Err(VmError::StackOverflow);
        }
        let cfp = floor - needed;
        let caller = self.top_call_frame;
        self.registers.set_caller_frame(cfp, caller);
        self.registers.set_return_location(cfp, HOST_RETURN);
        self.registers.set_code_block(cfp, u32::MAX);
        self.registers.set_callee(cfp, self.encoding.encode(callee));
        self.registers.set(cfp, header::ARGUMENT_COUNT, argc as u64);
        self.registers.set_scope(cfp, self.encoding.undefined());
        self.registers.set_argument(cfp, 0, self.encoding.encode(this));
        for (k, arg) in args.iter().enumerate() {
            self.registers.set_argument(cfp, k as u32 + 1, self.encoding.encode(*arg));
        }

        let outermost = self.activations == 0;
        self.activations += 1;
        self.ctx.runtime = (self as *mut Self).cast();
        let result = self.call_frame(cfp);
        self.activations -= 1;
        self.top_call_frame = caller;

        if outermost {
            self.ctx.call_depth = 0;
            self.pending_exception = None;
            self.state = ExecutionState::Returned;
            if let Some(profiler) = &self.profiler {
                profiler.publish_idle();
            }
            if matches!(result, Err(VmError::Terminated)) {
                tracing::debug!("execution terminated");
                self.terminate.store(false, Ordering::Relaxed);
            }
        }
        match result {
            Ok(word) => Ok(self.encoding.decode(word)),
            Err(err) => Err(self.materialize(err)),
        }
    }

    /// Lowest register-file index in use, or the end when idle
    fn floor(&self) -> usize {
        match self.top_call_frame {
            Some(fp) => {
                let (id, _) = self.registers.code_block(fp);
                let locals = self
                    .code_blocks
                    .get(id as usize)
                    .map_or(0, |code| code.code.num_locals() as usize);
                fp.saturating_sub(locals)
            }
            None => self.registers.len(),
        }
    }

    /// Frames from the innermost outward
    pub fn backtrace(&self) -> Vec<StackFrameInfo> {
        let mut frames = Vec::new();
        let mut cursor = self.top_call_frame;
        while let Some(fp) = cursor {
            let (id, jit) = self.registers.code_block(fp);
            if let Some(code) = self.code_blocks.get(id as usize) {
                let offset = self.registers.bytecode_offset(fp);
                frames.push(StackFrameInfo {
                    function: code.name().to_string(),
                    bytecode_offset: offset,
                    line: code.code.line_for(offset),
                    tier: if jit {
                        ExecutionTier::Baseline
                    } else {
                        ExecutionTier::Interpreter
                    },
                });
            }
            cursor = match self.registers.caller_frame(fp) {
                Some(caller) if caller > fp => Some(caller),
                _ => None,
            };
        }
        frames
    }

    // -- errors -------------------------------------------------------------

    /// Turn engine-raised errors into thrown error objects
    pub(crate) fn materialize(&mut self, err: VmError) -> VmError {
        let (name, message) = match &err {
            VmError::TypeError(m) => ("TypeError", m.as_str()),
            VmError::ReferenceError(m) => ("ReferenceError", m.as_str()),
            VmError::RangeError(m) => ("RangeError", m.as_str()),
            _ => return err,
        };
        let message = message.to_string();
        match self.error_object(name, &message) {
            Ok(value) => VmError::Exception(Box::new(ThrownValue {
                value,
                message: format!("{name}: {message}"),
                stack: self.backtrace(),
            })),
            Err(alloc) => alloc,
        }
    }

    /// Exception carrying `value`, with the current stack
    pub(crate) fn throw_value(&self, value: Value) -> VmError {
        VmError::Exception(Box::new(ThrownValue {
            value,
            message: self.display(value),
            stack: self.backtrace(),
        }))
    }

    pub(crate) fn error_object(&mut self, name: &str, message: &str) -> VmResult<Value> {
        let object = self.heap.alloc_object(self.object_structure)?;
        let name = self.heap.alloc_string(name)?;
        let message = self.heap.alloc_string(message)?;
        let e = self.encoding;
        self.define_own(object, self.name_atom, e.cell(name))?;
        self.define_own(object, self.message_atom, e.cell(message))?;
        Ok(Value::Cell(object))
    }

    // -- registers ----------------------------------------------------------

    /// Read a register or constant of the frame at `fp`
    #[inline]
    pub(crate) fn read(&self, code: &LinkedCodeBlock, fp: usize, reg: VirtualRegister) -> u64 {
        match code.constant(reg) {
            Some(word) => word,
            None => self.registers.get(fp, reg.offset()),
        }
    }

    #[inline]
    pub(crate) fn write(&mut self, fp: usize, reg: VirtualRegister, word: u64) {
        self.registers.set(fp, reg.offset(), word);
    }

    /// CodeBlock running in the frame at `fp`
    pub(crate) fn frame_code(&self, fp: usize) -> VmResult<Rc<LinkedCodeBlock>> {
        let (id, _) = self.registers.code_block(fp);
        self.code_blocks
            .get(id as usize)
            .cloned()
            .ok_or_else(|| VmError::internal(format!("frame {fp} has no code block")))
    }

    #[inline]
    pub(crate) fn decode(&self, word: u64) -> Value {
        self.encoding.decode(word)
    }

    #[inline]
    pub(crate) fn encode(&self, value: Value) -> u64 {
        self.encoding.encode(value)
    }

    #[inline]
    pub(crate) fn undefined(&self) -> u64 {
        self.encoding.undefined()
    }

    pub(crate) fn host_function(&self, index: u32) -> Option<HostFn> {
        self.host_functions.get(index as usize).map(|h| Rc::clone(&h.f))
    }

    pub(crate) fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("encoding", &self.encoding)
            .field("jit", &self.jit.is_some())
            .field("code_blocks", &self.code_blocks.len())
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}
