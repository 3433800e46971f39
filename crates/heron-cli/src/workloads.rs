//! Built-in bytecode programs the `heron` binary can run

use anyhow::Result;
use clap::ValueEnum;
use heron_vm_bytecode::{CodeBlock, CodeBlockBuilder, Opcode};
use heron_vm_core::{Engine, FunctionRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Naive recursive Fibonacci
    Fib,
    /// Sum of 0..n in a counted loop
    LoopSum,
    /// One property load site fed objects of four shapes
    Polymorphic,
    /// A closure counter called n times
    Closures,
}

/// Installed entry point and the arguments to call it with
pub struct Prepared {
    pub entry: FunctionRef,
    pub args: Vec<Value>,
}

impl Workload {
    pub fn name(self) -> &'static str {
        match self {
            Workload::Fib => "fib",
            Workload::LoopSum => "loop-sum",
            Workload::Polymorphic => "polymorphic",
            Workload::Closures => "closures",
        }
    }

    pub fn default_arg(self) -> i32 {
        match self {
            Workload::Fib => 25,
            Workload::LoopSum => 1_000_000,
            Workload::Polymorphic => 100_000,
            Workload::Closures => 10_000,
        }
    }

    /// Install the workload's CodeBlocks and build its inputs
    pub fn prepare(self, engine: &mut Engine, arg: i32) -> Result<Prepared> {
        let n = Value::Int32(arg);
        match self {
            Workload::Fib => {
                let entry = engine.install(fib()?)?;
                Ok(Prepared { entry, args: vec![n] })
            }
            Workload::LoopSum => {
                let entry = engine.install(loop_sum()?)?;
                Ok(Prepared { entry, args: vec![n] })
            }
            Workload::Polymorphic => {
                let shapes = 4;
                let list = engine.new_object()?;
                for shape in 0..shapes {
                    let object = engine.new_object()?;
                    for pad in 0..shape {
                        engine.set(object, &format!("p{pad}"), Value::Int32(pad))?;
                    }
                    engine.set(object, "x", Value::Int32(shape + 1))?;
                    engine.set(list, &shape.to_string(), object)?;
                }
                let entry = engine.install(read_all()?)?;
                Ok(Prepared {
                    entry,
                    args: vec![list, Value::Int32(shapes), n],
                })
            }
            Workload::Closures => {
                let make = engine.install(make_counter()?)?;
                let counter = engine.execute(&make, Value::Undefined, &[])?;
                let entry = engine.install(drive()?)?;
                Ok(Prepared {
                    entry,
                    args: vec![counter, n],
                })
            }
        }
    }
}

fn fib() -> Result<CodeBlock> {
    let mut b = CodeBlockBuilder::new("fib").parameters(1);
    let n = b.param(0);
    let f = b.new_register();
    let a = b.new_register();
    let c = b.new_register();
    let one = b.int(1);
    let two = b.int(2);
    let undef = b.undefined();
    b.set_line(1);
    b.emit_get_callee(f);
    let recurse = b.new_label();
    b.emit_compare_jump(Opcode::JNLess, n, two, recurse);
    b.emit_ret(n);
    b.bind(recurse);
    b.set_line(2);
    let frame = b.call_frame(2);
    b.emit_mov(frame.this(), undef);
    b.emit_sub(frame.argument(1), n, one);
    b.emit_call(a, f, &frame);
    let frame = b.call_frame(2);
    b.emit_mov(frame.this(), undef);
    b.emit_sub(frame.argument(1), n, two);
    b.emit_call(c, f, &frame);
    b.set_line(3);
    b.emit_add(a, a, c);
    b.emit_ret(a);
    Ok(b.build()?)
}

fn loop_sum() -> Result<CodeBlock> {
    let mut b = CodeBlockBuilder::new("loopSum").parameters(1);
    let n = b.param(0);
    let s = b.new_register();
    let i = b.new_register();
    let zero = b.int(0);
    b.set_line(1);
    b.emit_mov(s, zero);
    b.emit_mov(i, zero);
    let top = b.new_label();
    let done = b.new_label();
    b.bind(top);
    b.set_line(2);
    b.emit_loop_hint();
    b.emit_compare_jump(Opcode::JNLess, i, n, done);
    b.set_line(3);
    b.emit_add(s, s, i);
    b.emit_inc(i);
    b.emit_jmp(top);
    b.bind(done);
    b.set_line(4);
    b.emit_ret(s);
    Ok(b.build()?)
}

/// `(list, k, n) => { s = 0; for (i = 0; i < n; i++) s += list[i % k].x; return s }`
fn read_all() -> Result<CodeBlock> {
    let mut b = CodeBlockBuilder::new("readAll").parameters(3);
    let (list, k, n) = (b.param(0), b.param(1), b.param(2));
    let s = b.new_register();
    let i = b.new_register();
    let j = b.new_register();
    let object = b.new_register();
    let x = b.new_register();
    let zero = b.int(0);
    b.set_line(1);
    b.emit_mov(s, zero);
    b.emit_mov(i, zero);
    let top = b.new_label();
    let done = b.new_label();
    b.bind(top);
    b.set_line(2);
    b.emit_loop_hint();
    b.emit_compare_jump(Opcode::JNLess, i, n, done);
    b.set_line(3);
    b.emit_mod(j, i, k);
    b.emit_get_by_val(object, list, j);
    b.emit_get_by_id(x, object, "x");
    b.emit_add(s, s, x);
    b.emit_inc(i);
    b.emit_jmp(top);
    b.bind(done);
    b.emit_ret(s);
    Ok(b.build()?)
}

fn make_counter() -> Result<CodeBlock> {
    let mut inner = CodeBlockBuilder::new("counter");
    let scope = inner.new_register();
    let v = inner.new_register();
    inner.emit_get_scope(scope);
    inner.emit_get_closure_var(v, scope, 0);
    inner.emit_inc(v);
    inner.emit_put_closure_var(scope, 0, v);
    inner.emit_ret(v);
    let inner = inner.build()?;

    let mut b = CodeBlockBuilder::new("makeCounter");
    let env = b.new_register();
    let f = b.new_register();
    let zero = b.int(0);
    b.emit_create_lexical_environment(env, 1);
    b.emit_put_closure_var(env, 0, zero);
    let decl = b.add_function(inner);
    b.emit_new_function(f, decl);
    b.emit_ret(f);
    Ok(b.build()?)
}

/// `(f, n) => { for (i = 0; i < n; i++) last = f(); return last }`
fn drive() -> Result<CodeBlock> {
    let mut b = CodeBlockBuilder::new("drive").parameters(2);
    let (f, n) = (b.param(0), b.param(1));
    let i = b.new_register();
    let last = b.new_register();
    let zero = b.int(0);
    let undef = b.undefined();
    b.emit_mov(i, zero);
    b.emit_mov(last, undef);
    let top = b.new_label();
    let done = b.new_label();
    b.bind(top);
    b.emit_loop_hint();
    b.emit_compare_jump(Opcode::JNLess, i, n, done);
    let frame = b.call_frame(1);
    b.emit_mov(frame.this(), undef);
    b.emit_call(last, f, &frame);
    b.emit_inc(i);
    b.emit_jmp(top);
    b.bind(done);
    b.emit_ret(last);
    Ok(b.build()?)
}

#[cfg(test)]
mod tests {
    use heron_vm_core::EngineConfig;

    use super::*;

    fn run(workload: Workload, config: EngineConfig, arg: i32) -> Value {
        let mut engine = Engine::new(config);
        let prepared = workload.prepare(&mut engine, arg).unwrap();
        engine
            .execute(&prepared.entry, Value::Undefined, &prepared.args)
            .unwrap()
    }

    fn configs() -> [EngineConfig; 2] {
        [
            EngineConfig::default().with_jit(false),
            EngineConfig::default().with_jit_threshold(0),
        ]
    }

    #[test]
    fn fib_workload() {
        for config in configs() {
            assert_eq!(run(Workload::Fib, config, 15), Value::Int32(610));
        }
    }

    #[test]
    fn loop_sum_workload() {
        for config in configs() {
            assert_eq!(run(Workload::LoopSum, config, 10), Value::Int32(45));
        }
    }

    #[test]
    fn polymorphic_workload() {
        // x values are 1..=4, so every block of four reads adds 10
        for config in configs() {
            assert_eq!(run(Workload::Polymorphic, config, 40), Value::Int32(100));
        }
    }

    #[test]
    fn closures_workload() {
        for config in configs() {
            assert_eq!(run(Workload::Closures, config, 25), Value::Int32(25));
        }
    }
}
