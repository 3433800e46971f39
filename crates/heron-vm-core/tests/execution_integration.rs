//! Execution integration tests
//!
//! Every scenario runs on four engines: interpreter only and baseline JIT
//! with an immediate threshold, each under both value encodings.
//! - Calls across tiers, host functions and re-entrancy
//! - Closures and lexical environments
//! - Exceptions, handler tables and backtraces
//! - Varargs calls through arguments objects and array-likes
//! - Call depth and register file limits, termination

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use heron_vm_bytecode::{CodeBlock, CodeBlockBuilder, Opcode};
use heron_vm_core::{
    Encoding, Engine, EngineConfig, ExecutionState, ExecutionTier, Value, VmError,
};

fn engines() -> Vec<(String, Engine)> {
    let mut out = Vec::new();
    for encoding in Encoding::ALL {
        for jit in [false, true] {
            let config = EngineConfig::default()
                .with_encoding(encoding)
                .with_jit(jit)
                .with_jit_threshold(0);
            out.push((format!("{encoding:?}/jit={jit}"), Engine::new(config)));
        }
    }
    out
}

fn property_string(engine: &mut Engine, object: Value, name: &str) -> Option<String> {
    let value = engine.get(object, name).ok()?;
    engine.string_value(value)
}

fn thrown(err: VmError) -> Box<heron_vm_core::ThrownValue> {
    match err {
        VmError::Exception(thrown) => thrown,
        other => panic!("expected a thrown value, got {other:?}"),
    }
}

/// `function name(f, ...args) { return f(...args) }` with a fixed arity
fn call_through(name: &str, argc: u32) -> CodeBlock {
    let mut b = CodeBlockBuilder::new(name).parameters(argc + 1);
    let result = b.new_register();
    let undef = b.undefined();
    let frame = b.call_frame(argc + 1);
    b.emit_mov(frame.this(), undef);
    for k in 0..argc {
        b.emit_mov(frame.argument(k + 1), b.param(k + 1));
    }
    b.emit_call(result, b.param(0), &frame);
    b.emit_ret(result);
    b.build().unwrap()
}

fn increment() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("increment").parameters(1);
    let x = b.new_register();
    b.emit_mov(x, b.param(0));
    b.emit_inc(x);
    b.emit_ret(x);
    b.build().unwrap()
}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_calls_between_bytecode_functions() {
    for (label, mut engine) in engines() {
        let inc = engine.install(increment()).unwrap();
        let call = engine.install(call_through("callOne", 1)).unwrap();
        for n in [0, 41, -7] {
            let result = engine
                .execute(&call, Value::Undefined, &[inc.value(), Value::Int32(n)])
                .unwrap();
            assert_eq!(result, Value::Int32(n + 1), "{label}");
        }
        assert_eq!(engine.call_depth(), 0, "{label}");
        assert_eq!(engine.state(), ExecutionState::Returned, "{label}");
    }
}

#[test]
fn test_missing_arguments_are_undefined() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("second").parameters(2);
        let count = b.new_register();
        let second = b.new_register();
        let undef = b.undefined();
        let yes = b.int(1);
        let no = b.int(0);
        b.emit_argument_count(count);
        b.emit_binary(Opcode::StrictEq, second, b.param(1), undef);
        let missing = b.new_label();
        b.emit_jtrue(second, missing);
        b.emit_ret(no);
        b.bind(missing);
        b.emit_add(count, count, yes);
        b.emit_ret(count);
        let f = engine.install(b.build().unwrap()).unwrap();

        // one argument passed: count 1, plus one because the second is missing
        let result = engine
            .execute(&f, Value::Undefined, &[Value::Int32(9)])
            .unwrap();
        assert_eq!(result, Value::Int32(2), "{label}");
        let full = engine
            .execute(&f, Value::Undefined, &[Value::Int32(9), Value::Int32(3)])
            .unwrap();
        assert_eq!(full, Value::Int32(0), "{label}");
    }
}

#[test]
fn test_extra_arguments_are_counted() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("count");
        let count = b.new_register();
        b.emit_argument_count(count);
        b.emit_ret(count);
        let f = engine.install(b.build().unwrap()).unwrap();
        let args = [Value::Int32(1), Value::Null, Value::Boolean(true)];
        let result = engine.execute(&f, Value::Undefined, &args).unwrap();
        assert_eq!(result, Value::Int32(3), "{label}");
    }
}

#[test]
fn test_host_function_called_from_bytecode() {
    for (label, mut engine) in engines() {
        let double = engine
            .new_host_function("double", |_, _, args| {
                let n = args.first().and_then(Value::as_int32).unwrap_or(0);
                Ok(Value::Int32(n * 2))
            })
            .unwrap();
        let call = engine.install(call_through("callOne", 1)).unwrap();
        let result = engine
            .execute(&call, Value::Undefined, &[double, Value::Int32(21)])
            .unwrap();
        assert_eq!(result, Value::Int32(42), "{label}");
        assert!(engine.stats().host_calls >= 1, "{label}");
    }
}

#[test]
fn test_host_function_reenters_the_engine() {
    for (label, mut engine) in engines() {
        let apply = engine
            .new_host_function("apply", |engine, _, args| {
                let (callee, rest) = args.split_first().expect("callee");
                engine.call(*callee, Value::Undefined, rest)
            })
            .unwrap();
        let inc = engine.install(increment()).unwrap();
        let call = engine.install(call_through("callTwo", 2)).unwrap();
        let result = engine
            .execute(
                &call,
                Value::Undefined,
                &[apply, inc.value(), Value::Int32(41)],
            )
            .unwrap();
        assert_eq!(result, Value::Int32(42), "{label}");
        assert_eq!(engine.call_depth(), 0, "{label}");
    }
}

#[test]
fn test_calling_a_non_function_is_a_type_error() {
    for (label, mut engine) in engines() {
        let call = engine.install(call_through("callOne", 1)).unwrap();
        let err = engine
            .execute(&call, Value::Undefined, &[Value::Int32(5), Value::Null])
            .unwrap_err();
        let thrown = thrown(err);
        assert!(
            thrown.message.starts_with("TypeError:"),
            "{label}: {}",
            thrown.message
        );
        assert!(thrown.message.contains("is not a function"), "{label}");
        assert_eq!(
            property_string(&mut engine, thrown.value, "name").as_deref(),
            Some("TypeError"),
            "{label}"
        );
    }
}

// ============================================================================
// Closures
// ============================================================================

fn make_counter() -> CodeBlock {
    let mut inner = CodeBlockBuilder::new("counter");
    let scope = inner.new_register();
    let v = inner.new_register();
    inner.emit_get_scope(scope);
    inner.emit_get_closure_var(v, scope, 0);
    inner.emit_inc(v);
    inner.emit_put_closure_var(scope, 0, v);
    inner.emit_ret(v);
    let inner = inner.build().unwrap();

    let mut b = CodeBlockBuilder::new("makeCounter");
    let env = b.new_register();
    let f = b.new_register();
    let zero = b.int(0);
    b.emit_create_lexical_environment(env, 1);
    b.emit_put_closure_var(env, 0, zero);
    let decl = b.add_function(inner);
    b.emit_new_function(f, decl);
    b.emit_ret(f);
    b.build().unwrap()
}

/// `makeAdder(base)` returns `x => base + x`, with `x` in its own scope
fn make_adder() -> CodeBlock {
    let mut inner = CodeBlockBuilder::new("adder").parameters(1);
    let env = inner.new_register();
    let x = inner.new_register();
    let base = inner.new_register();
    inner.emit_create_lexical_environment(env, 1);
    inner.emit_put_closure_var(env, 0, inner.param(0));
    inner.emit_get_closure_var(x, env, 0);
    inner.emit_get_closure_var(base, env, 1);
    inner.emit_add(x, base, x);
    inner.emit_ret(x);
    let inner = inner.build().unwrap();

    let mut b = CodeBlockBuilder::new("makeAdder").parameters(1);
    let env = b.new_register();
    let f = b.new_register();
    b.emit_create_lexical_environment(env, 1);
    b.emit_put_closure_var(env, 0, b.param(0));
    let decl = b.add_function(inner);
    b.emit_new_function(f, decl);
    b.emit_ret(f);
    b.build().unwrap()
}

#[test]
fn test_closures_keep_independent_state() {
    for (label, mut engine) in engines() {
        let make = engine.install(make_counter()).unwrap();
        let first = engine.execute(&make, Value::Undefined, &[]).unwrap();
        let second = engine.execute(&make, Value::Undefined, &[]).unwrap();
        for expected in 1..=3 {
            let value = engine.call(first, Value::Undefined, &[]).unwrap();
            assert_eq!(value, Value::Int32(expected), "{label}");
        }
        let value = engine.call(second, Value::Undefined, &[]).unwrap();
        assert_eq!(value, Value::Int32(1), "{label}");
    }
}

#[test]
fn test_closure_index_walks_enclosing_scopes() {
    for (label, mut engine) in engines() {
        let make = engine.install(make_adder()).unwrap();
        let add100 = engine
            .execute(&make, Value::Undefined, &[Value::Int32(100)])
            .unwrap();
        let result = engine
            .call(add100, Value::Undefined, &[Value::Int32(5)])
            .unwrap();
        assert_eq!(result, Value::Int32(105), "{label}");
    }
}

#[test]
fn test_unresolvable_closure_variable_is_a_reference_error() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("lost");
        let env = b.new_register();
        let v = b.new_register();
        b.emit_create_lexical_environment(env, 1);
        b.emit_get_closure_var(v, env, 4);
        b.emit_ret(v);
        let f = engine.install(b.build().unwrap()).unwrap();
        let err = engine.execute(&f, Value::Undefined, &[]).unwrap_err();
        assert!(
            thrown(err).message.starts_with("ReferenceError:"),
            "{label}"
        );
    }
}

// ============================================================================
// Exceptions
// ============================================================================

fn thrower(line: u32) -> CodeBlock {
    let mut b = CodeBlockBuilder::new("thrower");
    let v = b.int(42);
    b.set_line(line);
    b.emit_throw(v);
    b.build().unwrap()
}

/// `catcher(f) { try { return f() } catch (e) { return e } }`
fn catcher() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("catcher").parameters(1);
    let result = b.new_register();
    let e = b.new_register();
    let undef = b.undefined();
    let start = b.new_label();
    let end = b.new_label();
    let handler = b.new_label();
    b.bind(start);
    let frame = b.call_frame(1);
    b.emit_mov(frame.this(), undef);
    b.emit_call(result, b.param(0), &frame);
    b.bind(end);
    b.emit_ret(result);
    b.bind(handler);
    b.emit_catch(e);
    b.emit_ret(e);
    b.add_handler(start, end, handler);
    b.build().unwrap()
}

#[test]
fn test_thrown_value_reaches_the_handler() {
    for (label, mut engine) in engines() {
        let throw = engine.install(thrower(1)).unwrap();
        let catch = engine.install(catcher()).unwrap();
        let result = engine
            .execute(&catch, Value::Undefined, &[throw.value()])
            .unwrap();
        assert_eq!(result, Value::Int32(42), "{label}");
        assert_eq!(engine.call_depth(), 0, "{label}");
        assert_eq!(engine.state(), ExecutionState::Returned, "{label}");
    }
}

#[test]
fn test_handler_code_blocks_stay_in_the_interpreter() {
    for (label, mut engine) in engines() {
        let throw = engine.install(thrower(1)).unwrap();
        let catch = engine.install(catcher()).unwrap();
        engine
            .execute(&catch, Value::Undefined, &[throw.value()])
            .unwrap();
        let code = engine.code_block(catch.code_block_id()).unwrap();
        assert!(!code.is_compiled(), "{label}");
        if engine.jit_enabled() {
            assert!(code.is_not_compilable(), "{label}");
            assert!(
                engine
                    .code_block(throw.code_block_id())
                    .unwrap()
                    .is_compiled(),
                "{label}"
            );
        }
    }
}

#[test]
fn test_runtime_errors_become_error_objects() {
    for (label, mut engine) in engines() {
        let fail = engine
            .new_host_function("fail", |_, _, _| Err(VmError::type_error("boom")))
            .unwrap();
        let catch = engine.install(catcher()).unwrap();
        let e = engine.execute(&catch, Value::Undefined, &[fail]).unwrap();
        assert_eq!(
            property_string(&mut engine, e, "name").as_deref(),
            Some("TypeError"),
            "{label}"
        );
        assert_eq!(
            property_string(&mut engine, e, "message").as_deref(),
            Some("boom"),
            "{label}"
        );
    }
}

#[test]
fn test_uncaught_exception_carries_the_backtrace() {
    for (label, mut engine) in engines() {
        let throw = engine.install(thrower(7)).unwrap();
        let mut b = CodeBlockBuilder::new("outer").parameters(1);
        let result = b.new_register();
        let undef = b.undefined();
        b.set_line(3);
        let frame = b.call_frame(1);
        b.emit_mov(frame.this(), undef);
        b.emit_call(result, b.param(0), &frame);
        b.emit_ret(result);
        let outer = engine.install(b.build().unwrap()).unwrap();

        let err = engine
            .execute(&outer, Value::Undefined, &[throw.value()])
            .unwrap_err();
        let thrown = thrown(err);
        assert_eq!(thrown.value, Value::Int32(42), "{label}");
        let names: Vec<_> = thrown.stack.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, ["thrower", "outer"], "{label}");
        assert_eq!(thrown.stack[0].line, Some(7), "{label}");
        assert_eq!(thrown.stack[1].line, Some(3), "{label}");
        let expected = if engine.jit_enabled() {
            ExecutionTier::Baseline
        } else {
            ExecutionTier::Interpreter
        };
        assert_eq!(thrown.stack[0].tier, expected, "{label}");
        assert_eq!(engine.call_depth(), 0, "{label}");
    }
}

#[test]
fn test_backtrace_from_a_host_function() {
    for (label, mut engine) in engines() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let probe = engine
            .new_host_function("probe", move |engine, _, _| {
                let frames = engine.backtrace();
                sink.borrow_mut()
                    .extend(frames.into_iter().map(|f| f.function));
                Ok(Value::Undefined)
            })
            .unwrap();
        let call = engine.install(call_through("callOne", 1)).unwrap();
        engine
            .execute(&call, Value::Undefined, &[probe, Value::Null])
            .unwrap();
        assert_eq!(*seen.borrow(), ["callOne"], "{label}");
        assert!(engine.backtrace().is_empty(), "{label}");
    }
}

// ============================================================================
// Varargs
// ============================================================================

fn sum3() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("sum3").parameters(3);
    let s = b.new_register();
    b.emit_add(s, b.param(0), b.param(1));
    b.emit_add(s, s, b.param(2));
    b.emit_ret(s);
    b.build().unwrap()
}

/// `function forward(...) { return this(...arguments) }`
fn forward() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("forward");
    let args = b.new_register();
    let result = b.new_register();
    let undef = b.undefined();
    b.emit_create_arguments(args);
    b.emit_call_varargs(result, b.this_register(), undef, args);
    b.emit_ret(result);
    b.build().unwrap()
}

/// `function spread(f, list) { return f(...list) }`
fn spread() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("spread").parameters(2);
    let result = b.new_register();
    let undef = b.undefined();
    b.emit_call_varargs(result, b.param(0), undef, b.param(1));
    b.emit_ret(result);
    b.build().unwrap()
}

#[test]
fn test_forwarding_arguments_takes_the_fast_path() {
    for (label, mut engine) in engines() {
        let sum = engine.install(sum3()).unwrap();
        let fwd = engine.install(forward()).unwrap();
        let args = [Value::Int32(1), Value::Int32(2), Value::Int32(3)];
        let result = engine.execute(&fwd, sum.value(), &args).unwrap();
        assert_eq!(result, Value::Int32(6), "{label}");
        let stats = engine.stats();
        assert_eq!(stats.varargs_fast, 1, "{label}");
        assert_eq!(stats.varargs_generic, 0, "{label}");
    }
}

#[test]
fn test_spreading_an_array_like_object() {
    for (label, mut engine) in engines() {
        let sum = engine.install(sum3()).unwrap();
        let spread = engine.install(spread()).unwrap();
        let list = engine.new_object().unwrap();
        for (k, v) in [10, 20, 30].into_iter().enumerate() {
            engine.set(list, &k.to_string(), Value::Int32(v)).unwrap();
        }
        engine.set(list, "length", Value::Int32(3)).unwrap();

        let result = engine
            .execute(&spread, Value::Undefined, &[sum.value(), list])
            .unwrap();
        assert_eq!(result, Value::Int32(60), "{label}");
        assert_eq!(engine.stats().varargs_generic, 1, "{label}");
    }
}

#[test]
fn test_spreading_nullish_passes_no_arguments() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("count");
        let count = b.new_register();
        b.emit_argument_count(count);
        b.emit_ret(count);
        let count = engine.install(b.build().unwrap()).unwrap();
        let spread = engine.install(spread()).unwrap();
        for nullish in [Value::Undefined, Value::Null] {
            let result = engine
                .execute(&spread, Value::Undefined, &[count.value(), nullish])
                .unwrap();
            assert_eq!(result, Value::Int32(0), "{label}");
        }
    }
}

#[test]
fn test_spreading_a_primitive_is_a_type_error() {
    for (label, mut engine) in engines() {
        let sum = engine.install(sum3()).unwrap();
        let spread = engine.install(spread()).unwrap();
        let err = engine
            .execute(&spread, Value::Undefined, &[sum.value(), Value::Int32(5)])
            .unwrap_err();
        assert_eq!(
            thrown(err).message,
            "TypeError: CreateListFromArrayLike called on non-object",
            "{label}"
        );
    }
}

/// `function first(x) { return x }`
fn first() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("first").parameters(1);
    b.emit_ret(b.param(0));
    b.build().unwrap()
}

/// `function reassign(a) { args = arguments; a = 99; return this(...args) }`
fn reassign() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("reassign").parameters(1);
    let args = b.new_register();
    let result = b.new_register();
    let undef = b.undefined();
    let replacement = b.int(99);
    b.emit_create_arguments(args);
    b.emit_mov(b.param(0), replacement);
    b.emit_call_varargs(result, b.this_register(), undef, args);
    b.emit_ret(result);
    b.build().unwrap()
}

#[test]
fn test_arguments_keep_values_from_before_a_parameter_write() {
    for (label, mut engine) in engines() {
        let first = engine.install(first()).unwrap();
        let f = engine.install(reassign()).unwrap();
        for n in [1, -4] {
            let result = engine
                .execute(&f, first.value(), &[Value::Int32(n)])
                .unwrap();
            assert_eq!(result, Value::Int32(n), "{label}");
        }
        let stats = engine.stats();
        assert_eq!(stats.varargs_fast, 0, "{label}");
        assert_eq!(stats.varargs_generic, 2, "{label}");
    }
}

// ============================================================================
// Limits
// ============================================================================

/// `function down() { return down() }`
fn down() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("down");
    let f = b.new_register();
    let result = b.new_register();
    let undef = b.undefined();
    b.emit_get_callee(f);
    let frame = b.call_frame(1);
    b.emit_mov(frame.this(), undef);
    b.emit_call(result, f, &frame);
    b.emit_ret(result);
    b.build().unwrap()
}

fn limited_engines(configure: impl Fn(EngineConfig) -> EngineConfig) -> Vec<(String, Engine)> {
    let mut out = Vec::new();
    for encoding in Encoding::ALL {
        for jit in [false, true] {
            let config = EngineConfig::default()
                .with_encoding(encoding)
                .with_jit(jit)
                .with_jit_threshold(0);
            out.push((format!("{encoding:?}/jit={jit}"), Engine::new(configure(config))));
        }
    }
    out
}

#[test]
fn test_call_depth_limit_raises_stack_overflow() {
    for (label, mut engine) in limited_engines(|c| c.with_max_call_depth(64)) {
        let f = engine.install(down()).unwrap();
        let err = engine.execute(&f, Value::Undefined, &[]).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow), "{label}: {err:?}");
        assert_eq!(engine.call_depth(), 0, "{label}");

        // the engine is still usable afterwards
        let inc = engine.install(increment()).unwrap();
        let result = engine
            .execute(&inc, Value::Undefined, &[Value::Int32(1)])
            .unwrap();
        assert_eq!(result, Value::Int32(2), "{label}");
    }
}

#[test]
fn test_stack_overflow_is_catchable_as_range_error() {
    for (label, mut engine) in limited_engines(|c| c.with_max_call_depth(64)) {
        let f = engine.install(down()).unwrap();
        let catch = engine.install(catcher()).unwrap();
        let e = engine
            .execute(&catch, Value::Undefined, &[f.value()])
            .unwrap();
        assert_eq!(
            property_string(&mut engine, e, "name").as_deref(),
            Some("RangeError"),
            "{label}"
        );
        assert_eq!(
            property_string(&mut engine, e, "message").as_deref(),
            Some("Maximum call stack size exceeded"),
            "{label}"
        );
        assert_eq!(engine.call_depth(), 0, "{label}");
    }
}

#[test]
fn test_register_file_exhaustion_raises_stack_overflow() {
    let configure = |c: EngineConfig| {
        c.with_max_call_depth(1_000_000)
            .with_register_file_words(1024)
    };
    for (label, mut engine) in limited_engines(configure) {
        let f = engine.install(down()).unwrap();
        let err = engine.execute(&f, Value::Undefined, &[]).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow), "{label}: {err:?}");
        assert_eq!(engine.call_depth(), 0, "{label}");
    }
}

#[test]
fn test_termination_stops_a_running_loop() {
    for (label, mut engine) in engines() {
        let handle = engine.termination_handle();
        let ticks = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&ticks);
        let tick = engine
            .new_host_function("tick", move |_, _, _| {
                counter.set(counter.get() + 1);
                if counter.get() == 10 {
                    handle.request();
                }
                Ok(Value::Undefined)
            })
            .unwrap();

        let mut b = CodeBlockBuilder::new("spin").parameters(1);
        let result = b.new_register();
        let undef = b.undefined();
        let top = b.new_label();
        b.bind(top);
        b.emit_loop_hint();
        let frame = b.call_frame(1);
        b.emit_mov(frame.this(), undef);
        b.emit_call(result, b.param(0), &frame);
        b.emit_jmp(top);
        let spin = engine.install(b.build().unwrap()).unwrap();
        let catch = engine.install(catcher()).unwrap();
        let call = engine.install(call_through("callOne", 1)).unwrap();

        // handlers never see termination
        let err = engine
            .execute(&call, Value::Undefined, &[spin.value(), tick])
            .unwrap_err();
        assert!(matches!(err, VmError::Terminated), "{label}: {err:?}");
        assert_eq!(ticks.get(), 10, "{label}");
        assert!(!engine.termination_handle().is_requested(), "{label}");
        assert_eq!(engine.call_depth(), 0, "{label}");

        let inc = engine.install(increment()).unwrap();
        let result = engine
            .execute(&catch, Value::Undefined, &[inc.value()])
            .unwrap();
        assert!(result.is_number(), "{label}");
    }
}

#[test]
fn test_termination_is_not_catchable() {
    for (label, mut engine) in engines() {
        let handle = engine.termination_handle();
        let stop = engine
            .new_host_function("stop", move |_, _, _| {
                handle.request();
                Ok(Value::Undefined)
            })
            .unwrap();

        let mut b = CodeBlockBuilder::new("loopAfter").parameters(1);
        let result = b.new_register();
        let undef = b.undefined();
        let frame = b.call_frame(1);
        b.emit_mov(frame.this(), undef);
        b.emit_call(result, b.param(0), &frame);
        let top = b.new_label();
        b.bind(top);
        b.emit_loop_hint();
        b.emit_jmp(top);
        let looping = engine.install(b.build().unwrap()).unwrap();

        let mut b = CodeBlockBuilder::new("guarded").parameters(2);
        let result = b.new_register();
        let e = b.new_register();
        let undef = b.undefined();
        let start = b.new_label();
        let end = b.new_label();
        let handler = b.new_label();
        b.bind(start);
        let frame = b.call_frame(2);
        b.emit_mov(frame.this(), undef);
        b.emit_mov(frame.argument(1), b.param(1));
        b.emit_call(result, b.param(0), &frame);
        b.bind(end);
        b.emit_ret(result);
        b.bind(handler);
        b.emit_catch(e);
        b.emit_ret(e);
        b.add_handler(start, end, handler);
        let guarded = engine.install(b.build().unwrap()).unwrap();

        let err = engine
            .execute(&guarded, Value::Undefined, &[looping.value(), stop])
            .unwrap_err();
        assert!(matches!(err, VmError::Terminated), "{label}: {err:?}");
    }
}

/// `deep(m)` recurses `m` times, then throws 42
fn deep() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("deep").parameters(1);
    let m = b.param(0);
    let f = b.new_register();
    let result = b.new_register();
    let zero = b.int(0);
    let one = b.int(1);
    let thrown = b.int(42);
    let undef = b.undefined();
    b.emit_get_callee(f);
    let bottom = b.new_label();
    b.emit_compare_jump(Opcode::JNLess, zero, m, bottom);
    let frame = b.call_frame(2);
    b.emit_mov(frame.this(), undef);
    b.emit_sub(frame.argument(1), m, one);
    b.emit_call(result, f, &frame);
    b.emit_ret(result);
    b.bind(bottom);
    b.emit_throw(thrown);
    b.build().unwrap()
}

/// `guard(m) { try { return this(m) } catch (e) { return e } }`, returning
/// -1000 when its own header or parameter changed across the throw
fn guard() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("guard").parameters(1);
    let m = b.param(0);
    let saved = b.new_register();
    let count = b.new_register();
    let result = b.new_register();
    let e = b.new_register();
    let ok = b.new_register();
    let undef = b.undefined();
    let one = b.int(1);
    let broken = b.int(-1000);
    b.emit_mov(saved, m);
    let start = b.new_label();
    let end = b.new_label();
    let handler = b.new_label();
    let bad = b.new_label();
    b.bind(start);
    let frame = b.call_frame(2);
    b.emit_mov(frame.this(), undef);
    b.emit_mov(frame.argument(1), m);
    b.emit_call(result, b.this_register(), &frame);
    b.bind(end);
    b.emit_ret(result);
    b.bind(handler);
    b.emit_catch(e);
    b.emit_argument_count(count);
    b.emit_binary(Opcode::StrictEq, ok, count, one);
    b.emit_jfalse(ok, bad);
    b.emit_binary(Opcode::StrictEq, ok, m, saved);
    b.emit_jfalse(ok, bad);
    b.emit_ret(e);
    b.bind(bad);
    b.emit_ret(broken);
    b.add_handler(start, end, handler);
    b.build().unwrap()
}

/// `makeNest(guard, inspect, deep)` returns a closure `nest(n, m)` over
/// `[5, guard, inspect, deep]`. `nest` recurses `n` times, then calls
/// `guard(m)` and `inspect()`. On the way out every frame re-reads its
/// scope, argument count and parameters and adds `n` to the result, or
/// returns -1000 when anything changed.
fn make_nest() -> CodeBlock {
    let mut inner = CodeBlockBuilder::new("nest").parameters(2);
    let (n, m) = (inner.param(0), inner.param(1));
    let f = inner.new_register();
    let scope = inner.new_register();
    let count = inner.new_register();
    let saved_n = inner.new_register();
    let saved_m = inner.new_register();
    let result = inner.new_register();
    let t = inner.new_register();
    let ok = inner.new_register();
    let zero = inner.int(0);
    let one = inner.int(1);
    let two = inner.int(2);
    let five = inner.int(5);
    let broken = inner.int(-1000);
    let undef = inner.undefined();
    let base = inner.new_label();
    let check = inner.new_label();
    let bad = inner.new_label();

    inner.emit_get_callee(f);
    inner.emit_get_scope(scope);
    inner.emit_argument_count(count);
    inner.emit_mov(saved_n, n);
    inner.emit_mov(saved_m, m);
    inner.emit_binary(Opcode::StrictEq, t, n, zero);
    inner.emit_jtrue(t, base);
    let frame = inner.call_frame(3);
    inner.emit_mov(frame.this(), undef);
    inner.emit_sub(frame.argument(1), n, one);
    inner.emit_mov(frame.argument(2), m);
    inner.emit_call(result, f, &frame);
    inner.emit_jmp(check);

    inner.bind(base);
    let frame = inner.call_frame(2);
    inner.emit_get_closure_var(frame.this(), scope, 3);
    inner.emit_mov(frame.argument(1), m);
    inner.emit_get_closure_var(t, scope, 1);
    inner.emit_call(result, t, &frame);
    let frame = inner.call_frame(1);
    inner.emit_mov(frame.this(), undef);
    inner.emit_get_closure_var(t, scope, 2);
    inner.emit_call(t, t, &frame);

    inner.bind(check);
    inner.emit_get_scope(t);
    inner.emit_binary(Opcode::StrictEq, ok, t, scope);
    inner.emit_jfalse(ok, bad);
    inner.emit_get_closure_var(t, t, 0);
    inner.emit_binary(Opcode::StrictEq, ok, t, five);
    inner.emit_jfalse(ok, bad);
    inner.emit_argument_count(t);
    inner.emit_binary(Opcode::StrictEq, ok, t, count);
    inner.emit_jfalse(ok, bad);
    inner.emit_binary(Opcode::StrictEq, ok, t, two);
    inner.emit_jfalse(ok, bad);
    inner.emit_binary(Opcode::StrictEq, ok, n, saved_n);
    inner.emit_jfalse(ok, bad);
    inner.emit_binary(Opcode::StrictEq, ok, m, saved_m);
    inner.emit_jfalse(ok, bad);
    inner.emit_add(result, result, n);
    inner.emit_ret(result);
    inner.bind(bad);
    inner.emit_ret(broken);
    let inner = inner.build().unwrap();

    let mut b = CodeBlockBuilder::new("makeNest").parameters(3);
    let env = b.new_register();
    let nest = b.new_register();
    let five = b.int(5);
    b.emit_create_lexical_environment(env, 4);
    b.emit_put_closure_var(env, 0, five);
    b.emit_put_closure_var(env, 1, b.param(0));
    b.emit_put_closure_var(env, 2, b.param(1));
    b.emit_put_closure_var(env, 3, b.param(2));
    let decl = b.add_function(inner);
    b.emit_new_function(nest, decl);
    b.emit_ret(nest);
    b.build().unwrap()
}

#[test]
fn test_frames_survive_a_caught_throw_near_the_depth_limit() {
    const OUTER: i32 = 40;
    const INNER: i32 = 18;
    for (label, mut engine) in limited_engines(|c| c.with_max_call_depth(64)) {
        let seen: Rc<RefCell<Vec<Vec<String>>>> = Rc::default();
        let record = Rc::clone(&seen);
        let inspect = engine
            .new_host_function("inspect", move |engine, _, _| {
                let names = engine.backtrace().into_iter().map(|f| f.function).collect();
                record.borrow_mut().push(names);
                Ok(Value::Undefined)
            })
            .unwrap();
        let guard = engine.install(guard()).unwrap();
        let deep = engine.install(deep()).unwrap();
        let make = engine.install(make_nest()).unwrap();
        let nest = engine
            .execute(&make, Value::Undefined, &[guard.value(), inspect, deep.value()])
            .unwrap();

        for _ in 0..2 {
            let result = engine
                .call(nest, Value::Undefined, &[Value::Int32(OUTER), Value::Int32(INNER)])
                .unwrap();
            assert_eq!(result, Value::Int32(42 + OUTER * (OUTER + 1) / 2), "{label}");
            assert_eq!(engine.call_depth(), 0, "{label}");
        }

        // the caller links above the catch point are intact
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2, "{label}");
        for names in seen.iter() {
            assert_eq!(names.len(), OUTER as usize + 1, "{label}");
            assert!(names.iter().all(|name| name == "nest"), "{label}: {names:?}");
        }
    }
}

// ============================================================================
// Objects from bytecode
// ============================================================================

#[test]
fn test_objects_built_in_bytecode() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("build").parameters(1);
        let o = b.new_register();
        let v = b.new_register();
        let key = b.int(3);
        let seven = b.int(7);
        b.emit_new_object(o);
        b.emit_put_by_id(o, "x", b.param(0));
        b.emit_put_by_val(o, key, seven);
        b.emit_get_by_id(v, o, "x");
        b.emit_put_by_id(o, "y", v);
        b.emit_ret(o);
        let f = engine.install(b.build().unwrap()).unwrap();

        let o = engine
            .execute(&f, Value::Undefined, &[Value::Int32(11)])
            .unwrap();
        assert_eq!(engine.get(o, "x").unwrap(), Value::Int32(11), "{label}");
        assert_eq!(engine.get(o, "y").unwrap(), Value::Int32(11), "{label}");
        assert_eq!(engine.get(o, "3").unwrap(), Value::Int32(7), "{label}");
        assert_eq!(engine.get(o, "z").unwrap(), Value::Undefined, "{label}");
    }
}

#[test]
fn test_reading_a_property_of_undefined_is_a_type_error() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("read").parameters(1);
        let v = b.new_register();
        b.emit_get_by_id(v, b.param(0), "x");
        b.emit_ret(v);
        let f = engine.install(b.build().unwrap()).unwrap();
        let err = engine
            .execute(&f, Value::Undefined, &[Value::Undefined])
            .unwrap_err();
        assert_eq!(
            thrown(err).message,
            "TypeError: Cannot read properties of undefined (reading 'x')",
            "{label}"
        );
    }
}

#[test]
fn test_string_concatenation() {
    for (label, mut engine) in engines() {
        let mut b = CodeBlockBuilder::new("greet").parameters(1);
        let s = b.new_register();
        let hello = b.string("n=");
        b.emit_add(s, hello, b.param(0));
        b.emit_ret(s);
        let f = engine.install(b.build().unwrap()).unwrap();
        let result = engine
            .execute(&f, Value::Undefined, &[Value::Int32(12)])
            .unwrap();
        assert_eq!(engine.string_value(result).as_deref(), Some("n=12"), "{label}");
    }
}
