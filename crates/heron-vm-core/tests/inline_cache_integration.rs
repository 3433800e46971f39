//! Inline cache integration tests
//!
//! This module drives property and call sites through their state machines:
//! - Monomorphic hits, idempotent updates and transition caching
//! - Polymorphic growth bounded by the configured limit, then generic
//! - Prototype and absent entries invalidated by watchpoints
//! - Call links and the patch sites of compiled code

use heron_vm_bytecode::{CodeBlock, CodeBlockBuilder, PropertyCacheState};
use heron_vm_core::{Encoding, Engine, EngineConfig, Value};
use heron_vm_jit::SlowPathReason;

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

/// `function getX(o) { return o.x }`
fn get_x() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("getX").parameters(1);
    let v = b.new_register();
    b.emit_get_by_id(v, b.param(0), "x");
    b.emit_ret(v);
    b.build().unwrap()
}

/// `function setX(o, v) { o.x = v }`
fn set_x() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("setX").parameters(2);
    let undef = b.undefined();
    b.emit_put_by_id(b.param(0), "x", b.param(1));
    b.emit_ret(undef);
    b.build().unwrap()
}

/// Object with `keys` defined in order, each holding its position
fn object_with(engine: &mut Engine, keys: &[&str]) -> Value {
    let object = engine.new_object().unwrap();
    for (i, key) in keys.iter().enumerate() {
        engine.set(object, key, Value::Int32(i as i32)).unwrap();
    }
    object
}

fn cache_state(engine: &Engine, code_block: u32) -> PropertyCacheState {
    engine
        .code_block(code_block)
        .unwrap()
        .code
        .property_cache(0)
        .borrow()
        .state
        .clone()
}

// ============================================================================
// Monomorphic
// ============================================================================

#[test]
fn test_same_shape_stays_monomorphic() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        for i in 0..10 {
            let o = object_with(&mut engine, &["a", "x"]);
            engine.set(o, "x", Value::Int32(i)).unwrap();
            let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
            assert_eq!(v, Value::Int32(i), "{label}");
        }
        let state = cache_state(&engine, get.code_block_id());
        assert_eq!(state.name(), "monomorphic", "{label}");
        assert_eq!(state.entries().len(), 1, "{label}");
    }
}

#[test]
fn test_interpreter_counts_hits_and_misses() {
    let mut engine = Engine::new(EngineConfig::default().with_jit(false));
    let get = engine.install(get_x()).unwrap();
    for _ in 0..10 {
        let o = object_with(&mut engine, &["x"]);
        engine.execute(&get, Value::Undefined, &[o]).unwrap();
    }
    let code = engine.code_block(get.code_block_id()).unwrap();
    let ic = code.code.property_cache(0).borrow();
    assert_eq!(ic.misses, 1);
    assert_eq!(ic.hits, 9);
    drop(ic);
    let stats = engine.stats();
    assert_eq!(stats.ic_hits, 9);
    assert_eq!(stats.ic_misses, 1);
}

#[test]
fn test_repeated_updates_are_idempotent() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let o = object_with(&mut engine, &["x"]);
        engine.execute(&get, Value::Undefined, &[o]).unwrap();
        let first = cache_state(&engine, get.code_block_id());
        for _ in 0..50 {
            engine.execute(&get, Value::Undefined, &[o]).unwrap();
        }
        let later = cache_state(&engine, get.code_block_id());
        assert_eq!(first.entries(), later.entries(), "{label}");
        assert_eq!(later.name(), "monomorphic", "{label}");

        // inserting the entry the site already holds changes nothing
        let mut state = later.clone();
        let entry = state.entries()[0].clone();
        assert!(!state.insert(entry, 4), "{label}");
        assert_eq!(state.entries(), later.entries(), "{label}");
    }
}

#[test]
fn test_put_caches_the_transition() {
    for (label, mut engine) in engines() {
        let set = engine.install(set_x()).unwrap();
        let first = engine.new_object().unwrap();
        let second = engine.new_object().unwrap();
        engine
            .execute(&set, Value::Undefined, &[first, Value::Int32(1)])
            .unwrap();
        engine
            .execute(&set, Value::Undefined, &[second, Value::Int32(2)])
            .unwrap();

        assert_eq!(engine.get(first, "x").unwrap(), Value::Int32(1), "{label}");
        assert_eq!(engine.get(second, "x").unwrap(), Value::Int32(2), "{label}");
        assert_eq!(
            engine.structure_of(first),
            engine.structure_of(second),
            "{label}"
        );
        let state = cache_state(&engine, set.code_block_id());
        assert_eq!(state.name(), "monomorphic", "{label}");

        // a store to an existing property replaces in place
        engine
            .execute(&set, Value::Undefined, &[first, Value::Int32(9)])
            .unwrap();
        assert_eq!(engine.get(first, "x").unwrap(), Value::Int32(9), "{label}");
        assert_eq!(
            engine.structure_of(first),
            engine.structure_of(second),
            "{label}"
        );
    }
}

#[test]
fn test_primitive_receivers_do_not_touch_the_cache() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let v = engine
            .execute(&get, Value::Undefined, &[Value::Int32(3)])
            .unwrap();
        assert_eq!(v, Value::Undefined, "{label}");
        let state = cache_state(&engine, get.code_block_id());
        assert_eq!(state.name(), "uninitialized", "{label}");
    }
}

// ============================================================================
// Polymorphic and generic
// ============================================================================

#[test]
fn test_polymorphic_growth_is_bounded() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let mut rank = 0;
        for i in 0..1000 {
            let lead = format!("k{i}");
            let o = object_with(&mut engine, &[&lead, "x"]);
            let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
            assert_eq!(v, Value::Int32(1), "{label}: object {i}");

            let state = cache_state(&engine, get.code_block_id());
            assert!(state.entries().len() <= 4, "{label}: object {i}");
            assert!(state.rank() >= rank, "{label}: state moved backward");
            rank = state.rank();
            let expected = match i {
                0 => "monomorphic",
                1..=3 => "polymorphic",
                _ => "generic",
            };
            assert_eq!(state.name(), expected, "{label}: object {i}");
        }
    }
}

#[test]
fn test_polymorphic_limit_is_configurable() {
    let mut engine = Engine::new(
        EngineConfig::default()
            .with_jit(false)
            .with_polymorphic_limit(2),
    );
    let get = engine.install(get_x()).unwrap();
    for (i, lead) in ["a", "b", "c"].into_iter().enumerate() {
        let o = object_with(&mut engine, &[lead, "x"]);
        engine.execute(&get, Value::Undefined, &[o]).unwrap();
        let state = cache_state(&engine, get.code_block_id());
        let expected = ["monomorphic", "polymorphic", "generic"][i];
        assert_eq!(state.name(), expected);
    }
}

#[test]
fn test_generic_site_still_reads_correctly() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let shapes: Vec<Vec<String>> = (0..8)
            .map(|i| (0..i).map(|k| format!("p{k}")).collect())
            .collect();
        for round in 0..3 {
            for shape in &shapes {
                let mut keys: Vec<&str> = shape.iter().map(String::as_str).collect();
                keys.push("x");
                let o = object_with(&mut engine, &keys);
                let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
                assert_eq!(
                    v,
                    Value::Int32(shape.len() as i32),
                    "{label}: round {round}"
                );
            }
        }
        assert_eq!(
            cache_state(&engine, get.code_block_id()).name(),
            "generic",
            "{label}"
        );
    }
}

// ============================================================================
// Prototype chains and watchpoints
// ============================================================================

#[test]
fn test_prototype_load_is_cached() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let proto = object_with(&mut engine, &["x"]);
        engine.set(proto, "x", Value::Int32(5)).unwrap();
        let objects: Vec<Value> = (0..3)
            .map(|_| {
                let o = engine.new_object().unwrap();
                engine.set_prototype(o, proto).unwrap();
                o
            })
            .collect();
        for &o in &objects {
            let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
            assert_eq!(v, Value::Int32(5), "{label}");
        }
        let state = cache_state(&engine, get.code_block_id());
        assert_eq!(state.name(), "monomorphic", "{label}");

        // replacing the value on the holder keeps the entry valid
        engine.set(proto, "x", Value::Int32(6)).unwrap();
        let v = engine
            .execute(&get, Value::Undefined, &[objects[0]])
            .unwrap();
        assert_eq!(v, Value::Int32(6), "{label}");
    }
}

#[test]
fn test_absent_entry_is_invalidated_when_the_prototype_changes() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let proto = object_with(&mut engine, &["y"]);
        let o = engine.new_object().unwrap();
        engine.set_prototype(o, proto).unwrap();

        let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
        assert_eq!(v, Value::Undefined, "{label}");
        assert_eq!(
            cache_state(&engine, get.code_block_id()).name(),
            "monomorphic",
            "{label}"
        );

        engine.set(proto, "x", Value::Int32(8)).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.watchpoints_fired, 1, "{label}");
        assert_eq!(stats.invalidated_entries, 1, "{label}");
        assert_eq!(
            cache_state(&engine, get.code_block_id()).name(),
            "uninitialized",
            "{label}"
        );

        let v = engine.execute(&get, Value::Undefined, &[o]).unwrap();
        assert_eq!(v, Value::Int32(8), "{label}");
    }
}

#[test]
fn test_shadowing_property_wins_over_the_prototype() {
    for (label, mut engine) in engines() {
        let get = engine.install(get_x()).unwrap();
        let proto = object_with(&mut engine, &["x"]);
        engine.set(proto, "x", Value::Int32(1)).unwrap();
        let o = engine.new_object().unwrap();
        engine.set_prototype(o, proto).unwrap();
        assert_eq!(
            engine.execute(&get, Value::Undefined, &[o]).unwrap(),
            Value::Int32(1),
            "{label}"
        );

        engine.set(o, "x", Value::Int32(2)).unwrap();
        assert_eq!(
            engine.execute(&get, Value::Undefined, &[o]).unwrap(),
            Value::Int32(2),
            "{label}"
        );
    }
}

#[test]
fn test_prototype_cycles_are_rejected() {
    let mut engine = Engine::new(EngineConfig::default());
    let a = engine.new_object().unwrap();
    let b = engine.new_object().unwrap();
    engine.set_prototype(a, b).unwrap();
    assert!(engine.set_prototype(b, a).is_err());
    assert!(engine.set_prototype(a, a).is_err());
    assert!(engine.set_prototype(a, Value::Int32(1)).is_err());
    engine.set_prototype(a, Value::Null).unwrap();
}

// ============================================================================
// Compiled code
// ============================================================================

#[test]
fn test_compiled_site_patches_inline_and_routines() {
    for encoding in Encoding::ALL {
        let mut engine = Engine::new(
            EngineConfig::default()
                .with_encoding(encoding)
                .with_jit_threshold(0),
        );
        if !engine.jit_enabled() {
            continue;
        }
        let get = engine.install(get_x()).unwrap();
        let a = object_with(&mut engine, &["x"]);
        let b = object_with(&mut engine, &["y", "x"]);

        for _ in 0..5 {
            assert_eq!(
                engine.execute(&get, Value::Undefined, &[a]).unwrap(),
                Value::Int32(0)
            );
        }
        let code = engine.code_block(get.code_block_id()).unwrap();
        let compiled = code.compiled().expect("compiled on first entry");
        let inline = compiled.patch.property_site(0).inline_entry();
        assert_eq!(inline.map(|(structure, _)| structure), engine.structure_of(a));

        for _ in 0..5 {
            assert_eq!(
                engine.execute(&get, Value::Undefined, &[b]).unwrap(),
                Value::Int32(1)
            );
            assert_eq!(
                engine.execute(&get, Value::Undefined, &[a]).unwrap(),
                Value::Int32(0)
            );
        }
        let code = engine.code_block(get.code_block_id()).unwrap();
        let compiled = code.compiled().expect("still compiled");
        assert!(compiled.patch.property_site(0).inline_entry().is_none());
        assert_eq!(
            cache_state(&engine, get.code_block_id()).name(),
            "polymorphic"
        );
        let stats = engine.jit_stats().expect("jit stats");
        assert!(stats.stub_routines >= 1);
        assert_eq!(stats.slow_path_count(SlowPathReason::ShapeMismatch), 1);
    }
}

// ============================================================================
// Call links
// ============================================================================

fn constant(name: &str, n: i32) -> CodeBlock {
    let mut b = CodeBlockBuilder::new(name);
    let v = b.int(n);
    b.emit_ret(v);
    b.build().unwrap()
}

/// `function callIt(f) { return f() }`
fn call_it() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("callIt").parameters(1);
    let result = b.new_register();
    let undef = b.undefined();
    let frame = b.call_frame(1);
    b.emit_mov(frame.this(), undef);
    b.emit_call(result, b.param(0), &frame);
    b.emit_ret(result);
    b.build().unwrap()
}

#[test]
fn test_call_link_states() {
    for (label, mut engine) in engines() {
        let call = engine.install(call_it()).unwrap();
        let callees: Vec<_> = (0..6)
            .map(|i| engine.install(constant(&format!("c{i}"), i)).unwrap())
            .collect();
        let link_state = |engine: &Engine| {
            engine
                .code_block(call.code_block_id())
                .unwrap()
                .code
                .call_link(0)
                .borrow()
                .state
                .name()
        };

        for _ in 0..3 {
            let v = engine
                .execute(&call, Value::Undefined, &[callees[0].value()])
                .unwrap();
            assert_eq!(v, Value::Int32(0), "{label}");
        }
        assert_eq!(link_state(&engine), "monomorphic", "{label}");
        if engine.jit_enabled() {
            let code = engine.code_block(call.code_block_id()).unwrap();
            let compiled = code.compiled().expect("compiled");
            assert!(compiled.patch.is_linked(0), "{label}");
        }

        let v = engine
            .execute(&call, Value::Undefined, &[callees[1].value()])
            .unwrap();
        assert_eq!(v, Value::Int32(1), "{label}");
        assert_eq!(link_state(&engine), "polymorphic", "{label}");
        if engine.jit_enabled() {
            let code = engine.code_block(call.code_block_id()).unwrap();
            let compiled = code.compiled().expect("compiled");
            assert!(!compiled.patch.is_linked(0), "{label}");
        }

        for (i, callee) in callees.iter().enumerate() {
            let v = engine
                .execute(&call, Value::Undefined, &[callee.value()])
                .unwrap();
            assert_eq!(v, Value::Int32(i as i32), "{label}");
        }
        assert_eq!(link_state(&engine), "generic", "{label}");
    }
}

#[test]
fn test_linked_call_misses_on_a_different_callee() {
    for encoding in Encoding::ALL {
        let mut engine = Engine::new(
            EngineConfig::default()
                .with_encoding(encoding)
                .with_jit_threshold(0),
        );
        if !engine.jit_enabled() {
            continue;
        }
        let call = engine.install(call_it()).unwrap();
        let one = engine.install(constant("one", 1)).unwrap();
        let two = engine.install(constant("two", 2)).unwrap();
        engine
            .execute(&call, Value::Undefined, &[one.value()])
            .unwrap();
        engine
            .execute(&call, Value::Undefined, &[one.value()])
            .unwrap();
        let v = engine
            .execute(&call, Value::Undefined, &[two.value()])
            .unwrap();
        assert_eq!(v, Value::Int32(2));
        let stats = engine.jit_stats().expect("jit stats");
        assert_eq!(stats.slow_path_count(SlowPathReason::CallLinkMiss), 1);
    }
}
