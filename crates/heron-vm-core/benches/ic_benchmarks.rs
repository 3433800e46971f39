//! Inline Cache Benchmarks
//!
//! Compares named property loads at monomorphic and polymorphic sites,
//! interpreted and baseline-compiled.

use criterion::{Criterion, criterion_group, criterion_main};
use heron_vm_bytecode::{CodeBlock, CodeBlockBuilder};
use heron_vm_core::{Engine, EngineConfig, Value};
use std::hint::black_box;

/// `function(o) { return o.x; }`
fn get_x() -> CodeBlock {
    let mut b = CodeBlockBuilder::new("getX").parameters(1);
    let dst = b.new_register();
    let base = b.param(0);
    b.emit_get_by_id(dst, base, "x");
    b.emit_ret(dst);
    b.build().expect("getX builds")
}

/// Objects whose `x` lives behind `shapes` distinct structures
fn receivers(engine: &mut Engine, shapes: usize) -> Vec<Value> {
    (0..shapes)
        .map(|shape| {
            let obj = engine.new_object().expect("allocate");
            for pad in 0..shape {
                engine
                    .set(obj, &format!("pad{pad}"), Value::Int32(pad as i32))
                    .expect("set pad");
            }
            engine.set(obj, "x", Value::Int32(1)).expect("set x");
            obj
        })
        .collect()
}

fn bench_get_by_id(c: &mut Criterion, label: &str, config: EngineConfig, shapes: usize) {
    let mut engine = Engine::new(config);
    let f = engine.install(get_x()).expect("install");
    let objects = receivers(&mut engine, shapes);

    c.bench_function(label, |b| {
        b.iter(|| {
            let mut sum = 0i32;
            for obj in &objects {
                if let Ok(Value::Int32(v)) = engine.execute(&f, Value::Undefined, &[*obj]) {
                    sum += v;
                }
            }
            black_box(sum)
        });
    });
}

/// Benchmark: single-structure site
fn bench_monomorphic(c: &mut Criterion) {
    bench_get_by_id(
        c,
        "get_by_id_monomorphic_interpreter",
        EngineConfig::default().with_jit(false),
        1,
    );
    bench_get_by_id(
        c,
        "get_by_id_monomorphic_baseline",
        EngineConfig::default().with_jit_threshold(0),
        1,
    );
}

/// Benchmark: site within the polymorphic limit
fn bench_polymorphic(c: &mut Criterion) {
    bench_get_by_id(
        c,
        "get_by_id_polymorphic_interpreter",
        EngineConfig::default().with_jit(false),
        4,
    );
    bench_get_by_id(
        c,
        "get_by_id_polymorphic_baseline",
        EngineConfig::default().with_jit_threshold(0),
        4,
    );
}

/// Benchmark: site past the polymorphic limit
fn bench_megamorphic(c: &mut Criterion) {
    bench_get_by_id(
        c,
        "get_by_id_generic_interpreter",
        EngineConfig::default().with_jit(false),
        12,
    );
    bench_get_by_id(
        c,
        "get_by_id_generic_baseline",
        EngineConfig::default().with_jit_threshold(0),
        12,
    );
}

criterion_group!(
    benches,
    bench_monomorphic,
    bench_polymorphic,
    bench_megamorphic
);
criterion_main!(benches);
