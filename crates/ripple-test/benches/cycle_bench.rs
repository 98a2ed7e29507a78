//! Benchmarks for full convergence cycles

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ripple_core::{ClassId, MutableId, Property, PropertyId, Value};
use ripple_runtime::Priority;
use ripple_test::{FuzzerConfig, Scenario, StateFuzzer};

const NODE: ClassId = ClassId(1);

/// A chain of nodes, each copying its predecessor's value plus one
fn chain(len: usize) -> (Scenario, PropertyId, Vec<MutableId>) {
    let mut builder = Scenario::builder();
    let value = builder.property(Property::observed("value", Value::Int(0)));
    let prev = builder.property(Property::setable("prev", Value::Empty));
    let mut scenario = builder.build();

    let follow = scenario.observer("follow", Priority::Forward, move |ctx| {
        let me = ctx.mutable();
        if let Some(p) = ctx.get(me, prev).as_mutable() {
            let v = ctx.get(p, value).as_int().unwrap_or(0);
            ctx.set(me, value, Value::Int(v + 1))?;
        }
        Ok(())
    });
    let _ = scenario.class(NODE, vec![follow], vec![]);

    let mut nodes = Vec::with_capacity(len);
    let children = scenario.children();
    let _ = scenario.put(|action| {
        let mut last: Option<MutableId> = None;
        for _ in 0..len {
            let node = action.create(NODE);
            if let Some(p) = last {
                action.set(node, prev, p.into())?;
            }
            action.add(MutableId::UNIVERSE, children, node.into())?;
            nodes.push(node);
            last = Some(node);
        }
        Ok(())
    });
    (scenario, value, nodes)
}

fn bench_chain_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");
    for len in [10usize, 100] {
        let (mut scenario, value, nodes) = chain(len);
        let head = nodes[0];
        let mut n = 0i64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                n += 1;
                black_box(scenario.put(|action| action.set(head, value, Value::Int(n))))
            })
        });
    }
    group.finish();
}

fn bench_fuzz_light(c: &mut Criterion) {
    c.bench_function("state_fuzzer_light", |b| {
        b.iter(|| {
            let result = StateFuzzer::new(FuzzerConfig::light()).and_then(|mut f| f.run());
            black_box(result.map(|r| r.runs))
        })
    });
}

criterion_group!(benches, bench_chain_propagation, bench_fuzz_light);
criterion_main!(benches);
