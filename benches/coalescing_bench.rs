use coalesce::*;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

// Latency scenarios: heuristic vs exact analysis of the same fusions.

const ELEMENTWISE: &str = r#"
HloModule elementwise
ENTRY e {
  a = f32[512,1024] parameter(0)
  b = f32[512,1024] parameter(1)
  n = f32[512,1024] negate(a)
  ROOT s = f32[512,1024] add(n, b)
}
"#;

const TRANSPOSE: &str = r#"
HloModule transpose
body {
  p0 = f32[1024,512]{1,0} parameter(0)
  p1 = f32[512,1024]{1,0} parameter(1)
  t = f32[512,1024]{1,0} transpose(p0), dimensions={1,0}
  ROOT m = f32[512,1024]{1,0} multiply(t, p1)
}
ENTRY e {
  a = f32[1024,512]{1,0} parameter(0)
  b = f32[512,1024]{1,0} parameter(1)
  ROOT f = f32[512,1024]{1,0} fusion(a, b), kind=kLoop, calls=body
}
"#;

const REDUCTION: &str = r#"
HloModule reduction
add {
  x = f32[] parameter(0)
  y = f32[] parameter(1)
  ROOT s = f32[] add(x, y)
}
ENTRY e {
  a = f32[256,4096] parameter(0)
  z = f32[] constant(0)
  ROOT r = f32[256] reduce(a, z), dimensions={1}, to_apply=add
}
"#;

fn scenarios() -> [(&'static str, &'static str, FusionKind); 3] {
    [
        ("elementwise", ELEMENTWISE, FusionKind::Loop),
        ("transpose", TRANSPOSE, FusionKind::Loop),
        ("reduction", REDUCTION, FusionKind::Reduction),
    ]
}

/// Chain of `n` unary ops over one parameter, analyzed as a single fusion.
fn generate_chain(n: usize) -> String {
    let mut text = String::from("HloModule chain\nbody {\n  p0 = f32[4096] parameter(0)\n");
    let mut prev = "p0".to_string();
    for i in 0..n {
        let op = if i % 2 == 0 { "negate" } else { "abs" };
        text.push_str(&format!("  v{} = f32[4096] {}({})\n", i, op, prev));
        prev = format!("v{}", i);
    }
    text.push_str(&format!("  ROOT out = f32[4096] exponential({})\n}}\n", prev));
    text.push_str("ENTRY e {\n  a = f32[4096] parameter(0)\n  ROOT f = f32[4096] fusion(a), kind=kLoop, calls=body\n}\n");
    text
}

fn parse(text: &str) -> HloModule {
    HloModule::parse(text).expect("benchmark scenario must parse")
}

fn bench_heuristic(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency/heuristic");
    for (name, text, kind) in scenarios() {
        let module = parse(text);
        let root = module.entry().root;
        group.bench_with_input(BenchmarkId::from_parameter(name), &module, |b, module| {
            b.iter(|| {
                let analysis = CoalescingAnalysis::new(module, black_box(root), kind, &AnalysisOptions::heuristic());
                black_box(analysis);
            });
        });
    }
    group.finish();
}

fn bench_exact(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency/exact");
    for (name, text, kind) in scenarios() {
        let module = parse(text);
        let root = module.entry().root;
        let layout: Box<dyn KernelLayout> = match kind {
            FusionKind::Reduction => Box::new(ReductionTiling::default()),
            _ => Box::new(LoopTiling::default()),
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &module, |b, module| {
            b.iter_batched(
                SymbolicContext::new,
                |ctx| {
                    let options = AnalysisOptions::exact(layout.as_ref(), &ctx);
                    let analysis = CoalescingAnalysis::new(module, black_box(root), kind, &options);
                    black_box(analysis);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency/parse");
    for (name, text, _) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), text, |b, text| {
            b.iter(|| black_box(HloModule::parse(black_box(text)).is_ok()));
        });
    }
    group.finish();
}

// Exact analysis scaling vs fused chain length.
fn bench_chain_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaling/chain");
    let layout = LoopTiling::default();
    for n in [1_usize, 8, 32, 128] {
        let module = parse(&generate_chain(n));
        let root = module.entry().root;
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}ops", n)), &module, |b, module| {
            b.iter(|| {
                let ctx = SymbolicContext::new();
                let analysis = CoalescingAnalysis::new(
                    module,
                    root,
                    FusionKind::Loop,
                    &AnalysisOptions::exact(&layout, &ctx),
                );
                black_box(analysis.is_read_coalesced(analysis.read_operands()[0]))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_heuristic, bench_exact, bench_parse, bench_chain_scaling);
criterion_main!(benches);
