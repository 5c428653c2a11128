// Snapshot tests: lock the textual form of thread maps and reports.
//
// Uses the library API and snapshots Display / text output inline with
// `insta`. Run `cargo insta review` after intentional output changes.

use coalesce::fusion::FusionAdaptor;
use coalesce::hlo::{ArrayShape, PrimitiveType};
use coalesce::{
    AnalysisOptions, CoalescingAnalysis, CoalescingReport, FusionKind, HloModule, KernelLayout, LoopTiling,
    ReductionTiling, SymbolicContext,
};

#[test]
fn loop_tiling_thread_map() {
    let ctx = SymbolicContext::new();
    let shape = ArrayShape::new(PrimitiveType::F32, vec![32, 64]);
    let map = LoopTiling::default().thread_to_shape(&shape, &ctx).unwrap();
    insta::assert_snapshot!(map.to_string(), @r"
    (d0, d1, d2, d3, d4, d5)[s0] -> (d3 * 2 + d0 floordiv 64, d0 mod 64)
    domain:
    d0 in [0, 127]
    d1 in [0, 0]
    d2 in [0, 0]
    d3 in [0, 15]
    d4 in [0, 0]
    d5 in [0, 0]
    s0 in [0, 0]
    ");
}

#[test]
fn row_reduction_hero_map() {
    let m = HloModule::parse(
        r#"
        add {
          a = f32[] parameter(0)
          b = f32[] parameter(1)
          ROOT s = f32[] add(a, b)
        }
        ENTRY e {
          rows = f32[8,256]{1,0} parameter(0)
          zero = f32[] constant(0)
          ROOT row = f32[8] reduce(rows, zero), dimensions={1}, to_apply=add
        }
        "#,
    )
    .unwrap();
    let ctx = SymbolicContext::new();
    let fusion = FusionAdaptor::for_instruction(&m, m.find_instruction("row").unwrap());
    let map = ReductionTiling::default()
        .thread_to_hero_input(&fusion, 0, 0, &ctx)
        .unwrap();
    insta::assert_snapshot!(map.to_string(), @r"
    (d0, d1, d2, d3, d4, d5)[s0] -> (d3, d0 + s0 * 128)
    domain:
    d0 in [0, 127]
    d1 in [0, 0]
    d2 in [0, 0]
    d3 in [0, 7]
    d4 in [0, 0]
    d5 in [0, 0]
    s0 in [0, 1]
    ");
}

#[test]
fn text_report() {
    let m = HloModule::parse(
        r#"
        HloModule transposes
        ENTRY e {
          a = f32[64,32] parameter(0)
          bb = f32[32,64] parameter(1)
          t = f32[32,64] transpose(a), dimensions={1,0}
          ROOT s = f32[32,64] add(t, bb)
        }
        "#,
    )
    .unwrap();
    let ctx = SymbolicContext::new();
    let layout = LoopTiling::default();
    let analysis = CoalescingAnalysis::for_producer_consumer(
        &m,
        m.find_instruction("t").unwrap(),
        m.find_instruction("s").unwrap(),
        FusionKind::Loop,
        &AnalysisOptions::exact(&layout, &ctx),
    );
    let report = CoalescingReport::new(&m, &analysis);
    let text = report.to_text().replace(&report.fingerprint, "<fingerprint>");
    insta::assert_snapshot!(text.trim_end(), @r"
    fusion: s <- t
    kind: loop  mode: exact  fingerprint: <fingerprint>
      a   f32[64,32]{1,0}  not coalesced
      bb  f32[32,64]{1,0}  coalesced
    ");
}
