// Property-based tests for analysis invariants.
//
// Three categories:
// 1. Elementwise loops: exact analysis agrees with the heuristic for any
//    shape and tiling, including partial last blocks
// 2. Minor-dimension transposes: both strategies reject them
// 3. Determinism: two runs over the same text produce identical reports
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use coalesce::{AnalysisOptions, CoalescingAnalysis, CoalescingReport, FusionKind, HloModule, LoopTiling, SymbolicContext};
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

fn arb_dims() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..=48, 1..=3)
}

fn arb_tiling() -> impl Strategy<Value = LoopTiling> {
    (prop_oneof![Just(32i64), Just(64), Just(128), Just(256)], 1i64..=4)
        .prop_map(|(threads, unroll)| LoopTiling::new(threads, unroll))
}

fn shape(dims: &[i64]) -> String {
    let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("f32[{}]", dims.join(","))
}

fn elementwise_module(dims: &[i64]) -> String {
    let s = shape(dims);
    format!(
        "ENTRY e {{\n  a = {s} parameter(0)\n  b = {s} parameter(1)\n  n = {s} negate(a)\n  ROOT m = {s} multiply(n, b)\n}}\n"
    )
}

fn transpose_module(rows: i64, cols: i64) -> String {
    format!(
        "ENTRY e {{\n  a = f32[{rows},{cols}] parameter(0)\n  ROOT t = f32[{cols},{rows}] transpose(a), dimensions={{1,0}}\n}}\n"
    )
}

fn analyze(text: &str, root: &str, tiling: &LoopTiling, exact: bool) -> (HloModule, CoalescingAnalysis) {
    let module = HloModule::parse(text).unwrap();
    let ctx = SymbolicContext::new();
    let options = if exact {
        AnalysisOptions::exact(tiling, &ctx)
    } else {
        AnalysisOptions::heuristic()
    };
    let root = module.find_instruction(root).unwrap();
    let analysis = CoalescingAnalysis::new(&module, root, FusionKind::Loop, &options);
    (module, analysis)
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn elementwise_exact_matches_heuristic(dims in arb_dims(), tiling in arb_tiling()) {
        let text = elementwise_module(&dims);
        let (_, exact) = analyze(&text, "m", &tiling, true);
        let (_, heuristic) = analyze(&text, "m", &tiling, false);
        prop_assert!(!exact.is_computed_by_heuristic());
        for &op in exact.read_operands() {
            prop_assert!(exact.is_read_coalesced(op));
            prop_assert_eq!(exact.is_read_coalesced(op), heuristic.is_read_coalesced(op));
        }
    }

    #[test]
    fn minor_transpose_is_never_coalesced(rows in 4i64..=40, cols in 33i64..=64, tiling in arb_tiling()) {
        // Neighboring output elements read `cols` apart, wider than a warp.
        let text = transpose_module(rows, cols);
        let (module, exact) = analyze(&text, "t", &tiling, true);
        let (_, heuristic) = analyze(&text, "t", &tiling, false);
        let a = module.find_instruction("a").unwrap();
        prop_assert!(!exact.is_read_coalesced(a));
        prop_assert!(!heuristic.is_read_coalesced(a));
    }

    #[test]
    fn reports_are_deterministic(dims in arb_dims(), tiling in arb_tiling(), exact in any::<bool>()) {
        let text = elementwise_module(&dims);
        let (m1, first) = analyze(&text, "m", &tiling, exact);
        let (m2, second) = analyze(&text, "m", &tiling, exact);
        prop_assert_eq!(CoalescingReport::new(&m1, &first), CoalescingReport::new(&m2, &second));
    }
}
