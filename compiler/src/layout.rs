// layout.rs — Kernel thread/block tilings
//
// A `KernelLayout` tells index derivation which output element (or which
// element of a hero's input) every GPU thread touches. The analyzer only
// asks; it never chooses a tiling. `None` means the layout declines and the
// caller falls back to the structural heuristic.

use crate::fusion::{FusedInput, FusionAdaptor};
use crate::hlo::{ArrayShape, Instruction, Opcode};
use crate::indexing::{dim, sym, AffineExpr, IndexingMap, Interval, Symbol, BLOCK_X, NUM_LAUNCH_DIMS, THREAD_X};
use crate::symbolic::{delinearize, SymbolicContext};

pub trait KernelLayout {
    /// Thread → logical output index of the `root_index`-th fusion root.
    fn thread_to_output(
        &self,
        fusion: &FusionAdaptor<'_>,
        root_index: usize,
        ctx: &SymbolicContext,
    ) -> Option<IndexingMap>;

    /// Thread → logical index into input `operand_index` of the root, for
    /// emitters that tile a hero's inputs directly instead of its output.
    fn thread_to_hero_input(
        &self,
        _fusion: &FusionAdaptor<'_>,
        _root_index: usize,
        _operand_index: usize,
        _ctx: &SymbolicContext,
    ) -> Option<IndexingMap> {
        None
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Launch domain with `threads` along thread.x and `blocks` along block.x.
fn launch_domain(threads: i64, blocks: i64) -> Vec<Interval> {
    let mut dims = vec![Interval::point(0); NUM_LAUNCH_DIMS];
    dims[THREAD_X] = Interval::upto(threads);
    dims[BLOCK_X] = Interval::upto(blocks);
    dims
}

fn root_instr<'m>(fusion: &FusionAdaptor<'m>, root_index: usize) -> Option<&'m Instruction> {
    fusion
        .roots()
        .get(root_index)
        .map(|&root| fusion.input_instr(root))
}

// ── Loop tiling ─────────────────────────────────────────────────────────────

/// Elementwise loop emitter: one linear thread id per output element, walked
/// in physical order, `unroll_factor` grid-strided iterations per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiling {
    pub threads_per_block: i64,
    pub unroll_factor: i64,
}

impl Default for LoopTiling {
    fn default() -> Self {
        LoopTiling {
            threads_per_block: 128,
            unroll_factor: 1,
        }
    }
}

impl LoopTiling {
    pub fn new(threads_per_block: i64, unroll_factor: i64) -> Self {
        LoopTiling {
            threads_per_block,
            unroll_factor,
        }
    }

    /// `(threads per block, blocks)` for `num_elements` outputs.
    pub fn launch_dims(&self, num_elements: i64) -> (i64, i64) {
        let threads = self
            .threads_per_block
            .min(ceil_div(num_elements, self.unroll_factor))
            .max(1);
        let blocks = ceil_div(num_elements, threads * self.unroll_factor).max(1);
        (threads, blocks)
    }

    pub fn thread_to_shape(&self, shape: &ArrayShape, ctx: &SymbolicContext) -> Option<IndexingMap> {
        let n = shape.num_elements();
        if n <= 0 || self.threads_per_block <= 0 || self.unroll_factor <= 0 {
            return None;
        }
        let (threads, blocks) = self.launch_dims(n);
        let linear = sym(0) * (blocks * threads) + dim(BLOCK_X) * threads + dim(THREAD_X);
        let results = delinearize(&linear, &shape.dims, &shape.minor_to_major);
        let mut map = IndexingMap::new(
            launch_domain(threads, blocks),
            vec![Symbol::range(Interval::upto(self.unroll_factor))],
            results,
        );
        if blocks * threads * self.unroll_factor > n {
            map = map.with_constraint(linear, Interval::upto(n));
        }
        Some(ctx.simplify(&map))
    }
}

impl KernelLayout for LoopTiling {
    fn thread_to_output(
        &self,
        fusion: &FusionAdaptor<'_>,
        root_index: usize,
        ctx: &SymbolicContext,
    ) -> Option<IndexingMap> {
        let shape = root_instr(fusion, root_index)?.array_shape()?;
        self.thread_to_shape(shape, ctx)
    }
}

// ── Reduction tiling ────────────────────────────────────────────────────────

/// Reduction emitter. Row reductions put a block on each kept element and
/// let its threads stride over the reduced elements; column reductions put
/// threads on consecutive kept elements and loop over the reduced ones.
/// Roots that are not reductions use loop tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionTiling {
    pub threads_per_block: i64,
}

impl Default for ReductionTiling {
    fn default() -> Self {
        ReductionTiling {
            threads_per_block: 128,
        }
    }
}

/// How a reduction's input dimensions split between threads, blocks and the
/// per-thread loop.
struct ReductionPlan {
    domain: Vec<Interval>,
    symbols: Vec<Symbol>,
    reduced_linear: AffineExpr,
    kept_linear: AffineExpr,
    constraints: Vec<(AffineExpr, Interval)>,
}

pub fn is_row_reduction(input: &ArrayShape, reduced_dims: &[usize]) -> bool {
    input
        .minor_most_non_degenerate_dim()
        .map_or(true, |d| reduced_dims.contains(&d))
}

impl ReductionTiling {
    pub fn new(threads_per_block: i64) -> Self {
        ReductionTiling { threads_per_block }
    }

    fn plan(&self, input: &ArrayShape, reduced_dims: &[usize]) -> Option<ReductionPlan> {
        let tpb = self.threads_per_block;
        let reduced_size: i64 = reduced_dims.iter().map(|&d| input.dims[d]).product();
        let kept_size = input.num_elements() / reduced_size.max(1);
        if tpb <= 0 || reduced_size <= 0 || kept_size <= 0 {
            return None;
        }
        let mut constraints = Vec::new();
        if is_row_reduction(input, reduced_dims) {
            let threads = tpb.min(reduced_size);
            let chunks = ceil_div(reduced_size, threads);
            let reduced_linear = sym(0) * threads + dim(THREAD_X);
            if chunks * threads > reduced_size {
                constraints.push((reduced_linear.clone(), Interval::upto(reduced_size)));
            }
            Some(ReductionPlan {
                domain: launch_domain(threads, kept_size),
                symbols: vec![Symbol::range(Interval::upto(chunks))],
                reduced_linear,
                kept_linear: dim(BLOCK_X),
                constraints,
            })
        } else {
            let threads = tpb.min(kept_size);
            let blocks = ceil_div(kept_size, threads);
            let kept_linear = dim(BLOCK_X) * threads + dim(THREAD_X);
            if blocks * threads > kept_size {
                constraints.push((kept_linear.clone(), Interval::upto(kept_size)));
            }
            Some(ReductionPlan {
                domain: launch_domain(threads, blocks),
                symbols: vec![Symbol::range(Interval::upto(reduced_size))],
                reduced_linear: sym(0),
                kept_linear,
                constraints,
            })
        }
    }

    /// Input index of every thread, per input dimension.
    fn input_indices(plan: &ReductionPlan, input: &ArrayShape, reduced_dims: &[usize]) -> Vec<AffineExpr> {
        let order = |reduced: bool| -> Vec<usize> {
            input
                .minor_to_major
                .iter()
                .copied()
                .filter(|d| reduced_dims.contains(d) == reduced)
                .collect()
        };
        let reduced = delinearize(&plan.reduced_linear, &input.dims, &order(true));
        let kept = delinearize(&plan.kept_linear, &input.dims, &order(false));
        (0..input.rank())
            .map(|d| {
                if reduced_dims.contains(&d) {
                    reduced[d].clone()
                } else {
                    kept[d].clone()
                }
            })
            .collect()
    }

    fn finish(plan: &ReductionPlan, results: Vec<AffineExpr>, ctx: &SymbolicContext) -> IndexingMap {
        let mut map = IndexingMap::new(plan.domain.clone(), plan.symbols.clone(), results);
        map.constraints = plan.constraints.clone();
        ctx.simplify(&map)
    }
}

fn reduce_root<'m>(fusion: &FusionAdaptor<'m>, root_index: usize) -> Option<(&'m Instruction, &'m ArrayShape)> {
    let root = *fusion.roots().get(root_index)?;
    let FusedInput::Node(node) = root else {
        return None;
    };
    let reduce = fusion.instr(node);
    if reduce.opcode != Opcode::Reduce {
        return None;
    }
    let input = fusion.input_instr(*fusion.node(node).inputs.first()?).array_shape()?;
    Some((reduce, input))
}

impl KernelLayout for ReductionTiling {
    fn thread_to_output(
        &self,
        fusion: &FusionAdaptor<'_>,
        root_index: usize,
        ctx: &SymbolicContext,
    ) -> Option<IndexingMap> {
        let Some((reduce, input)) = reduce_root(fusion, root_index) else {
            return LoopTiling::new(self.threads_per_block, 1).thread_to_output(fusion, root_index, ctx);
        };
        let plan = self.plan(input, &reduce.dimensions)?;
        let indices = Self::input_indices(&plan, input, &reduce.dimensions);
        // Output dimensions are the kept input dimensions in order.
        let results = indices
            .into_iter()
            .enumerate()
            .filter(|(d, _)| !reduce.dimensions.contains(d))
            .map(|(_, e)| e)
            .collect();
        Some(Self::finish(&plan, results, ctx))
    }

    fn thread_to_hero_input(
        &self,
        fusion: &FusionAdaptor<'_>,
        root_index: usize,
        operand_index: usize,
        ctx: &SymbolicContext,
    ) -> Option<IndexingMap> {
        let (reduce, input) = reduce_root(fusion, root_index)?;
        let plan = self.plan(input, &reduce.dimensions)?;
        let num_inputs = reduce.operands.len() / 2;
        if operand_index >= reduce.operands.len() {
            return None;
        }
        if operand_index >= num_inputs {
            // Init values are scalars read once per output.
            let mut map = IndexingMap::empty_results(plan.domain.clone());
            map.symbols = plan.symbols.clone();
            return Some(map);
        }
        let indices = Self::input_indices(&plan, input, &reduce.dimensions);
        Some(Self::finish(&plan, indices, ctx))
    }
}
