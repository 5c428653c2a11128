// derive.rs — Thread-to-memory index derivation
//
// For every read operand of a fusion, derives the maps from GPU thread
// coordinates to the physical element offset the thread reads. Starts from
// the kernel layout's thread → output (or thread → hero input) maps and
// pushes them through each fused node's output → operand indexing until an
// outer operand is reached.
//
// Preconditions: `fusion` views a module built by `hlo::build_module`.
// Postconditions: every read operand has an entry: the distinct single-result
//                 offset maps that reach it, or the reason derivation failed.
// Failure modes: an unsupported opcode, a declining layout or a non-array
//                operand declines the operands reachable from that point.
// Side effects: increments the symbolic context's counters.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::NotAnalyzable;
use crate::fusion::{FusedInput, FusionAdaptor};
use crate::hlo::{ArrayShape, Instruction, Opcode};
use crate::id::InstrId;
use crate::indexing::{dim, sym, AffineExpr, IndexingMap, Interval, Symbol};
use crate::layout::KernelLayout;
use crate::symbolic::{delinearize, linear_offset, row_major_strides, SymbolicContext};

pub type OperandMaps = Result<Vec<IndexingMap>, NotAnalyzable>;

/// Derived thread → offset maps per read operand.
#[derive(Debug, Clone, Default)]
pub struct OperandIndexing {
    entries: HashMap<InstrId, OperandMaps>,
}

impl OperandIndexing {
    pub fn get(&self, operand: InstrId) -> Option<&OperandMaps> {
        self.entries.get(&operand)
    }

    fn add_map(&mut self, operand: InstrId, map: IndexingMap) {
        if let Ok(maps) = self.entries.entry(operand).or_insert_with(|| Ok(Vec::new())) {
            if !maps.contains(&map) {
                maps.push(map);
            }
        }
    }

    /// Record a failure; the first reason for an operand wins.
    fn decline(&mut self, operand: InstrId, reason: &NotAnalyzable) {
        let entry = self.entries.entry(operand).or_insert_with(|| Ok(Vec::new()));
        if entry.is_ok() {
            debug!(operand = %operand, %reason, "index derivation declined");
            *entry = Err(reason.clone());
        }
    }
}

/// Derive offset maps for every read operand of `fusion`.
pub fn derive_operand_indexing(
    fusion: &FusionAdaptor<'_>,
    layout: &dyn KernelLayout,
    ctx: &SymbolicContext,
) -> OperandIndexing {
    let mut indexing = OperandIndexing::default();
    for &operand in fusion.read_operands() {
        indexing.entries.insert(operand, Ok(Vec::new()));
    }
    let mut walker = Walker {
        fusion,
        ctx,
        indexing,
        seen: HashSet::new(),
    };

    for (root_index, &root) in fusion.roots().iter().enumerate() {
        if let Some(hero_inputs) = hero_input_maps(fusion, layout, root, root_index, ctx) {
            for (input, map) in hero_inputs {
                match map {
                    Some(map) => walker.propagate(input, map),
                    None => walker.decline_reachable(input, &NotAnalyzable::LayoutDeclined { root_index }),
                }
            }
            continue;
        }
        match layout.thread_to_output(fusion, root_index, ctx) {
            Some(map) => walker.propagate(root, map),
            None => walker.decline_reachable(root, &NotAnalyzable::LayoutDeclined { root_index }),
        }
    }
    walker.indexing
}

/// Thread maps for each input of a reduction root, when the layout tiles the
/// reduction's inputs directly.
fn hero_input_maps(
    fusion: &FusionAdaptor<'_>,
    layout: &dyn KernelLayout,
    root: FusedInput,
    root_index: usize,
    ctx: &SymbolicContext,
) -> Option<Vec<(FusedInput, Option<IndexingMap>)>> {
    let FusedInput::Node(node) = root else {
        return None;
    };
    if fusion.instr(node).opcode != Opcode::Reduce {
        return None;
    }
    let inputs = &fusion.node(node).inputs;
    let first = layout.thread_to_hero_input(fusion, root_index, 0, ctx)?;
    let mut maps = vec![(*inputs.first()?, Some(first))];
    for (k, &input) in inputs.iter().enumerate().skip(1) {
        maps.push((input, layout.thread_to_hero_input(fusion, root_index, k, ctx)));
    }
    Some(maps)
}

struct Walker<'a, 'm> {
    fusion: &'a FusionAdaptor<'m>,
    ctx: &'a SymbolicContext,
    indexing: OperandIndexing,
    seen: HashSet<(FusedInput, IndexingMap)>,
}

impl Walker<'_, '_> {
    fn propagate(&mut self, start: FusedInput, map: IndexingMap) {
        let fusion = self.fusion;
        let mut stack = vec![(start, map)];
        while let Some((input, map)) = stack.pop() {
            if !self.seen.insert((input, map.clone())) {
                continue;
            }
            match input {
                FusedInput::Operand(operand) => self.reach_operand(operand, &map),
                FusedInput::Node(node) => {
                    let instr = fusion.instr(node);
                    let inputs = &fusion.node(node).inputs;
                    let operand_maps = match self.operand_maps(instr, inputs) {
                        Ok(maps) => maps,
                        Err(reason) => {
                            self.decline_reachable(input, &reason);
                            continue;
                        }
                    };
                    for (&next, operand_map) in inputs.iter().zip(&operand_maps) {
                        match self.ctx.compose(&map, operand_map) {
                            Some(composed) => stack.push((next, composed)),
                            None => self.decline_reachable(
                                next,
                                &NotAnalyzable::RankMismatch {
                                    expected: operand_map.num_dims(),
                                    found: map.results.len(),
                                },
                            ),
                        }
                    }
                }
            }
        }
    }

    fn reach_operand(&mut self, operand: InstrId, map: &IndexingMap) {
        let Some(shape) = self.fusion.module().instr(operand).array_shape() else {
            self.indexing.decline(operand, &NotAnalyzable::NonArrayOperand);
            return;
        };
        match self.ctx.linearize(map, shape) {
            Some(linear) => self.indexing.add_map(operand, linear),
            None => self.indexing.decline(
                operand,
                &NotAnalyzable::RankMismatch {
                    expected: shape.rank(),
                    found: map.results.len(),
                },
            ),
        }
    }

    /// Decline every outer operand reachable from `input`.
    fn decline_reachable(&mut self, input: FusedInput, reason: &NotAnalyzable) {
        let mut stack = vec![input];
        let mut visited = HashSet::new();
        while let Some(input) = stack.pop() {
            if !visited.insert(input) {
                continue;
            }
            match input {
                FusedInput::Operand(operand) => self.indexing.decline(operand, reason),
                FusedInput::Node(node) => stack.extend(self.fusion.node(node).inputs.iter().copied()),
            }
        }
    }

    fn operand_maps(&self, instr: &Instruction, inputs: &[FusedInput]) -> Result<Vec<IndexingMap>, NotAnalyzable> {
        let out = instr.array_shape().ok_or(NotAnalyzable::UnsupportedOp(instr.opcode))?;
        let operand_shapes = inputs
            .iter()
            .map(|&input| self.fusion.input_instr(input).array_shape())
            .collect::<Option<Vec<&ArrayShape>>>()
            .ok_or(NotAnalyzable::NonArrayOperand)?;
        output_to_operand_maps(instr, out, &operand_shapes)
    }
}

/// Output index → operand index map of each operand of `instr`.
pub fn output_to_operand_maps(
    instr: &Instruction,
    out: &ArrayShape,
    operands: &[&ArrayShape],
) -> Result<Vec<IndexingMap>, NotAnalyzable> {
    let domain: Vec<Interval> = out.dims.iter().map(|&d| Interval::upto(d)).collect();
    let rank = out.rank();
    let with_results = |results: Vec<AffineExpr>| IndexingMap::new(domain.clone(), Vec::new(), results);
    let identity = || with_results((0..rank).map(dim).collect());

    let maps: Vec<IndexingMap> = match instr.opcode {
        op if op.is_elementwise() => operands
            .iter()
            .map(|shape| {
                if shape.rank() == rank {
                    identity()
                } else {
                    // Scalar predicate of `select`.
                    with_results(Vec::new())
                }
            })
            .collect(),
        Opcode::Copy => vec![identity()],
        Opcode::Broadcast => vec![with_results(instr.dimensions.iter().map(|&d| dim(d)).collect())],
        Opcode::Transpose => {
            let mut results = vec![AffineExpr::Constant(0); rank];
            for (out_dim, &in_dim) in instr.dimensions.iter().enumerate() {
                if let Some(slot) = results.get_mut(in_dim) {
                    *slot = dim(out_dim);
                }
            }
            vec![with_results(results)]
        }
        Opcode::Reshape => {
            let input = operands.first().ok_or(NotAnalyzable::UnsupportedOp(instr.opcode))?;
            let outputs: Vec<AffineExpr> = (0..rank).map(dim).collect();
            let linear = linear_offset(&outputs, &row_major_strides(&out.dims));
            let order: Vec<usize> = (0..input.rank()).rev().collect();
            vec![with_results(delinearize(&linear, &input.dims, &order))]
        }
        Opcode::Bitcast => {
            let input = operands.first().ok_or(NotAnalyzable::UnsupportedOp(instr.opcode))?;
            let outputs: Vec<AffineExpr> = (0..rank).map(dim).collect();
            let linear = linear_offset(&outputs, &out.physical_strides());
            vec![with_results(delinearize(&linear, &input.dims, &input.minor_to_major))]
        }
        Opcode::Slice => vec![with_results(
            instr
                .slice
                .iter()
                .enumerate()
                .map(|(d, s)| dim(d) * s.stride + s.start)
                .collect(),
        )],
        Opcode::Concatenate => {
            let axis = *instr.dimensions.first().ok_or(NotAnalyzable::UnsupportedOp(instr.opcode))?;
            let mut offset = 0;
            let mut maps = Vec::with_capacity(operands.len());
            for shape in operands {
                let size = shape.dims.get(axis).copied().unwrap_or(0);
                let results = (0..rank)
                    .map(|d| if d == axis { dim(d) - offset } else { dim(d) })
                    .collect();
                maps.push(
                    with_results(results).with_constraint(dim(axis), Interval::new(offset, offset + size - 1)),
                );
                offset += size;
            }
            maps
        }
        Opcode::Reduce => {
            let num_inputs = operands.len() / 2;
            let reduced = &instr.dimensions;
            let mut maps = Vec::with_capacity(operands.len());
            for (k, shape) in operands.iter().enumerate() {
                if k >= num_inputs {
                    maps.push(with_results(Vec::new()));
                    continue;
                }
                let symbols = reduced
                    .iter()
                    .map(|&d| Symbol::range(Interval::upto(shape.dims[d])))
                    .collect();
                let mut kept = 0;
                let results = (0..shape.rank())
                    .map(|d| match reduced.iter().position(|&r| r == d) {
                        Some(s) => sym(s),
                        None => {
                            kept += 1;
                            dim(kept - 1)
                        }
                    })
                    .collect();
                maps.push(IndexingMap::new(domain.clone(), symbols, results));
            }
            maps
        }
        Opcode::DynamicSlice => {
            let input = operands.first().ok_or(NotAnalyzable::UnsupportedOp(instr.opcode))?;
            // Start indices are clamped so the slice stays in bounds.
            let symbols = input
                .dims
                .iter()
                .zip(&out.dims)
                .map(|(&i, &o)| Symbol::runtime(Interval::new(0, i - o)))
                .collect();
            let results = (0..rank).map(|d| dim(d) + sym(d)).collect();
            let mut maps = vec![IndexingMap::new(domain.clone(), symbols, results)];
            maps.extend((1..operands.len()).map(|_| with_results(Vec::new())));
            maps
        }
        Opcode::Parameter | Opcode::Constant | Opcode::Iota => Vec::new(),
        op => return Err(NotAnalyzable::UnsupportedOp(op)),
    };
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlo::HloModule;
    use crate::layout::LoopTiling;

    fn offsets(module: &HloModule, indexing: &OperandIndexing, name: &str) -> Vec<String> {
        let id = module.find_instruction(name).unwrap();
        indexing
            .get(id)
            .unwrap()
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.results[0].to_string())
            .collect()
    }

    fn derive(module: &HloModule, root: &str) -> OperandIndexing {
        let fusion = FusionAdaptor::for_instruction(module, module.find_instruction(root).unwrap());
        derive_operand_indexing(&fusion, &LoopTiling::default(), &SymbolicContext::new())
    }

    #[test]
    fn elementwise_reads_follow_thread_id() {
        let m = HloModule::parse(
            r#"
            ENTRY e {
              a = f32[32,64] parameter(0)
              b = f32[32,64] parameter(1)
              ROOT s = f32[32,64] add(a, b)
            }
            "#,
        )
        .unwrap();
        let indexing = derive(&m, "s");
        assert_eq!(offsets(&m, &indexing, "a"), vec!["d0 + d3 * 128"]);
        assert_eq!(offsets(&m, &indexing, "b"), vec!["d0 + d3 * 128"]);
    }

    #[test]
    fn transpose_reads_are_strided() {
        let m = HloModule::parse(
            r#"
            ENTRY e {
              a = f32[64,32] parameter(0)
              ROOT t = f32[32,64] transpose(a), dimensions={1,0}
            }
            "#,
        )
        .unwrap();
        let indexing = derive(&m, "t");
        // Output (i, j) reads a[j, i]: offset j * 32 + i.
        assert_eq!(
            offsets(&m, &indexing, "a"),
            vec!["d3 * 2 + d0 floordiv 64 + (d0 mod 64) * 32"]
        );
    }

    #[test]
    fn broadcast_and_slice() {
        let m = HloModule::parse(
            r#"
            body {
              p0 = f32[64] parameter(0)
              p1 = f32[8,128] parameter(1)
              b = f32[8,64] broadcast(p0), dimensions={1}
              s = f32[8,64] slice(p1), slice={[0:8], [0:128:2]}
              ROOT m = f32[8,64] multiply(b, s)
            }
            ENTRY e {
              v = f32[64] parameter(0)
              w = f32[8,128] parameter(1)
              ROOT f = f32[8,64] fusion(v, w), kind=kLoop, calls=body
            }
            "#,
        )
        .unwrap();
        let indexing = derive(&m, "f");
        assert_eq!(offsets(&m, &indexing, "v"), vec!["d0 mod 64"]);
        assert_eq!(offsets(&m, &indexing, "w"), vec!["d0 * 2 + d3 * 256"]);
    }

    #[test]
    fn gather_declines_its_operands() {
        let m = HloModule::parse(
            r#"
            body {
              p0 = f32[100,8] parameter(0)
              p1 = s32[16,1] parameter(1)
              ROOT g = f32[16,8] gather(p0, p1)
            }
            ENTRY e {
              t = f32[100,8] parameter(0)
              i = s32[16,1] parameter(1)
              ROOT f = f32[16,8] fusion(t, i), kind=kLoop, calls=body
            }
            "#,
        )
        .unwrap();
        let indexing = derive(&m, "f");
        let t = m.find_instruction("t").unwrap();
        assert_eq!(
            indexing.get(t),
            Some(&Err(NotAnalyzable::UnsupportedOp(Opcode::Gather)))
        );
    }

    #[test]
    fn reduce_reads_use_range_symbols() {
        let m = HloModule::parse(
            r#"
            add {
              a = f32[] parameter(0)
              b = f32[] parameter(1)
              ROOT s = f32[] add(a, b)
            }
            ENTRY e {
              x = f32[128,32] parameter(0)
              z = f32[] constant(0)
              ROOT r = f32[128] reduce(x, z), dimensions={1}, to_apply=add
            }
            "#,
        )
        .unwrap();
        // Loop tiling has no hero maps, so the reduce is walked through its
        // output: each thread reads its whole row.
        let indexing = derive(&m, "r");
        assert_eq!(offsets(&m, &indexing, "x"), vec!["d0 * 32 + s1"]);
        assert_eq!(offsets(&m, &indexing, "z"), vec!["0"]);
    }

    #[test]
    fn dynamic_slice_offset_is_runtime() {
        let m = HloModule::parse(
            r#"
            ENTRY e {
              a = f32[256] parameter(0)
              i = s32[] parameter(1)
              ROOT d = f32[32] dynamic-slice(a, i)
            }
            "#,
        )
        .unwrap();
        let fusion = FusionAdaptor::for_instruction(&m, m.find_instruction("d").unwrap());
        let indexing = derive_operand_indexing(&fusion, &LoopTiling::default(), &SymbolicContext::new());
        let a = indexing.get(m.find_instruction("a").unwrap()).unwrap().as_ref().unwrap();
        assert_eq!(a[0].results[0].to_string(), "d0 + s1");
        assert!(a[0].runtime_symbols().any(|s| s == 1));
    }
}
