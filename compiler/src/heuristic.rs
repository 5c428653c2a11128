// heuristic.rs — Structural coalescing rules per fusion kind
//
// Classifies a whole fusion from its shape/opcode pattern without looking at
// index arithmetic. Used when exact analysis is not requested or declines.
//
// Preconditions: `producer` (and `consumer`, if given) belong to `module`.
// Postconditions: `true` iff every read of the fusion is judged coalesced.
// Failure modes: none; unknown kinds are conservatively not coalesced.
// Side effects: `debug!` event naming the rule that fired.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::fusion::{FusedInput, FusionAdaptor, FusedNode};
use crate::hlo::{HloModule, Opcode};
use crate::id::InstrId;
use crate::layout::is_row_reduction;

/// Emitter family the fusion will be lowered with. Supplied by the caller;
/// the analyzer never classifies fusions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FusionKind {
    Loop,
    Reduction,
    Transpose,
    Concatenate,
    InputSlices,
    Scatter,
    Triton,
    CustomFusion,
    CuDnn,
}

impl FusionKind {
    pub fn name(self) -> &'static str {
        match self {
            FusionKind::Loop => "loop",
            FusionKind::Reduction => "reduction",
            FusionKind::Transpose => "transpose",
            FusionKind::Concatenate => "concatenate",
            FusionKind::InputSlices => "input-slices",
            FusionKind::Scatter => "scatter",
            FusionKind::Triton => "triton",
            FusionKind::CustomFusion => "custom-fusion",
            FusionKind::CuDnn => "cu-dnn",
        }
    }
}

impl fmt::Display for FusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whole-fusion verdict for `producer` alone, or `producer` fused into
/// `consumer`.
pub fn is_read_coalesced_heuristic(
    kind: FusionKind,
    module: &HloModule,
    producer: InstrId,
    consumer: Option<InstrId>,
) -> bool {
    let fusion = match consumer {
        Some(consumer) => FusionAdaptor::for_producer_consumer(module, producer, consumer),
        None => FusionAdaptor::for_instruction(module, producer),
    };
    heuristic_verdict(kind, &fusion)
}

/// Same as [`is_read_coalesced_heuristic`] over an already flattened fusion.
pub fn heuristic_verdict(kind: FusionKind, fusion: &FusionAdaptor<'_>) -> bool {
    match uncoalesced_reason(kind, fusion) {
        Some(reason) => {
            debug!(%kind, consumer = %fusion.consumer(), reason, "heuristic: not coalesced");
            false
        }
        None => {
            debug!(%kind, consumer = %fusion.consumer(), "heuristic: coalesced");
            true
        }
    }
}

fn uncoalesced_reason(kind: FusionKind, fusion: &FusionAdaptor<'_>) -> Option<&'static str> {
    match kind {
        FusionKind::Scatter => return Some("scatter fusion"),
        FusionKind::Triton | FusionKind::CustomFusion | FusionKind::CuDnn => {
            return Some("no rule for fusion kind")
        }
        _ => {}
    }
    if fusion.contains(Opcode::Gather) || fusion.contains(Opcode::Scatter) {
        return Some("indexed access");
    }
    if fusion.nodes().iter().any(|node| is_bad_transpose(fusion, node)) {
        return Some("transpose of the minor-most dimension");
    }
    if kind == FusionKind::Reduction {
        if let Some(producer) = fusion.producer() {
            let module = fusion.module();
            if has_reduce(module, producer) && has_reduce(module, fusion.consumer()) {
                return Some("reduction fused into reduction");
            }
        }
        if fusion.nodes_with_opcode(Opcode::Reduce).any(|node| is_column_reduce(fusion, node)) {
            return Some("column reduction");
        }
    }
    None
}

/// A transpose, or a layout-changing copy, that moves the minor-most
/// non-degenerate physical dimension.
fn is_bad_transpose(fusion: &FusionAdaptor<'_>, node: &FusedNode) -> bool {
    let instr = fusion.module().instr(node.instr);
    let Some(&input) = node.inputs.first() else {
        return false;
    };
    let (Some(out), Some(inp)) = (instr.array_shape(), fusion.input_instr(input).array_shape()) else {
        return false;
    };
    let moves_minor = match instr.opcode {
        Opcode::Transpose => match out.minor_most_non_degenerate_dim() {
            Some(d) => inp.minor_most_non_degenerate_dim() != instr.dimensions.get(d).copied(),
            None => false,
        },
        Opcode::Copy => inp.minor_most_non_degenerate_dim() != out.minor_most_non_degenerate_dim(),
        _ => false,
    };
    moves_minor && !is_generated_in_fusion(fusion, input)
}

/// Whether `input` is a broadcast or iota computed inside the fusion, possibly
/// behind bitcasts and unary elementwise ops. Such values are never loaded
/// with the transposed pattern.
fn is_generated_in_fusion(fusion: &FusionAdaptor<'_>, mut input: FusedInput) -> bool {
    loop {
        let FusedInput::Node(id) = input else {
            return false;
        };
        let node = fusion.node(id);
        let instr = fusion.instr(id);
        match instr.opcode {
            Opcode::Broadcast | Opcode::Iota => return true,
            Opcode::Bitcast => {}
            op if op.is_elementwise() && node.inputs.len() == 1 => {}
            _ => return false,
        }
        match node.inputs.first() {
            Some(&next) => input = next,
            None => return false,
        }
    }
}

fn is_column_reduce(fusion: &FusionAdaptor<'_>, node: &FusedNode) -> bool {
    let reduce = fusion.module().instr(node.instr);
    let Some(input) = node
        .inputs
        .first()
        .and_then(|&i| fusion.input_instr(i).array_shape())
    else {
        return false;
    };
    !is_row_reduction(input, &reduce.dimensions)
}

/// Whether `id` is a reduce or a fusion whose body contains one.
fn has_reduce(module: &HloModule, id: InstrId) -> bool {
    let instr = module.instr(id);
    match instr.opcode {
        Opcode::Reduce => true,
        Opcode::Fusion => module.fused_computation(id).map_or(false, |body| {
            body.instructions
                .iter()
                .any(|&i| has_reduce(module, i))
        }),
        _ => false,
    }
}
