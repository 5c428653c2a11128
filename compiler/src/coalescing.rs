// coalescing.rs — Per-operand read-coalescing verdicts for one fusion
//
// Entry point of the analyzer. Builds a flattened fusion for a node or a
// producer/consumer pair, classifies every read operand once, and answers
// later queries from the memoized table.
//
// Preconditions: the analyzed instructions belong to `module`; exact mode
//                needs both a kernel layout and a symbolic context.
// Postconditions: every read operand has exactly one verdict.
// Failure modes: none surfaced; an operand the exact path cannot handle gets
//                the heuristic verdict and sets the heuristic flag.
// Side effects: `tracing` events; exact mode bumps the symbolic context's
//               counters.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info};

use crate::config::CoalescingConfig;
use crate::contiguity::evaluate_contiguity;
use crate::derive::derive_operand_indexing;
use crate::error::NotAnalyzable;
use crate::fusion::FusionAdaptor;
use crate::heuristic::{heuristic_verdict, FusionKind};
use crate::hlo::HloModule;
use crate::id::InstrId;
use crate::indexing::{IndexingMap, THREAD_X};
use crate::layout::KernelLayout;
use crate::symbolic::SymbolicContext;

// ── Options ─────────────────────────────────────────────────────────────────

/// How verdicts are computed. Exact analysis runs only when `use_heuristic`
/// is off and both collaborators are present.
#[derive(Clone)]
pub struct AnalysisOptions<'a> {
    pub kernel_layout: Option<&'a dyn KernelLayout>,
    pub symbolic: Option<&'a SymbolicContext>,
    pub use_heuristic: bool,
    pub config: CoalescingConfig,
}

impl Default for AnalysisOptions<'_> {
    fn default() -> Self {
        AnalysisOptions::heuristic()
    }
}

impl<'a> AnalysisOptions<'a> {
    pub fn heuristic() -> Self {
        AnalysisOptions {
            kernel_layout: None,
            symbolic: None,
            use_heuristic: true,
            config: CoalescingConfig::default(),
        }
    }

    pub fn exact(layout: &'a dyn KernelLayout, ctx: &'a SymbolicContext) -> Self {
        AnalysisOptions {
            kernel_layout: Some(layout),
            symbolic: Some(ctx),
            use_heuristic: false,
            config: CoalescingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoalescingConfig) -> Self {
        self.config = config;
        self
    }

    fn exact_collaborators(&self) -> Option<(&'a dyn KernelLayout, &'a SymbolicContext)> {
        if self.use_heuristic {
            return None;
        }
        Some((self.kernel_layout?, self.symbolic?))
    }
}

impl fmt::Debug for AnalysisOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisOptions")
            .field("kernel_layout", &self.kernel_layout.is_some())
            .field("symbolic", &self.symbolic.is_some())
            .field("use_heuristic", &self.use_heuristic)
            .field("config", &self.config)
            .finish()
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoalescingAnalysis {
    kind: FusionKind,
    producer: Option<InstrId>,
    consumer: InstrId,
    read_operands: Vec<InstrId>,
    verdicts: HashMap<InstrId, bool>,
    computed_by_heuristic: bool,
}

impl CoalescingAnalysis {
    /// Analyze `instr` (a fusion or a plain instruction) on its own.
    pub fn new(module: &HloModule, instr: InstrId, kind: FusionKind, options: &AnalysisOptions<'_>) -> Self {
        Self::analyze(&FusionAdaptor::for_instruction(module, instr), kind, options)
    }

    /// Analyze `producer` as if fused into `consumer`.
    pub fn for_producer_consumer(
        module: &HloModule,
        producer: InstrId,
        consumer: InstrId,
        kind: FusionKind,
        options: &AnalysisOptions<'_>,
    ) -> Self {
        Self::analyze(
            &FusionAdaptor::for_producer_consumer(module, producer, consumer),
            kind,
            options,
        )
    }

    fn analyze(fusion: &FusionAdaptor<'_>, kind: FusionKind, options: &AnalysisOptions<'_>) -> Self {
        let read_operands = fusion.read_operands().to_vec();
        let (verdicts, computed_by_heuristic) = match options.exact_collaborators() {
            Some((layout, ctx)) => {
                debug!(%kind, consumer = %fusion.consumer(), "coalescing: exact mode");
                compute_exact(fusion, kind, layout, ctx, &options.config)
            }
            None => {
                debug!(%kind, consumer = %fusion.consumer(), "coalescing: heuristic mode");
                let verdict = heuristic_verdict(kind, fusion);
                (read_operands.iter().map(|&op| (op, verdict)).collect(), true)
            }
        };
        let coalesced = verdicts.values().filter(|&&v| v).count();
        info!(
            %kind,
            consumer = %fusion.consumer(),
            operands = read_operands.len(),
            coalesced,
            heuristic = computed_by_heuristic,
            "coalescing analysis complete"
        );
        CoalescingAnalysis {
            kind,
            producer: fusion.producer(),
            consumer: fusion.consumer(),
            read_operands,
            verdicts,
            computed_by_heuristic,
        }
    }

    /// Memoized verdict for `operand`.
    ///
    /// # Panics
    ///
    /// If `operand` is not read by the analyzed fusion.
    pub fn is_read_coalesced(&self, operand: InstrId) -> bool {
        match self.verdicts.get(&operand) {
            Some(&verdict) => verdict,
            None => panic!("operand {} is not read by the analyzed fusion", operand),
        }
    }

    pub fn verdict(&self, operand: InstrId) -> Option<bool> {
        self.verdicts.get(&operand).copied()
    }

    /// Whether any verdict came from the structural heuristic.
    pub fn is_computed_by_heuristic(&self) -> bool {
        self.computed_by_heuristic
    }

    /// Classified operands in first-read order.
    pub fn read_operands(&self) -> &[InstrId] {
        &self.read_operands
    }

    pub fn kind(&self) -> FusionKind {
        self.kind
    }

    pub fn producer(&self) -> Option<InstrId> {
        self.producer
    }

    pub fn consumer(&self) -> InstrId {
        self.consumer
    }
}

fn compute_exact(
    fusion: &FusionAdaptor<'_>,
    kind: FusionKind,
    layout: &dyn KernelLayout,
    ctx: &SymbolicContext,
    config: &CoalescingConfig,
) -> (HashMap<InstrId, bool>, bool) {
    let indexing = derive_operand_indexing(fusion, layout, ctx);
    let mut heuristic: Option<bool> = None;
    let mut by_heuristic = false;
    let mut verdicts = HashMap::with_capacity(fusion.read_operands().len());

    for &operand in fusion.read_operands() {
        let exact = match indexing.get(operand) {
            Some(Ok(maps)) => evaluate_maps(maps, config),
            Some(Err(reason)) => Err(reason.clone()),
            // Not reached from any root: nothing is loaded.
            None => Ok(true),
        };
        let verdict = match exact {
            Ok(verdict) => verdict,
            Err(reason) => {
                debug!(operand = %operand, %reason, "falling back to heuristic");
                by_heuristic = true;
                *heuristic.get_or_insert_with(|| heuristic_verdict(kind, fusion))
            }
        };
        verdicts.insert(operand, verdict);
    }
    (verdicts, by_heuristic)
}

/// Coalesced iff every map reaching the operand is.
fn evaluate_maps(maps: &[IndexingMap], config: &CoalescingConfig) -> Result<bool, NotAnalyzable> {
    for map in maps {
        if !evaluate_contiguity(map, THREAD_X, config)? {
            return Ok(false);
        }
    }
    Ok(true)
}
