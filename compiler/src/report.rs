// report.rs — Serializable summary of a coalescing analysis
//
// Preconditions: `analysis` was built over `module`.
// Postconditions: operands appear in read order; the fingerprint depends only
//                 on the analyzed fusion's text, the kind and the mode.
// Failure modes: JSON rendering errors from serde_json.
// Side effects: none.

use std::fmt::{self, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::coalescing::CoalescingAnalysis;
use crate::fusion::FusionAdaptor;
use crate::heuristic::FusionKind;
use crate::hlo::HloModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Exact,
    /// At least one verdict came from the structural heuristic.
    Heuristic,
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnalysisMode::Exact => "exact",
            AnalysisMode::Heuristic => "heuristic",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperandVerdict {
    pub name: String,
    pub shape: String,
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoalescingReport {
    pub module: String,
    pub producer: Option<String>,
    pub consumer: String,
    pub kind: FusionKind,
    pub mode: AnalysisMode,
    /// 16 hex digits of SHA-256 over the fusion text, kind and mode.
    pub fingerprint: String,
    pub operands: Vec<OperandVerdict>,
}

impl CoalescingReport {
    pub fn new(module: &HloModule, analysis: &CoalescingAnalysis) -> Self {
        let fusion = match analysis.producer() {
            Some(producer) => FusionAdaptor::for_producer_consumer(module, producer, analysis.consumer()),
            None => FusionAdaptor::for_instruction(module, analysis.consumer()),
        };
        let mode = if analysis.is_computed_by_heuristic() {
            AnalysisMode::Heuristic
        } else {
            AnalysisMode::Exact
        };
        let operands = analysis
            .read_operands()
            .iter()
            .map(|&op| {
                let instr = module.instr(op);
                OperandVerdict {
                    name: instr.name.clone(),
                    shape: instr.shape.to_string(),
                    coalesced: analysis.is_read_coalesced(op),
                }
            })
            .collect();
        CoalescingReport {
            module: module.name.clone(),
            producer: analysis.producer().map(|p| module.instr(p).name.clone()),
            consumer: module.instr(analysis.consumer()).name.clone(),
            kind: analysis.kind(),
            mode,
            fingerprint: fingerprint(&fusion.to_string(), analysis.kind(), mode),
            operands,
        }
    }

    pub fn all_coalesced(&self) -> bool {
        self.operands.iter().all(|o| o.coalesced)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = match &self.producer {
            Some(producer) => writeln!(out, "fusion: {} <- {}", self.consumer, producer),
            None => writeln!(out, "fusion: {}", self.consumer),
        };
        let _ = writeln!(
            out,
            "kind: {}  mode: {}  fingerprint: {}",
            self.kind, self.mode, self.fingerprint
        );
        let width = self.operands.iter().map(|o| o.name.len()).max().unwrap_or(0);
        for operand in &self.operands {
            let verdict = if operand.coalesced { "coalesced" } else { "not coalesced" };
            let _ = writeln!(
                out,
                "  {:<width$}  {}  {}",
                operand.name,
                operand.shape,
                verdict,
                width = width
            );
        }
        out
    }
}

fn fingerprint(fusion_text: &str, kind: FusionKind, mode: AnalysisMode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fusion_text.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(mode.to_string().as_bytes());
    let digest = hasher.finalize();
    bytes_to_hex(&digest[..8])
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
