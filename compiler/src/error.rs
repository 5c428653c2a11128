// error.rs — Error types shared across the analyzer
//
// `NotAnalyzable` is not surfaced to analysis callers: it is the decline
// signal that sends a single operand to the heuristic path.

use std::path::PathBuf;

use thiserror::Error;

use crate::diag::Diagnostic;
use crate::hlo::Opcode;

/// Why the exact path could not classify an operand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotAnalyzable {
    /// The kernel layout produced no thread map for this root.
    #[error("kernel layout declined root {root_index}")]
    LayoutDeclined { root_index: usize },

    /// Index propagation reached an instruction with no closed-form indexing.
    #[error("no closed-form indexing through {0}")]
    UnsupportedOp(Opcode),

    /// The offset depends on a runtime (data-dependent) value.
    #[error("offset depends on runtime symbol s{0}")]
    DataDependent(usize),

    /// A map's result count does not match the rank it feeds.
    #[error("index map has {found} result(s) where rank {expected} is needed")]
    RankMismatch { expected: usize, found: usize },

    /// The evaluator needs exactly one linear offset per map.
    #[error("expected a single offset result, found {0}")]
    NotLinearized(usize),

    /// No lane of any probed execution group falls inside the domain.
    #[error("index map has no valid lane in any probed execution group")]
    EmptyDomain,

    /// Evaluation hit a division or modulus by zero.
    #[error("offset expression is undefined at a probed point")]
    Undefined,

    /// The analysis config failed validation.
    #[error("invalid analysis config: {0}")]
    InvalidConfig(String),

    /// The operand is not array-shaped.
    #[error("operand is not an array")]
    NonArrayOperand,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// HLO text that could not be turned into a module.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("syntax error: {}", .0.join("; "))]
    Syntax(Vec<String>),

    #[error("{} error(s) while resolving module; first: {}", .0.len(), first_message(.0))]
    Invalid(Vec<Diagnostic>),
}

fn first_message(diags: &[Diagnostic]) -> String {
    diags
        .first()
        .map(|d| d.to_string())
        .unwrap_or_default()
}
