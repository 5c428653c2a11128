// coalesce — read-coalescing analysis for fused GPU kernels
//
// Library root. Front end (lexer → parser → hlo), fusion view, index maps and
// their symbolic services, kernel layouts, then the two verdict strategies
// and the orchestrator that combines them.

pub mod ast;
pub mod coalescing;
pub mod config;
pub mod contiguity;
pub mod derive;
pub mod diag;
pub mod error;
pub mod fusion;
pub mod heuristic;
pub mod hlo;
pub mod id;
pub mod indexing;
pub mod layout;
pub mod lexer;
pub mod parser;
pub mod report;
pub mod symbolic;

pub use coalescing::{AnalysisOptions, CoalescingAnalysis};
pub use config::CoalescingConfig;
pub use error::{ConfigError, FrontendError, NotAnalyzable};
pub use heuristic::{is_read_coalesced_heuristic, FusionKind};
pub use hlo::HloModule;
pub use id::InstrId;
pub use layout::{KernelLayout, LoopTiling, ReductionTiling};
pub use report::CoalescingReport;
pub use symbolic::SymbolicContext;
