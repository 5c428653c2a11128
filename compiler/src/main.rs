use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use coalesce::fusion::is_producer_of;
use coalesce::{
    AnalysisOptions, CoalescingAnalysis, CoalescingConfig, CoalescingReport, FrontendError, FusionKind, HloModule,
    InstrId, KernelLayout, LoopTiling, ReductionTiling, SymbolicContext,
};

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "coalesce",
    version,
    about = "Reports whether each operand read of an HLO fusion is coalesced on the GPU"
)]
struct Cli {
    /// Input .hlo module text
    source: PathBuf,

    /// Instruction to analyze (default: the entry computation's root)
    #[arg(long, conflicts_with_all = ["producer", "consumer"])]
    instr: Option<String>,

    /// Producer to fuse into --consumer
    #[arg(long, requires = "consumer")]
    producer: Option<String>,

    /// Consumer the producer is fused into
    #[arg(long, requires = "producer")]
    consumer: Option<String>,

    /// Emitter kind the fusion will be lowered with
    #[arg(long, value_enum, default_value_t = FusionKind::Loop)]
    kind: FusionKind,

    /// Derive index maps instead of using the structural heuristic
    #[arg(long)]
    exact: bool,

    /// Threads per block for the exact-mode tiling
    #[arg(long, default_value_t = 128)]
    threads_per_block: i64,

    /// Grid-stride iterations per thread for loop tiling
    #[arg(long, default_value_t = 1)]
    unroll: i64,

    /// JSON file with analysis settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Exit with status 1 if any read is not coalesced
    #[arg(long)]
    fail_on_uncoalesced: bool,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("coalesce: error: {:#}", e);
            std::process::exit(2);
        }
    }
}

/// Returns `false` when `--fail-on-uncoalesced` should fail the run.
fn run(cli: &Cli) -> Result<bool> {
    if cli.threads_per_block <= 0 || cli.unroll <= 0 {
        bail!("--threads-per-block and --unroll must be positive");
    }
    let config = match &cli.config {
        Some(path) => CoalescingConfig::from_json_file(path)?,
        None => CoalescingConfig::default(),
    };

    // ── Load module ──
    let text = fs::read_to_string(&cli.source).with_context(|| format!("cannot read {}", cli.source.display()))?;
    let module = match HloModule::parse(&text) {
        Ok(module) => module,
        Err(FrontendError::Invalid(diags)) => {
            for diag in &diags {
                eprintln!("coalesce: {}", diag);
            }
            bail!("{}: {} error(s)", cli.source.display(), diags.len());
        }
        Err(e) => return Err(e).with_context(|| format!("cannot parse {}", cli.source.display())),
    };
    for warning in module.warnings() {
        eprintln!("coalesce: {}", warning);
    }

    // ── Analyze ──
    let ctx = SymbolicContext::new();
    let layout: Box<dyn KernelLayout> = match cli.kind {
        FusionKind::Reduction => Box::new(ReductionTiling::new(cli.threads_per_block)),
        _ => Box::new(LoopTiling::new(cli.threads_per_block, cli.unroll)),
    };
    let options = if cli.exact {
        AnalysisOptions::exact(layout.as_ref(), &ctx)
    } else {
        AnalysisOptions::heuristic()
    }
    .with_config(config);

    let analysis = match (&cli.producer, &cli.consumer) {
        (Some(producer), Some(consumer)) => {
            let (p, c) = (lookup(&module, producer)?, lookup(&module, consumer)?);
            if !is_producer_of(&module, p, c) {
                bail!("'{}' is not an operand of '{}'", producer, consumer);
            }
            CoalescingAnalysis::for_producer_consumer(&module, p, c, cli.kind, &options)
        }
        _ => {
            let instr = match &cli.instr {
                Some(name) => lookup(&module, name)?,
                None => module.entry().root,
            };
            CoalescingAnalysis::new(&module, instr, cli.kind, &options)
        }
    };

    // ── Report ──
    let report = CoalescingReport::new(&module, &analysis);
    match cli.format {
        OutputFormat::Text => print!("{}", report.to_text()),
        OutputFormat::Json => println!("{}", report.to_json().context("cannot render report")?),
    }
    Ok(!cli.fail_on_uncoalesced || report.all_coalesced())
}

fn lookup(module: &HloModule, name: &str) -> Result<InstrId> {
    module
        .find_instruction(name)
        .with_context(|| format!("no instruction named '{}'", name))
}
