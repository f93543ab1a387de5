//! Constrained decoding CLI
//!
//! Reads a TOML config and line-aligned data files, then writes one decoded
//! line per example.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lagrange_decode::config::DecodeConfig;
use lagrange_decode::data::Dataset;
use lagrange_decode::decode::{CancelFlag, Decoder};
use lagrange_decode::setup;
use lagrange_decode::tokenizer::CharTokenizer;

/// Constrained decoding with a damped Lagrangian over a relaxed token simplex.
#[derive(Debug, Parser)]
#[command(
    name = "lagrange-decode",
    version,
    about = "Decode text that minimizes a primary loss subject to loss thresholds on other scorers"
)]
struct Cli {
    /// TOML config; absent keys keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source text, one example per line
    #[arg(long)]
    source: PathBuf,

    /// Reference targets (defaults to the source file)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Extra conditioning for the baseline generator (defaults to the source file)
    #[arg(long)]
    additional: Option<PathBuf>,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Weights file per loss, overriding `models`
    #[arg(long, num_args = 1..)]
    models: Option<Vec<PathBuf>>,

    /// Constraint thresholds, overriding `epsilons`
    #[arg(long, num_args = 1..)]
    epsilons: Option<Vec<f64>>,

    /// Optimization steps per length
    #[arg(long)]
    optim_steps: Option<usize>,

    /// Step size of the target optimizer
    #[arg(long)]
    lr: Option<f64>,

    /// Step size of the multipliers
    #[arg(long)]
    lambda_lr: Option<f64>,

    /// Fixed output length
    #[arg(long)]
    max_length: Option<usize>,

    /// Stop after this many examples
    #[arg(long)]
    num_examples: Option<usize>,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Optimize even when the baseline already satisfies every constraint
    #[arg(long)]
    always_optimize: bool,

    /// Print the resolved plan as JSON and exit
    #[arg(long)]
    print_plan: bool,
}

impl Cli {
    /// Layer command-line values over the file config.
    fn apply(&self, config: &mut DecodeConfig) {
        if let Some(models) = &self.models {
            config.models.clone_from(models);
        }
        if let Some(epsilons) = &self.epsilons {
            config.epsilons.clone_from(epsilons);
        }
        if let Some(steps) = self.optim_steps {
            config.optim_steps = steps;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(lambda_lr) = self.lambda_lr {
            config.lambda_lr = lambda_lr;
        }
        if self.max_length.is_some() {
            config.max_length = self.max_length;
        }
        if self.num_examples.is_some() {
            config.num_examples = self.num_examples;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.always_optimize |= self.always_optimize;
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DecodeConfig::load(path)?,
        None => DecodeConfig::default(),
    };
    cli.apply(&mut config);
    let plan = config.validate().context("invalid configuration")?;
    if cli.print_plan {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    setup::check_loss_names(&plan)?;
    let vocab = setup::probe_vocabularies(&plan)?;
    tracing::info!(
        objectives = plan.objectives.len(),
        criterion = %plan.criterion,
        optimizer = %plan.optimizer,
        vocab,
        "configuration validated"
    );

    let dataset = Dataset::load(&cli.source, cli.target.as_deref(), cli.additional.as_deref())
        .context("failed to read data")?;
    tracing::info!(examples = dataset.len(), "data loaded");

    let device = candle_core::Device::Cpu;
    let loaded = setup::build_objectives(&plan, &device)?;
    let cancel = CancelFlag::new();
    spawn_interrupt_handler(cancel.clone());

    let mut decoder = Decoder::new(
        plan,
        loaded.slots,
        loaded.primary,
        Arc::new(CharTokenizer::new()),
    )?
    .with_cancel_flag(cancel);

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create output {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let summary = decoder.run(&dataset, &mut out)?;
    out.flush()?;

    tracing::info!(
        examples = summary.examples,
        skipped_by_baseline = summary.skipped_by_baseline,
        debug_skipped = summary.debug_skipped,
        mean_best_step = ?summary.mean_best_step,
        "done"
    );
    Ok(())
}

/// Arm `cancel` on every Ctrl-C; the current length stops at its next step.
fn spawn_interrupt_handler(cancel: CancelFlag) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!(error = %err, "no signal runtime; Ctrl-C will abort");
                    return;
                }
            };
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing the current length early");
                    cancel.cancel();
                }
            });
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to spawn the interrupt handler");
    }
}
