// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction. Parses arguments with
// clap and delegates the work to Layer 2 (application).
//
// Commands:
//   1. `train`       — run (or resume) a training run
//   2. `schedule`    — print both groups' lr / wd per epoch
//   3. `init-config` — write a default JSON config
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, InitConfigArgs, ScheduleArgs, TrainArgs};

use crate::domain::config::RunConfig;

#[derive(Parser, Debug)]
#[command(
    name = "doc-field-trainer",
    version = "0.1.0",
    about = "Train a grid + language-model field tagger with OHEM multi-head losses."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)      => run_train(args),
            Commands::Schedule(args)   => run_schedule(args),
            Commands::InitConfig(args) => run_init_config(args),
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("cannot load config '{}'", path.display()))
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let cfg = args.apply(load_config(&args.config)?);
    tracing::info!(
        "Training {:?} mode, epochs {}..{}",
        cfg.structure.classifier_mode,
        cfg.start_epoch,
        cfg.end_epoch
    );

    let path = TrainUseCase::new(cfg).execute()?;
    println!("Training complete. Final checkpoint: {}", path.display());
    Ok(())
}

fn run_schedule(args: ScheduleArgs) -> Result<()> {
    use crate::application::schedule_use_case::ScheduleUseCase;

    let rows = ScheduleUseCase::new(load_config(&args.config)?).execute()?;
    println!("{:>6}  {:>12}  {:>12}  {:>12}  {:>12}", "epoch", "cnn_lr", "cnn_wd", "bert_lr", "bert_wd");
    for row in rows {
        println!(
            "{:>6}  {:>12.4e}  {:>12.4e}  {:>12.4e}  {:>12.4e}",
            row.epoch,
            row.cnn.learning_rate,
            row.cnn.weight_decay,
            row.lm.learning_rate,
            row.lm.weight_decay
        );
    }
    Ok(())
}

fn run_init_config(args: InitConfigArgs) -> Result<()> {
    if args.out.exists() {
        anyhow::bail!("'{}' already exists, not overwriting", args.out.display());
    }
    let json = serde_json::to_string_pretty(&RunConfig::default())?;
    std::fs::write(&args.out, json).with_context(|| format!("cannot write '{}'", args.out.display()))?;
    println!("Wrote default config to {}", args.out.display());
    Ok(())
}
