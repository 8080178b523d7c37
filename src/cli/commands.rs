// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands: `train`, `schedule` and
// `init-config`, and their flags.
//
// Almost everything about a run lives in the JSON config file.
// The flags on `train` only override the handful of settings
// that change between launches of the same experiment.
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::domain::config::RunConfig;

/// The three top-level subcommands available to the user
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the training loop described by a config file
    Train(TrainArgs),

    /// Print the per-epoch learning rate and weight decay of both groups
    Schedule(ScheduleArgs),

    /// Write a default config file to start from
    InitConfig(InitConfigArgs),
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSON run configuration
    #[arg(long)]
    pub config: PathBuf,

    /// Override `end_epoch` (exclusive)
    #[arg(long)]
    pub end_epoch: Option<usize>,

    /// Resume from this checkpoint directory, e.g. checkpoints/latest
    #[arg(long)]
    pub weights: Option<String>,

    /// Override `device` ("cpu" or "wgpu")
    #[arg(long)]
    pub device: Option<String>,
}

impl TrainArgs {
    /// Apply the command-line overrides on top of a loaded config.
    pub fn apply(&self, mut cfg: RunConfig) -> RunConfig {
        if let Some(end_epoch) = self.end_epoch {
            cfg.end_epoch = end_epoch;
        }
        if let Some(weights) = &self.weights {
            cfg.weights = Some(weights.clone());
        }
        if let Some(device) = &self.device {
            cfg.device = device.clone();
        }
        cfg
    }
}

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// JSON run configuration
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Where to write the config
    #[arg(long, default_value = "config.json")]
    pub out: PathBuf,
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let args = TrainArgs {
            config:    PathBuf::from("cfg.json"),
            end_epoch: Some(7),
            weights:   None,
            device:    Some("wgpu".into()),
        };
        let cfg = args.apply(RunConfig::default());
        assert_eq!(cfg.end_epoch, 7);
        assert_eq!(cfg.device, "wgpu");
        assert_eq!(cfg.weights, None);
        assert_eq!(cfg.batch_size, RunConfig::default().batch_size);
    }
}
