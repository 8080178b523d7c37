// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores everything a run needs to continue exactly
// where it stopped.
//
// Two slots under `save_top`:
//
//   checkpoints/
//     latest/          ← rewritten after every epoch (resume point)
//     best/            ← rewritten when validation F1 improves
//
// Each slot holds, for its last completed epoch N:
//   visual-eN.bin       visual-group parameters
//   language-eN.bin     language-group parameters
//   optim_cnn-eN.bin    CNN optimizer moment buffers
//   optim_bert-eN.bin   language-model optimizer moment buffers
//   state.json          epoch counters, best F1, loss scale, and the
//                       shape facts used to reject a foreign checkpoint
//
// All records use BinFileRecorder at full precision, so a resumed
// optimizer continues bit-for-bit.
//
// A slot is written into `<slot>.tmp/` and then renamed over the
// old one, so a crash mid-save leaves either the old slot or the
// new one, never a mix. The epoch in every record name must match
// `last_epoch` in state.json; a stray state file therefore finds
// no records and the resume fails.
//
// Resuming reads and checks state.json first. Module and optimizer
// records are only touched once it agrees with the current run.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use burn::{
    module::{AutodiffModule, Module},
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};

use crate::domain::config::ClassifierMode;
use crate::domain::error::{Component, TrainError, TrainResult};
use crate::ml::optim::GroupOptimizer;
use crate::ml::precision::LossScalerState;
use crate::ml::schedule::ScheduleState;

pub const VISUAL:   &str = "visual";
pub const LANGUAGE: &str = "language";
const OPTIM_CNN:    &str = "optim_cnn";
const OPTIM_BERT:   &str = "optim_bert";
const STATE:        &str = "state.json";

type FullRecorder = BinFileRecorder<FullPrecisionSettings>;

// ─── RunState ─────────────────────────────────────────────────────────────────
/// Everything about a run that is not a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Last fully completed epoch
    pub last_epoch:      usize,
    pub cnn_schedule:    ScheduleState,
    pub lm_schedule:     ScheduleState,
    pub best_f1:         Option<f64>,
    pub global_step:     usize,
    pub loss_scale:      LossScalerState,
    pub classifier_mode: ClassifierMode,
    /// "sgd" / "adamw"
    pub cnn_rule:        String,
    pub lm_rule:         String,
    pub cnn_params:      usize,
    pub lm_params:       usize,
}

/// Which of the two checkpoint directories to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Latest,
    Best,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Latest => f.write_str("latest"),
            Slot::Best   => f.write_str("best"),
        }
    }
}

// ─── CheckpointManager ────────────────────────────────────────────────────────
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates `dir` if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> TrainResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        Ok(Self { dir })
    }

    pub fn slot_dir(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.to_string())
    }

    /// Write one complete checkpoint and return its directory.
    pub fn save<B, V, L>(
        &self,
        slot:     Slot,
        visual:   &V,
        language: &L,
        cnn:      &GroupOptimizer<V, B>,
        lm:       &GroupOptimizer<L, B>,
        state:    &RunState,
    ) -> TrainResult<PathBuf>
    where
        B: AutodiffBackend,
        V: AutodiffModule<B>,
        L: AutodiffModule<B>,
    {
        let dir     = self.slot_dir(slot);
        let staging = self.dir.join(format!("{slot}.tmp"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|source| io_error(&staging, source))?;
        }
        fs::create_dir_all(&staging).map_err(|source| io_error(&staging, source))?;

        let epoch = state.last_epoch;
        save_module(visual, &staging.join(record_name(VISUAL, epoch)))?;
        save_module(language, &staging.join(record_name(LANGUAGE, epoch)))?;
        cnn.save(&staging.join(record_name(OPTIM_CNN, epoch)))?;
        lm.save(&staging.join(record_name(OPTIM_BERT, epoch)))?;

        let state_path = staging.join(STATE);
        let json = serde_json::to_string_pretty(state).map_err(|e| TrainError::Record {
            component: Component::Checkpoint,
            path:      state_path.clone(),
            msg:       e.to_string(),
        })?;
        fs::write(&state_path, json).map_err(|source| io_error(&state_path, source))?;

        self.replace_slot(slot, &staging, &dir)?;
        tracing::debug!(slot = %slot, epoch, dir = %dir.display(), "checkpoint written");
        Ok(dir)
    }

    // A directory cannot be renamed over a non-empty one, so the old
    // slot is moved aside first and removed once the new one is in place.
    fn replace_slot(&self, slot: Slot, staging: &Path, dir: &Path) -> TrainResult<()> {
        let retired = self.dir.join(format!("{slot}.old"));
        if retired.exists() {
            fs::remove_dir_all(&retired).map_err(|source| io_error(&retired, source))?;
        }
        if dir.exists() {
            fs::rename(dir, &retired).map_err(|source| io_error(dir, source))?;
        }
        fs::rename(staging, dir).map_err(|source| io_error(dir, source))?;
        if retired.exists() {
            fs::remove_dir_all(&retired).map_err(|source| io_error(&retired, source))?;
        }
        Ok(())
    }
}

/// Record file stem for `name` saved at the end of `epoch`.
fn record_name(name: &str, epoch: usize) -> String {
    format!("{name}-e{epoch}")
}

/// Read the run state of a checkpoint directory. A missing or
/// unreadable state file is a resume mismatch.
pub fn read_state(dir: &Path) -> TrainResult<RunState> {
    let path = dir.join(STATE);
    let mismatch = |msg: String| TrainError::ResumeMismatch {
        component: Component::Checkpoint,
        group:     None,
        path:      path.clone(),
        msg,
    };
    let json = fs::read_to_string(&path).map_err(|e| mismatch(format!("cannot read run state: {e}")))?;
    serde_json::from_str(&json).map_err(|e| mismatch(format!("cannot parse run state: {e}")))
}

/// Load one parameter group's weights saved at the end of `epoch`.
/// `name` is "visual" or "language".
pub fn load_module<B, T>(dir: &Path, name: &str, epoch: usize, module: T, device: &B::Device) -> TrainResult<T>
where
    B: Backend,
    T: Module<B>,
{
    let path = dir.join(record_name(name, epoch));
    module
        .load_file(path.clone(), &FullRecorder::new(), device)
        .map_err(|e| TrainError::ResumeMismatch {
            component: Component::Checkpoint,
            group:     None,
            path,
            msg:       format!("cannot load {name} weights: {e:?}"),
        })
}

/// Paths of the two optimizer records saved at the end of `epoch`.
pub fn optimizer_paths(dir: &Path, epoch: usize) -> (PathBuf, PathBuf) {
    (dir.join(record_name(OPTIM_CNN, epoch)), dir.join(record_name(OPTIM_BERT, epoch)))
}

fn save_module<B: Backend, T: Module<B>>(module: &T, path: &Path) -> TrainResult<()> {
    module
        .clone()
        .save_file(path.to_path_buf(), &FullRecorder::new())
        .map_err(|e| TrainError::Record {
            component: Component::Checkpoint,
            path:      path.to_path_buf(),
            msg:       format!("{e:?}"),
        })
}

fn io_error(path: &Path, source: std::io::Error) -> TrainError {
    TrainError::Io { component: Component::Checkpoint, path: path.to_path_buf(), source }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::OptimizerGroup;
    use crate::domain::config::UpdateRule;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn state() -> RunState {
        RunState {
            last_epoch:      40,
            cnn_schedule:    ScheduleState { current_epoch: 41 },
            lm_schedule:     ScheduleState { current_epoch: 41 },
            best_f1:         Some(0.5),
            global_step:     410,
            loss_scale:      LossScalerState { scale: 1.0, clean_steps: 0 },
            classifier_mode: ClassifierMode::Full,
            cnn_rule:        "sgd".into(),
            lm_rule:         "adamw".into(),
            cnn_params:      3,
            lm_params:       3,
        }
    }

    #[test]
    fn test_save_writes_full_slot_and_state_reads_back() {
        let tmp    = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ckpt   = CheckpointManager::new(tmp.path().join("ckpt")).unwrap();

        let visual:   Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let language: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let cnn = GroupOptimizer::new(OptimizerGroup::Cnn, UpdateRule::Sgd { momentum: 0.9 }, None, 0.0);
        let lm  = GroupOptimizer::new(
            OptimizerGroup::LanguageModel,
            UpdateRule::AdamW { beta1: 0.9, beta2: 0.999, epsilon: 1e-8 },
            None,
            0.01,
        );

        let dir = ckpt.save(Slot::Latest, &visual, &language, &cnn, &lm, &state()).unwrap();
        assert_eq!(dir, tmp.path().join("ckpt").join("latest"));
        assert_eq!(read_state(&dir).unwrap(), state());

        let fresh: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let loaded = load_module(&dir, VISUAL, 40, fresh, &device).unwrap();
        assert_eq!(
            loaded.weight.val().into_data().to_vec::<f32>().unwrap(),
            visual.weight.val().into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rewritten_slot_holds_only_the_newest_epoch() {
        let tmp    = tempfile::tempdir().unwrap();
        let device = Default::default();
        let ckpt   = CheckpointManager::new(tmp.path()).unwrap();

        let visual:   Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let language: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let cnn = GroupOptimizer::new(OptimizerGroup::Cnn, UpdateRule::Sgd { momentum: 0.9 }, None, 0.0);
        let lm  = GroupOptimizer::new(OptimizerGroup::Cnn, UpdateRule::Sgd { momentum: 0.9 }, None, 0.0);

        let mut older = state();
        older.last_epoch = 39;
        ckpt.save(Slot::Latest, &visual, &language, &cnn, &lm, &older).unwrap();
        let dir = ckpt.save(Slot::Latest, &visual, &language, &cnn, &lm, &state()).unwrap();

        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            ["language-e40.bin", "optim_bert-e40.bin", "optim_cnn-e40.bin", "state.json", "visual-e40.bin"]
        );
        assert!(!tmp.path().join("latest.tmp").exists());
        assert!(!tmp.path().join("latest.old").exists());

        // A state file from the previous epoch finds none of its records
        let fresh: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let err = load_module(&dir, VISUAL, older.last_epoch, fresh, &device).err().unwrap();
        assert!(matches!(err, TrainError::ResumeMismatch { .. }));
    }

    #[test]
    fn test_missing_state_is_resume_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(read_state(tmp.path()), Err(TrainError::ResumeMismatch { .. })));
    }
}
