// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// The one operation this crate exposes:
//
//   run(config) -> final checkpoint path | failure
//
// Steps:
//   Step 1: Pick the backend from `device`        (Layer 3 - domain)
//   Step 2: Produce labelled documents            (Layer 4 - data)
//   Step 3: Split train/validation (seeded)       (Layer 4 - data)
//   Step 4: Per-epoch train loader, inner-backend
//           validation loader                     (Layer 4 - data)
//   Step 5: Build model + trainer, maybe resume   (Layer 5 - ml)
//   Step 6: Run the epoch loop                    (Layer 5 - ml)
//
// The returned path is the `best` checkpoint directory, or
// `latest` when validation F1 never improved.
//
// Reference: Burn Book §5 (Training)

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    data::dataloader::DataLoaderBuilder,
    tensor::backend::AutodiffBackend,
};

use crate::data::{
    batcher::DocumentBatcher,
    dataset::{DocumentDataset, SyntheticReceipts},
    epochs::ShuffledEpochs,
    splitter::split_train_val,
};
use crate::domain::config::{DeviceKind, RunConfig};
use crate::domain::traits::DocumentSource;
use crate::ml::{
    evaluator::Evaluator,
    model::{GridTagger, GridTaggerConfig},
    trainer::Trainer,
};

type CpuBackend = Autodiff<NdArray<f32>>;
type GpuBackend = Autodiff<Wgpu>;

/// Seed used for data generation, splitting and shuffling when
/// the configuration names none.
const DEFAULT_SEED: u64 = 42;

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: RunConfig,
}

impl TrainUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Execute the whole run on the configured device.
    pub fn execute(&self) -> Result<PathBuf> {
        let cfg = &self.config;
        cfg.validate().context("invalid run configuration")?;

        // ── Step 1: Backend ──────────────────────────────────────────────────
        match cfg.device_kind()? {
            DeviceKind::Cpu => {
                tracing::info!("Using NdArray CPU backend");
                run::<CpuBackend>(cfg, Default::default())
            }
            DeviceKind::Wgpu => {
                let device = WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                run::<GpuBackend>(cfg, device)
            }
        }
    }
}

/// Train on backend `B`. See the module header for the steps.
pub fn run<B: AutodiffBackend>(cfg: &RunConfig, device: B::Device) -> Result<PathBuf> {
    let seed = cfg.seed.unwrap_or(DEFAULT_SEED);

    // ── Step 2: Documents ────────────────────────────────────────────────────
    let data  = &cfg.data;
    let total = data.num_train_docs + data.num_val_docs;
    tracing::debug!(
        "Image normalisation mean={:?} std={:?}, multi-scale sizes {:?} / {:?}",
        data.image_mean,
        data.image_std,
        data.min_size,
        data.max_size,
    );
    let source = SyntheticReceipts::new(data, cfg.structure.tag_mode, cfg.num_aux_scales(), total, seed);
    let docs   = source.load_all().context("cannot produce training documents")?;
    tracing::info!("Loaded {} documents", docs.len());

    // ── Step 3: Train / validation split ─────────────────────────────────────
    let fraction = data.num_train_docs as f64 / total.max(1) as f64;
    let (train_docs, val_docs) = split_train_val(docs, fraction, seed);
    tracing::info!("Split: {} train, {} validation", train_docs.len(), val_docs.len());
    if train_docs.is_empty() {
        anyhow::bail!("no training documents (data.num_train_docs = {})", data.num_train_docs);
    }

    // ── Step 4: Data loaders ─────────────────────────────────────────────────
    let train_loader = ShuffledEpochs::new(
        DocumentDataset::new(train_docs),
        DocumentBatcher::<B>::new(device.clone(), data.grid_dim),
        cfg.batch_size,
        seed,
    );
    let val_loader = DataLoaderBuilder::new(DocumentBatcher::<B::InnerBackend>::new(device.clone(), data.grid_dim))
        .batch_size(cfg.batch_size)
        .num_workers(1)
        .build(DocumentDataset::new(val_docs));

    // ── Step 5: Model + trainer ──────────────────────────────────────────────
    let model: GridTagger<B> = GridTaggerConfig::from_run(cfg).init(&device);
    let mut trainer = Trainer::<B, GridTagger<B>>::new(cfg, device)?;
    let model = match cfg.resume_path() {
        Some(dir) => trainer
            .resume(model, &dir)
            .with_context(|| format!("cannot resume from '{}'", dir.display()))?,
        None => model,
    };

    // ── Step 6: Epoch loop ───────────────────────────────────────────────────
    let mut validator = Evaluator::<B>::new(cfg, val_loader);
    let path = trainer.fit(model, train_loader, &mut validator)?;
    tracing::info!("Final checkpoint: '{}'", path.display());
    Ok(path)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::ClassifierMode;

    fn tiny(root: &std::path::Path, mode: ClassifierMode) -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.end_epoch  = 2;
        cfg.batch_size = 2;
        cfg.seed       = Some(3);
        cfg.save_top   = root.join("ckpt").display().to_string();
        cfg.save_log   = root.join("logs").display().to_string();
        cfg.optimizer_cnn_hyp.warmup_epochs  = 1;
        cfg.optimizer_bert_hyp.warmup_epochs = 1;
        cfg.structure.classifier_mode = mode;
        cfg.structure.hidden_dim      = 8;
        cfg.data.num_fields     = 2;
        cfg.data.vocab_size     = 30;
        cfg.data.grid_dim       = 4;
        cfg.data.max_seq_len    = 8;
        cfg.data.grid_size      = 4;
        cfg.data.num_train_docs = 4;
        cfg.data.num_val_docs   = 2;
        cfg.ohem.loss_aux_sample_list  = vec![8, 8, 8];
        cfg.ohem.num_hard_positive_aux = 4;
        cfg.ohem.num_hard_negative_aux = 4;
        cfg
    }

    #[test]
    fn test_run_returns_a_checkpoint_in_every_mode() {
        for mode in [ClassifierMode::Simp, ClassifierMode::Full, ClassifierMode::Crf] {
            let tmp  = tempfile::tempdir().unwrap();
            let path = TrainUseCase::new(tiny(tmp.path(), mode)).execute().unwrap();
            assert!(path.starts_with(tmp.path().join("ckpt")));
            assert!(path.join("state.json").is_file());
        }
    }

    #[test]
    fn test_resume_after_finished_run_returns_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = tiny(tmp.path(), ClassifierMode::Full);
        TrainUseCase::new(cfg.clone()).execute().unwrap();

        let latest = tmp.path().join("ckpt").join("latest");
        cfg.weights = Some(latest.display().to_string());
        let path = TrainUseCase::new(cfg).execute().unwrap();
        assert!(path.join("state.json").is_file());

        // no new rows: header + the first run's two epochs
        let csv = std::fs::read_to_string(tmp.path().join("logs").join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
