// ============================================================
// Layer 3 — Run Configuration
// ============================================================
// The whole run is parameterised by one JSON document, read
// once at Init and never mutated afterwards.
//
// Key names match the established experiment config files:
//
//   {
//     "device": "cpu", "syncBN": false, "amp": false,
//     "start_epoch": 0, "end_epoch": 100, "batch_size": 4,
//     "optimizer_cnn_hyp":  { "learning_rate": 0.005, "momentum": 0.9, ... },
//     "optimizer_bert_hyp": { "learning_rate": 5e-5, "beta1": 0.9, ... },
//     "num_hard_positive_main_1": 32, ...,
//     "classifier_mode": "full", "tag_mode": "B",
//     "loss_control_lambda": 1.0, "add_pos_neg": false,
//     "save_top": "checkpoints", "save_log": "logs", "weights": "",
//     "data": { ... }
//   }
//
// Every optional key carries a serde default so a missing key
// never changes behaviour in surprising ways. An absent
// `weights` means fresh initialisation, never a resume.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::error::{Component, OptimizerGroup, TrainError, TrainResult};

// ─── Enumerated selectors ────────────────────────────────────────────────────

/// Which head set / loss objective the aggregator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    /// One per-token field classifier, optional pos/neg gate head
    Simp,
    /// Key/non-key head plus field-type head
    Full,
    /// Linear-chain CRF sequence likelihood, no OHEM
    Crf,
}

/// Tagging scheme of the field labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagMode {
    #[serde(rename = "B")]
    B,
    #[serde(rename = "BIO")]
    Bio,
}

/// Where tensors live. Parsed from the free-form `device` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Wgpu,
}

// ─── Optimizer group ─────────────────────────────────────────────────────────

/// Hyper-parameters of one optimizer group (CNN or language model).
/// A group is SGD when it sets `momentum`, AdamW when it sets the betas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerGroupConfig {
    pub learning_rate: f64,

    #[serde(default)]
    pub min_learning_rate: f64,

    #[serde(rename = "warm_up_epoches", default)]
    pub warmup_epochs: usize,

    #[serde(rename = "warm_up_init_lr", default)]
    pub warmup_init_lr: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta1: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta2: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,

    #[serde(default)]
    pub weight_decay: f64,

    #[serde(default)]
    pub min_weight_decay: f64,

    /// Gradient norm clipping; off unless set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_clip_norm: Option<f64>,
}

/// The update rule a group resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    Sgd { momentum: f64 },
    AdamW { beta1: f64, beta2: f64, epsilon: f64 },
}

impl UpdateRule {
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateRule::Sgd { .. }   => "sgd",
            UpdateRule::AdamW { .. } => "adamw",
        }
    }
}

impl OptimizerGroupConfig {
    /// Resolve the update rule. A group naming neither momentum nor
    /// betas gets its group's conventional rule (SGD for the CNN,
    /// AdamW for the language model).
    pub fn update_rule(&self, group: OptimizerGroup) -> TrainResult<UpdateRule> {
        let has_betas = self.beta1.is_some() || self.beta2.is_some() || self.epsilon.is_some();
        match (self.momentum, has_betas, group) {
            (Some(_), true, _) => Err(TrainError::config(
                Component::Schedule,
                format!("optimizer group '{group}' sets both momentum and AdamW betas"),
            )),
            (Some(momentum), false, _) => Ok(UpdateRule::Sgd { momentum }),
            (None, true, _) | (None, false, OptimizerGroup::LanguageModel) => Ok(UpdateRule::AdamW {
                beta1:   self.beta1.unwrap_or(0.9),
                beta2:   self.beta2.unwrap_or(0.999),
                epsilon: self.epsilon.unwrap_or(1e-8),
            }),
            (None, false, OptimizerGroup::Cnn) => Ok(UpdateRule::Sgd { momentum: 0.9 }),
        }
    }

    fn validate(&self, group: OptimizerGroup, total_epochs: usize) -> TrainResult<()> {
        let err = |msg: String| Err(TrainError::config(Component::Schedule, format!("group '{group}': {msg}")));

        let rates = [
            ("learning_rate", self.learning_rate),
            ("min_learning_rate", self.min_learning_rate),
            ("warm_up_init_lr", self.warmup_init_lr),
            ("weight_decay", self.weight_decay),
            ("min_weight_decay", self.min_weight_decay),
        ];
        for (name, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return err(format!("{name} must be a finite non-negative number, got {value}"));
            }
        }
        if self.learning_rate <= 0.0 {
            return err("learning_rate must be positive".into());
        }
        if self.min_learning_rate > self.learning_rate {
            return err(format!(
                "min_learning_rate {} exceeds learning_rate {}",
                self.min_learning_rate, self.learning_rate
            ));
        }
        if self.min_weight_decay > self.weight_decay {
            return err(format!(
                "min_weight_decay {} exceeds weight_decay {}",
                self.min_weight_decay, self.weight_decay
            ));
        }
        if self.warmup_epochs > total_epochs {
            return err(format!(
                "warm_up_epoches {} is longer than the run ({} epochs)",
                self.warmup_epochs, total_epochs
            ));
        }
        if let Some(norm) = self.grad_clip_norm {
            if !norm.is_finite() || norm <= 0.0 {
                return err(format!("grad_clip_norm must be positive, got {norm}"));
            }
        }
        self.update_rule(group).map(|_| ())
    }
}

// ─── OHEM head budgets ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OhemConfig {
    pub num_hard_positive_main_1: usize,
    pub num_hard_negative_main_1: usize,
    pub num_hard_positive_main_2: usize,
    pub num_hard_negative_main_2: usize,
    /// Per-scale presample caps of the auxiliary segmentation head,
    /// one entry per scale, finest first.
    pub loss_aux_sample_list: Vec<usize>,
    pub num_hard_positive_aux: usize,
    pub num_hard_negative_aux: usize,
    /// Gate head budget; falls back to main-1's budget when absent.
    pub num_hard_positive_pos_neg: Option<usize>,
    pub num_hard_negative_pos_neg: Option<usize>,
    /// Uniform random presampling before ranking.
    pub ohem_random: bool,
    /// Presample cap of single-scale heads as a multiple of their
    /// hard budget.
    pub ohem_presample_ratio: usize,
}

impl Default for OhemConfig {
    fn default() -> Self {
        Self {
            num_hard_positive_main_1:  32,
            num_hard_negative_main_1:  64,
            num_hard_positive_main_2:  32,
            num_hard_negative_main_2:  64,
            loss_aux_sample_list:      vec![256, 512, 256],
            num_hard_positive_aux:     128,
            num_hard_negative_aux:     256,
            num_hard_positive_pos_neg: None,
            num_hard_negative_pos_neg: None,
            ohem_random:               false,
            ohem_presample_ratio:      2,
        }
    }
}

// ─── Model structure selectors ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelStructure {
    pub classifier_mode:     ClassifierMode,
    pub tag_mode:            TagMode,
    pub loss_control_lambda: f64,
    pub add_pos_neg:         bool,
    /// Width of the fused token representation in the reference model.
    pub hidden_dim:          usize,
}

impl Default for ModelStructure {
    fn default() -> Self {
        Self {
            classifier_mode:     ClassifierMode::Full,
            tag_mode:            TagMode::B,
            loss_control_lambda: 1.0,
            add_pos_neg:         false,
            hidden_dim:          32,
        }
    }
}

// ─── Dynamic loss scaling (mixed precision) ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossScaleConfig {
    pub init_scale:      f64,
    pub growth_factor:   f64,
    pub backoff_factor:  f64,
    pub growth_interval: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            init_scale:      65536.0,
            growth_factor:   2.0,
            backoff_factor:  0.5,
            growth_interval: 2000,
        }
    }
}

// ─── Data section (consumed by the document source only) ─────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of field types, excluding background
    pub num_fields:     usize,
    pub vocab_size:     usize,
    /// Width of the per-token / per-cell grid feature vector
    pub grid_dim:       usize,
    pub max_seq_len:    usize,
    /// Grid side length of the finest segmentation scale
    pub grid_size:      usize,
    pub image_mean:     [f32; 3],
    pub image_std:      [f32; 3],
    pub min_size:       Vec<u32>,
    pub max_size:       Vec<u32>,
    pub num_train_docs: usize,
    pub num_val_docs:   usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_fields:     6,
            vocab_size:     512,
            grid_dim:       16,
            max_seq_len:    64,
            grid_size:      16,
            image_mean:     [0.948, 0.948, 0.948],
            image_std:      [0.184, 0.184, 0.184],
            min_size:       vec![320, 416, 512, 608, 704],
            max_size:       vec![800],
            num_train_docs: 64,
            num_val_docs:   16,
        }
    }
}

// ─── RunConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_device")]
    pub device: String,

    /// Synchronized batch norm (distributed training)
    #[serde(rename = "syncBN", default)]
    pub sync_bn: bool,

    /// Mixed precision with dynamic loss scaling
    #[serde(default)]
    pub amp: bool,

    #[serde(default)]
    pub start_epoch: usize,

    pub end_epoch: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    pub optimizer_cnn_hyp:  OptimizerGroupConfig,
    pub optimizer_bert_hyp: OptimizerGroupConfig,

    #[serde(flatten)]
    pub ohem: OhemConfig,

    #[serde(flatten)]
    pub structure: ModelStructure,

    #[serde(default = "default_save_top")]
    pub save_top: String,

    #[serde(default = "default_save_log")]
    pub save_log: String,

    /// Checkpoint directory to resume from; empty or absent = fresh run
    #[serde(default)]
    pub weights: Option<String>,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub loss_scale: LossScaleConfig,

    #[serde(default)]
    pub data: DataConfig,
}

fn default_device()     -> String { "cpu".to_string() }
fn default_batch_size() -> usize  { 4 }
fn default_save_top()   -> String { "checkpoints".to_string() }
fn default_save_log()   -> String { "logs".to_string() }

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device:      default_device(),
            sync_bn:     false,
            amp:         false,
            start_epoch: 0,
            end_epoch:   30,
            batch_size:  default_batch_size(),
            optimizer_cnn_hyp: OptimizerGroupConfig {
                learning_rate:     0.005,
                min_learning_rate: 1e-5,
                warmup_epochs:     2,
                warmup_init_lr:    1e-5,
                momentum:          Some(0.9),
                beta1:             None,
                beta2:             None,
                epsilon:           None,
                weight_decay:      0.005,
                min_weight_decay:  0.0005,
                grad_clip_norm:    None,
            },
            optimizer_bert_hyp: OptimizerGroupConfig {
                learning_rate:     5e-5,
                min_learning_rate: 1e-6,
                warmup_epochs:     2,
                warmup_init_lr:    1e-6,
                momentum:          None,
                beta1:             Some(0.9),
                beta2:             Some(0.999),
                epsilon:           Some(1e-8),
                weight_decay:      0.01,
                min_weight_decay:  0.001,
                grad_clip_norm:    None,
            },
            ohem:       OhemConfig::default(),
            structure:  ModelStructure::default(),
            save_top:   default_save_top(),
            save_log:   default_save_log(),
            weights:    None,
            seed:       None,
            loss_scale: LossScaleConfig::default(),
            data:       DataConfig::default(),
        }
    }
}

impl RunConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> TrainResult<Self> {
        let cfg: RunConfig = serde_json::from_str(json)
            .map_err(|e| TrainError::config(Component::Orchestrator, format!("cannot parse configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| TrainError::Io {
            component: Component::Orchestrator,
            path:      path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Number of epochs this run spans.
    pub fn total_epochs(&self) -> usize {
        self.end_epoch.saturating_sub(self.start_epoch)
    }

    /// Number of tags the token classifiers predict, background included.
    pub fn num_tags(&self) -> usize {
        match self.structure.tag_mode {
            TagMode::B   => self.data.num_fields + 1,
            TagMode::Bio => 2 * self.data.num_fields + 1,
        }
    }

    /// Background / "O" tag — always the last index.
    pub fn background_tag(&self) -> usize {
        self.num_tags() - 1
    }

    /// Number of auxiliary segmentation classes (fields + background).
    pub fn num_aux_classes(&self) -> usize {
        self.data.num_fields + 1
    }

    /// Number of segmentation scales the model must emit.
    pub fn num_aux_scales(&self) -> usize {
        match self.structure.classifier_mode {
            ClassifierMode::Crf => 0,
            _ => self.ohem.loss_aux_sample_list.len(),
        }
    }

    /// Resume directory, with an empty string treated as absent.
    pub fn resume_path(&self) -> Option<PathBuf> {
        self.weights
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn device_kind(&self) -> TrainResult<DeviceKind> {
        let device = self.device.trim().to_ascii_lowercase();
        if device == "cpu" {
            Ok(DeviceKind::Cpu)
        } else if device == "wgpu" || device == "gpu" || device.starts_with("cuda") {
            Ok(DeviceKind::Wgpu)
        } else {
            Err(TrainError::config(
                Component::Orchestrator,
                format!("unknown device '{}'", self.device),
            ))
        }
    }

    /// Reject missing or contradictory settings. Fatal at Init.
    pub fn validate(&self) -> TrainResult<()> {
        let orchestrator = |msg: String| Err(TrainError::config(Component::Orchestrator, msg));

        if self.end_epoch <= self.start_epoch {
            return orchestrator(format!(
                "end_epoch {} must be greater than start_epoch {}",
                self.end_epoch, self.start_epoch
            ));
        }
        if self.batch_size == 0 {
            return orchestrator("batch_size must be at least 1".into());
        }
        self.device_kind()?;

        let total = self.total_epochs();
        self.optimizer_cnn_hyp.validate(OptimizerGroup::Cnn, total)?;
        self.optimizer_bert_hyp.validate(OptimizerGroup::LanguageModel, total)?;

        let lambda = self.structure.loss_control_lambda;
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(TrainError::config(
                Component::Aggregator,
                format!("loss_control_lambda must be finite and non-negative, got {lambda}"),
            ));
        }
        if self.structure.add_pos_neg && self.structure.classifier_mode != ClassifierMode::Simp {
            return Err(TrainError::config(
                Component::Aggregator,
                format!(
                    "add_pos_neg is only available in 'simp' mode, not {:?}",
                    self.structure.classifier_mode
                ),
            ));
        }
        if self.structure.classifier_mode != ClassifierMode::Crf && self.ohem.loss_aux_sample_list.is_empty() {
            return Err(TrainError::config(
                Component::Sampler,
                "loss_aux_sample_list must name at least one scale",
            ));
        }
        if self.ohem.ohem_presample_ratio == 0 {
            return Err(TrainError::config(Component::Sampler, "ohem_presample_ratio must be at least 1"));
        }
        if self.data.num_fields == 0 {
            return orchestrator("data.num_fields must be at least 1".into());
        }
        if self.structure.hidden_dim == 0 || self.data.grid_dim == 0 {
            return orchestrator("hidden_dim and data.grid_dim must be positive".into());
        }
        if self.data.max_seq_len == 0 {
            return orchestrator("data.max_seq_len must be at least 1".into());
        }
        // token id 0 is padding, so real tokens need at least one more id
        if self.data.vocab_size < 2 {
            return orchestrator(format!("data.vocab_size must be at least 2, got {}", self.data.vocab_size));
        }
        let scaler = &self.loss_scale;
        if self.amp
            && (scaler.init_scale <= 0.0
                || scaler.growth_factor < 1.0
                || !(0.0..1.0).contains(&scaler.backoff_factor)
                || scaler.growth_interval == 0)
        {
            return orchestrator("loss_scale settings are inconsistent".into());
        }
        Ok(())
    }
}
