// ============================================================
// Layer 5 — Field Tagger Model
// ============================================================
// The training loop only needs three things from a model:
//
//   1. a forward pass producing per-head logits (ModelOutput)
//   2. a way to split it into its two parameter groups, since
//      each group is stepped by its own optimizer
//   3. a way to put the two groups back together
//
// That contract is the `FieldTagger` trait. Validation goes through
// `FieldInference` instead, on the inner backend, so no autodiff
// graph is recorded for held-out batches. The backbones of a
// production model (ResNet + FPN, BERT / RoBERTa, ROI-align grid
// fusion) sit behind it and are none of this crate's business.
//
// `GridTagger` is the small reference implementation used by the
// CLI and the tests:
//
//   visual group    grid_proj : grid_dim → hidden       (token grid features)
//                   seg_heads : grid_dim → aux classes  (one per scale)
//
//   language group  embedding : vocab → hidden
//                   main_1 / main_2 / pos_neg : hidden → classes
//                   transitions [tags, tags]            (crf mode only)
//
//   token repr   = relu(grid_proj(grid)) + embedding(ids)
//
// Which language heads exist follows the classifier mode, so the
// parameter count of each group is fixed by the configuration.
//
// Reference: Burn Book §3 (Building Blocks)
//            Lin et al. (2021) ViBERTgrid

use burn::{
    module::{AutodiffModule, Param},
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{activation::relu, backend::AutodiffBackend},
};

use crate::data::batcher::DocumentBatch;
use crate::domain::config::{ClassifierMode, RunConfig};
use crate::domain::error::{Component, TrainError, TrainResult};

// ─── ModelOutput ──────────────────────────────────────────────────────────────
/// Per-head logits of one batch. Token heads are flattened to
/// [batch * seq_len, classes]; each segmentation scale to
/// [batch * cells_k, aux_classes].
pub struct ModelOutput<B: Backend> {
    pub main_1:      Tensor<B, 2>,
    pub main_2:      Option<Tensor<B, 2>>,
    pub pos_neg:     Option<Tensor<B, 2>>,
    pub aux_scales:  Vec<Tensor<B, 2>>,
    /// CRF transition scores [tags, tags], from → to
    pub transitions: Option<Tensor<B, 2>>,
}

// ─── FieldInference ───────────────────────────────────────────────────────────
/// Forward pass without gradient tracking.
pub trait FieldInference<B: Backend> {
    fn infer(&self, batch: &DocumentBatch<B>) -> TrainResult<ModelOutput<B>>;
}

// ─── FieldTagger ──────────────────────────────────────────────────────────────
/// A two-group model the training loop can drive.
pub trait FieldTagger<B: AutodiffBackend>: Sized {
    /// Parameters stepped by the CNN optimizer
    type Visual: AutodiffModule<B>;
    /// Parameters stepped by the language-model optimizer
    type Language: AutodiffModule<B>;
    /// The same weights on `B::InnerBackend`
    type Inference: FieldInference<B::InnerBackend>;

    fn forward(&self, batch: &DocumentBatch<B>) -> TrainResult<ModelOutput<B>>;

    /// Detached copy for validation.
    fn inference(&self) -> Self::Inference;

    fn visual(&self) -> &Self::Visual;

    fn language(&self) -> &Self::Language;

    fn into_parts(self) -> (Self::Visual, Self::Language);

    fn from_parts(visual: Self::Visual, language: Self::Language) -> Self;
}

// ─── GridTagger configuration ─────────────────────────────────────────────────

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally — do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct GridTaggerConfig {
    pub vocab_size:      usize,
    pub grid_dim:        usize,
    pub hidden_dim:      usize,
    pub main_1_classes:  usize,
    /// 0 = no second main head
    pub main_2_classes:  usize,
    pub pos_neg_head:    bool,
    pub crf_tags:        usize,
    pub aux_classes:     usize,
    pub num_scales:      usize,
}

impl GridTaggerConfig {
    /// Head widths implied by the run configuration.
    pub fn from_run(cfg: &RunConfig) -> Self {
        let num_tags = cfg.num_tags();
        let (main_1, main_2, crf_tags) = match cfg.structure.classifier_mode {
            ClassifierMode::Simp => (num_tags, 0, 0),
            ClassifierMode::Full => (2, num_tags, 0),
            ClassifierMode::Crf  => (num_tags, 0, num_tags),
        };
        Self::new(
            cfg.data.vocab_size,
            cfg.data.grid_dim,
            cfg.structure.hidden_dim,
            main_1,
            main_2,
            cfg.structure.add_pos_neg,
            crf_tags,
            cfg.num_aux_classes(),
            cfg.num_aux_scales(),
        )
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GridTagger<B> {
        let visual = VisualEncoder {
            grid_proj: LinearConfig::new(self.grid_dim, self.hidden_dim).init(device),
            seg_heads: (0..self.num_scales)
                .map(|_| LinearConfig::new(self.grid_dim, self.aux_classes).init(device))
                .collect(),
        };
        let language = LanguageEncoder {
            embedding:   EmbeddingConfig::new(self.vocab_size, self.hidden_dim).init(device),
            main_1:      LinearConfig::new(self.hidden_dim, self.main_1_classes).init(device),
            main_2:      (self.main_2_classes > 0)
                .then(|| LinearConfig::new(self.hidden_dim, self.main_2_classes).init(device)),
            pos_neg:     self.pos_neg_head
                .then(|| LinearConfig::new(self.hidden_dim, 2).init(device)),
            transitions: (self.crf_tags > 0)
                .then(|| Param::from_tensor(Tensor::zeros([self.crf_tags, self.crf_tags], device))),
        };
        GridTagger { visual, language }
    }
}

// ─── Parameter groups ─────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct VisualEncoder<B: Backend> {
    pub grid_proj: Linear<B>,
    pub seg_heads: Vec<Linear<B>>,
}

#[derive(Module, Debug)]
pub struct LanguageEncoder<B: Backend> {
    pub embedding:   Embedding<B>,
    pub main_1:      Linear<B>,
    pub main_2:      Option<Linear<B>>,
    pub pos_neg:     Option<Linear<B>>,
    pub transitions: Option<Param<Tensor<B, 2>>>,
}

// ─── GridTagger ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GridTagger<B: Backend> {
    pub visual:   VisualEncoder<B>,
    pub language: LanguageEncoder<B>,
}

impl<B: Backend> FieldInference<B> for GridTagger<B> {
    fn infer(&self, batch: &DocumentBatch<B>) -> TrainResult<ModelOutput<B>> {
        let [batch_size, seq_len] = batch.token_ids.dims();
        if batch.scale_cells.len() != self.visual.seg_heads.len() {
            return Err(TrainError::invalid_batch(
                Component::Orchestrator,
                None,
                format!(
                    "batch carries {} grid scales, model has {} segmentation heads",
                    batch.scale_cells.len(),
                    self.visual.seg_heads.len()
                ),
            ));
        }

        // Token representation: visual grid feature fused with the embedding
        let grid  = relu(self.visual.grid_proj.forward(batch.token_grid.clone()));
        let emb   = self.language.embedding.forward(batch.token_ids.clone());
        let fused = grid + emb;                                   // [b, L, h]
        let [_, _, hidden] = fused.dims();
        let tokens = fused.reshape([batch_size * seq_len, hidden]); // [b*L, h]

        let main_1  = self.language.main_1.forward(tokens.clone());
        let main_2  = self.language.main_2.as_ref().map(|head| head.forward(tokens.clone()));
        let pos_neg = self.language.pos_neg.as_ref().map(|head| head.forward(tokens));

        let aux_scales = self
            .visual
            .seg_heads
            .iter()
            .zip(&batch.scale_cells)
            .map(|(head, cells)| {
                let [b, n, d] = cells.dims();
                head.forward(cells.clone().reshape([b * n, d]))
            })
            .collect();

        let transitions = self.language.transitions.as_ref().map(|t| t.val());

        Ok(ModelOutput { main_1, main_2, pos_neg, aux_scales, transitions })
    }
}

impl<B: AutodiffBackend> FieldTagger<B> for GridTagger<B> {
    type Visual   = VisualEncoder<B>;
    type Language = LanguageEncoder<B>;
    type Inference = GridTagger<B::InnerBackend>;

    fn forward(&self, batch: &DocumentBatch<B>) -> TrainResult<ModelOutput<B>> {
        self.infer(batch)
    }

    fn inference(&self) -> GridTagger<B::InnerBackend> {
        GridTagger {
            visual:   self.visual.valid(),
            language: self.language.valid(),
        }
    }

    fn visual(&self) -> &VisualEncoder<B> {
        &self.visual
    }

    fn language(&self) -> &LanguageEncoder<B> {
        &self.language
    }

    fn into_parts(self) -> (VisualEncoder<B>, LanguageEncoder<B>) {
        (self.visual, self.language)
    }

    fn from_parts(visual: VisualEncoder<B>, language: LanguageEncoder<B>) -> Self {
        Self { visual, language }
    }
}
