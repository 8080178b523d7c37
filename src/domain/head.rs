// ============================================================
// Layer 3 — Loss Heads
// ============================================================
// A "head" is one independent classification output of the
// model with its own loss and its own hard-example budget.
//
// Which heads exist depends on the classifier mode, so the
// head set is built at Init as an ordered Vec<HeadSpec> rather
// than as hard-coded struct fields:
//
//   simp → [Main1 (field type), PosNeg gate?, Auxiliary]
//   full → [Main1 (key / non-key), Main2 (field type), Auxiliary]
//   crf  → [Crf]
//
// Label conventions:
//   - field-type heads: the background ("O") tag is the LAST class
//   - binary heads:     1 = key (field) token, 0 = background
//   - auxiliary head:   per grid cell, fields + background (last)
//
// A token is a "positive" for a head when its label differs from
// that head's background class.

use serde::Serialize;

use crate::domain::config::{ClassifierMode, RunConfig};

// ─── HeadId ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HeadId {
    Main1,
    Main2,
    PosNeg,
    Auxiliary,
    Crf,
}

impl HeadId {
    /// Column name used by the metrics log.
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadId::Main1     => "main_1",
            HeadId::Main2     => "main_2",
            HeadId::PosNeg    => "pos_neg",
            HeadId::Auxiliary => "aux",
            HeadId::Crf       => "crf",
        }
    }

    /// Main heads are summed unweighted; only the auxiliary head is
    /// scaled by `loss_control_lambda`.
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, HeadId::Auxiliary)
    }
}

// ─── HeadTarget ───────────────────────────────────────────────────────────────
/// What a head's labels are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadTarget {
    /// Per-token field tag (B or BIO scheme)
    FieldType,
    /// Per-token binary key / non-key flag derived from the field tag
    KeyFlag,
    /// Per-grid-cell field class, one label map per scale
    Segmentation,
    /// Whole tag sequence, scored by the CRF
    Sequence,
}

// ─── HeadSpec ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct HeadSpec {
    pub head_id:              HeadId,
    pub target:               HeadTarget,
    pub num_classes:          usize,
    pub background_class:     usize,
    pub num_hard_positive:    usize,
    pub num_hard_negative:    usize,
    /// Per-scale presample caps; empty for single-scale heads.
    pub presample_sizes:      Vec<usize>,
    /// Presample cap of a single-scale head, as a multiple of its
    /// hard budget.
    pub presample_ratio:      usize,
    pub use_random_presample: bool,
}

impl HeadSpec {
    /// Number of scales the sampler visits for this head.
    pub fn num_scales(&self) -> usize {
        self.presample_sizes.len().max(1)
    }

    /// Presample cap for one side of one scale.
    pub fn presample_cap(&self, scale: usize, num_hard: usize) -> usize {
        match self.presample_sizes.get(scale) {
            Some(&cap) => cap,
            None       => num_hard.saturating_mul(self.presample_ratio),
        }
    }

    /// CRF heads train on whole sequences and bypass the sampler.
    pub fn uses_ohem(&self) -> bool {
        self.target != HeadTarget::Sequence
    }

    pub fn is_positive(&self, label: usize) -> bool {
        label != self.background_class
    }
}

/// Build the ordered head set for the configured classifier mode.
pub fn build_head_specs(cfg: &RunConfig) -> Vec<HeadSpec> {
    let ohem       = &cfg.ohem;
    let num_tags   = cfg.num_tags();
    let background = cfg.background_tag();

    let token_head = |head_id, target, num_classes, background_class, pos, neg| HeadSpec {
        head_id,
        target,
        num_classes,
        background_class,
        num_hard_positive:    pos,
        num_hard_negative:    neg,
        presample_sizes:      Vec::new(),
        presample_ratio:      ohem.ohem_presample_ratio,
        use_random_presample: ohem.ohem_random,
    };

    let aux_head = HeadSpec {
        head_id:              HeadId::Auxiliary,
        target:               HeadTarget::Segmentation,
        num_classes:          cfg.num_aux_classes(),
        background_class:     cfg.num_aux_classes() - 1,
        num_hard_positive:    ohem.num_hard_positive_aux,
        num_hard_negative:    ohem.num_hard_negative_aux,
        presample_sizes:      ohem.loss_aux_sample_list.clone(),
        presample_ratio:      ohem.ohem_presample_ratio,
        use_random_presample: ohem.ohem_random,
    };

    match cfg.structure.classifier_mode {
        ClassifierMode::Simp => {
            let mut heads = vec![token_head(
                HeadId::Main1,
                HeadTarget::FieldType,
                num_tags,
                background,
                ohem.num_hard_positive_main_1,
                ohem.num_hard_negative_main_1,
            )];
            if cfg.structure.add_pos_neg {
                heads.push(token_head(
                    HeadId::PosNeg,
                    HeadTarget::KeyFlag,
                    2,
                    0,
                    ohem.num_hard_positive_pos_neg.unwrap_or(ohem.num_hard_positive_main_1),
                    ohem.num_hard_negative_pos_neg.unwrap_or(ohem.num_hard_negative_main_1),
                ));
            }
            heads.push(aux_head);
            heads
        }
        ClassifierMode::Full => vec![
            token_head(
                HeadId::Main1,
                HeadTarget::KeyFlag,
                2,
                0,
                ohem.num_hard_positive_main_1,
                ohem.num_hard_negative_main_1,
            ),
            token_head(
                HeadId::Main2,
                HeadTarget::FieldType,
                num_tags,
                background,
                ohem.num_hard_positive_main_2,
                ohem.num_hard_negative_main_2,
            ),
            aux_head,
        ],
        ClassifierMode::Crf => vec![HeadSpec {
            head_id:              HeadId::Crf,
            target:               HeadTarget::Sequence,
            num_classes:          num_tags,
            background_class:     background,
            num_hard_positive:    0,
            num_hard_negative:    0,
            presample_sizes:      Vec::new(),
            presample_ratio:      ohem.ohem_presample_ratio,
            use_random_presample: false,
        }],
    }
}
