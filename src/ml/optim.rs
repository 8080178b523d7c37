// ============================================================
// Layer 5 — Optimizer Groups
// ============================================================
// The model is trained by two optimizers over disjoint
// parameter groups:
//
//   cnn   visual backbone   usually SGD + momentum
//   bert  language model    usually AdamW
//
// Each GroupOptimizer exclusively owns its moment buffers; the
// two never alias and never see each other's gradients.
//
// Burn bakes weight decay into the optimizer config, but the
// schedule changes it every epoch. Changing it means building a
// fresh optimizer from the new config and loading the old
// record into it, which carries the momentum / Adam moments
// over unchanged:
//
//   fresh = new_cfg.init().load_record(old.to_record())
//
// The learning rate is not part of the config; it is passed to
// every `step` call.
//
// Reference: Burn Book §5 (Optimizers)
//            Loshchilov & Hutter (2019) Decoupled Weight Decay

use std::path::Path;

use burn::{
    module::AutodiffModule,
    optim::{
        adaptor::OptimizerAdaptor,
        decay::WeightDecayConfig,
        momentum::MomentumConfig,
        AdamW, AdamWConfig, GradientsParams, Optimizer, Sgd, SgdConfig,
    },
    grad_clipping::GradientClippingConfig,
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::AutodiffBackend,
};

use crate::domain::config::UpdateRule;
use crate::domain::error::{Component, OptimizerGroup, TrainError, TrainResult};

type SgdAdaptor<M, B>   = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;
type AdamWAdaptor<M, B> = OptimizerAdaptor<AdamW, M, B>;

enum Inner<M: AutodiffModule<B>, B: AutodiffBackend> {
    Sgd(SgdAdaptor<M, B>),
    AdamW(AdamWAdaptor<M, B>),
}

pub struct GroupOptimizer<M: AutodiffModule<B>, B: AutodiffBackend> {
    group:        OptimizerGroup,
    rule:         UpdateRule,
    clip_norm:    Option<f64>,
    weight_decay: f64,
    inner:        Inner<M, B>,
}

impl<M: AutodiffModule<B>, B: AutodiffBackend> GroupOptimizer<M, B> {
    pub fn new(group: OptimizerGroup, rule: UpdateRule, clip_norm: Option<f64>, weight_decay: f64) -> Self {
        let inner = build(rule, clip_norm, weight_decay);
        Self { group, rule, clip_norm, weight_decay, inner }
    }

    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    pub fn clip_norm(&self) -> Option<f64> {
        self.clip_norm
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    /// Swap in a new weight decay, keeping all moment buffers.
    pub fn set_weight_decay(&mut self, weight_decay: f64) {
        if weight_decay == self.weight_decay {
            return;
        }
        let fresh = build::<M, B>(self.rule, self.clip_norm, weight_decay);
        self.inner = match (&self.inner, fresh) {
            (Inner::Sgd(old), Inner::Sgd(new))     => Inner::Sgd(new.load_record(old.to_record())),
            (Inner::AdamW(old), Inner::AdamW(new)) => Inner::AdamW(new.load_record(old.to_record())),
            // `build` always follows `self.rule`, so the kinds agree
            (_, other) => other,
        };
        self.weight_decay = weight_decay;
    }

    /// One update of this group's module.
    pub fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        match &mut self.inner {
            Inner::Sgd(optim)   => optim.step(lr, module, grads),
            Inner::AdamW(optim) => optim.step(lr, module, grads),
        }
    }

    /// Write the moment buffers to `<path>.bin` at full precision.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let result = match &self.inner {
            Inner::Sgd(optim)   => Recorder::<B>::record(&recorder, optim.to_record(), path.to_path_buf()),
            Inner::AdamW(optim) => Recorder::<B>::record(&recorder, optim.to_record(), path.to_path_buf()),
        };
        result.map_err(|e| TrainError::Record {
            component: Component::Checkpoint,
            path:      path.to_path_buf(),
            msg:       format!("cannot save '{}' optimizer state: {e:?}", self.group),
        })
    }

    /// Restore moment buffers written by `save`. A record of the
    /// wrong kind is a resume mismatch.
    pub fn load(&mut self, path: &Path, device: &B::Device) -> TrainResult<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let mismatch = |e: burn::record::RecorderError| TrainError::ResumeMismatch {
            component: Component::Checkpoint,
            group:     Some(self.group),
            path:      path.to_path_buf(),
            msg:       format!("cannot restore {} optimizer state: {e:?}", self.rule.kind()),
        };
        self.inner = match &self.inner {
            Inner::Sgd(optim) => {
                let record = Recorder::<B>::load(&recorder, path.to_path_buf(), device).map_err(mismatch)?;
                Inner::Sgd(optim.clone().load_record(record))
            }
            Inner::AdamW(optim) => {
                let record = Recorder::<B>::load(&recorder, path.to_path_buf(), device).map_err(mismatch)?;
                Inner::AdamW(optim.clone().load_record(record))
            }
        };
        Ok(())
    }
}

fn build<M: AutodiffModule<B>, B: AutodiffBackend>(
    rule:         UpdateRule,
    clip_norm:    Option<f64>,
    weight_decay: f64,
) -> Inner<M, B> {
    let clipping = clip_norm.map(|norm| GradientClippingConfig::Norm(norm as f32));
    let decay    = (weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay as f32));
    match rule {
        UpdateRule::Sgd { momentum } => {
            let momentum = (momentum > 0.0).then(|| MomentumConfig {
                momentum,
                dampening: 0.0,
                nesterov:  false,
            });
            Inner::Sgd(
                SgdConfig::new()
                    .with_momentum(momentum)
                    .with_weight_decay(decay)
                    .with_gradient_clipping(clipping)
                    .init(),
            )
        }
        UpdateRule::AdamW { beta1, beta2, epsilon } => Inner::AdamW(
            AdamWConfig::new()
                .with_beta_1(beta1 as f32)
                .with_beta_2(beta2 as f32)
                .with_epsilon(epsilon as f32)
                .with_weight_decay(weight_decay as f32)
                .with_grad_clipping(clipping)
                .init(),
        ),
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use burn::prelude::*;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn loss_of(model: &Linear<TestBackend>) -> Tensor<TestBackend, 1> {
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, -2.0, 0.5, 3.0], [2, 2]),
            &Default::default(),
        );
        model.forward(x).powf_scalar(2.0).mean()
    }

    fn step(optim: &mut GroupOptimizer<Linear<TestBackend>, TestBackend>, model: Linear<TestBackend>) -> Linear<TestBackend> {
        let grads = loss_of(&model).backward();
        let grads = GradientsParams::from_grads(grads, &model);
        optim.step(0.01, model, grads)
    }

    fn weights(model: &Linear<TestBackend>) -> Vec<f32> {
        model.weight.val().into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn sgd() -> UpdateRule {
        UpdateRule::Sgd { momentum: 0.9 }
    }

    #[test]
    fn test_weight_decay_swap_keeps_momentum() {
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);

        // Two optimizers that take the same two steps; one gets its
        // weight decay swapped back and forth in between.
        let mut plain   = GroupOptimizer::new(OptimizerGroup::Cnn, sgd(), None, 0.01);
        let mut swapped = GroupOptimizer::new(OptimizerGroup::Cnn, sgd(), None, 0.01);

        let a = step(&mut plain, model.clone());
        let b = step(&mut swapped, model);
        swapped.set_weight_decay(0.02);
        swapped.set_weight_decay(0.01);
        assert_eq!(swapped.weight_decay(), 0.01);

        let a = step(&mut plain, a);
        let b = step(&mut swapped, b);
        assert_eq!(weights(&a), weights(&b));
    }

    #[test]
    fn test_saved_state_restores_identical_updates() {
        let device = Default::default();
        let dir    = tempfile::tempdir().unwrap();
        let path   = dir.path().join("optim_bert");
        let rule   = UpdateRule::AdamW { beta1: 0.9, beta2: 0.999, epsilon: 1e-8 };
        let model: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);

        let mut original = GroupOptimizer::new(OptimizerGroup::LanguageModel, rule, None, 0.01);
        let model = step(&mut original, model);
        original.save(&path).unwrap();

        let mut restored = GroupOptimizer::new(OptimizerGroup::LanguageModel, rule, None, 0.01);
        restored.load(&path, &device).unwrap();

        let a = step(&mut original, model.clone());
        let b = step(&mut restored, model);
        assert_eq!(weights(&a), weights(&b));
    }

    #[test]
    fn test_missing_record_is_resume_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut optim: GroupOptimizer<Linear<TestBackend>, TestBackend> =
            GroupOptimizer::new(OptimizerGroup::Cnn, sgd(), Some(1.0), 0.0);
        let err = optim.load(&dir.path().join("absent"), &Default::default()).unwrap_err();
        assert!(matches!(err, TrainError::ResumeMismatch { group: Some(OptimizerGroup::Cnn), .. }));
    }
}
