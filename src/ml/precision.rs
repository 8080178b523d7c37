// ============================================================
// Layer 5 — Dynamic Loss Scaling
// ============================================================
// With `amp` on, the loss is multiplied by a scale factor before
// backward so that small gradients survive reduced precision.
// Every group's gradients are divided by the same factor before
// its optimizer sees them.
//
//   scaled loss   = loss * s
//   true grad     = grad(scaled loss) / s
//
// If any unscaled gradient is non-finite the step is skipped for
// BOTH groups and the scale backs off:
//
//   overflow        s = s * backoff_factor,  clean = 0
//   clean step      clean += 1
//   clean == N      s = s * growth_factor,   clean = 0
//
// The scale is held by a ScaleScope for the length of one batch:
// acquired before forward, settled after the optimizer steps. A
// scope that is dropped without being settled (any `?` between
// the two) puts back the state it acquired, so a failed batch
// never leaks a half-updated scale.
//
// With `amp` off the scale is pinned at 1 and every operation is
// the identity.
//
// Reference: Micikevicius et al. (2018) Mixed Precision Training

use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::domain::config::LossScaleConfig;

/// Persistent part of the scaler, stored in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    pub scale:       f64,
    pub clean_steps: usize,
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    cfg:     LossScaleConfig,
    state:   LossScalerState,
}

impl LossScaler {
    pub fn new(cfg: &LossScaleConfig, enabled: bool) -> Self {
        let scale = if enabled { cfg.init_scale } else { 1.0 };
        Self {
            enabled,
            cfg:   cfg.clone(),
            state: LossScalerState { scale, clean_steps: 0 },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.state.scale
    }

    pub fn state(&self) -> LossScalerState {
        self.state
    }

    /// Restore a checkpointed state. Ignored when scaling is off.
    pub fn restore(&mut self, state: LossScalerState) {
        if self.enabled {
            self.state = state;
        }
    }

    /// Take the scale for one batch.
    pub fn acquire(&mut self) -> ScaleScope<'_> {
        let saved = self.state;
        ScaleScope { scaler: self, saved, settled: false }
    }

    fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.state.scale *= self.cfg.backoff_factor;
            self.state.clean_steps = 0;
            tracing::warn!(scale = self.state.scale, "gradient overflow, step skipped");
            return;
        }
        self.state.clean_steps += 1;
        if self.state.clean_steps >= self.cfg.growth_interval {
            self.state.scale *= self.cfg.growth_factor;
            self.state.clean_steps = 0;
            tracing::debug!(scale = self.state.scale, "loss scale grown");
        }
    }
}

// ─── ScaleScope ───────────────────────────────────────────────────────────────
pub struct ScaleScope<'a> {
    scaler:  &'a mut LossScaler,
    saved:   LossScalerState,
    settled: bool,
}

impl ScaleScope<'_> {
    pub fn scale(&self) -> f64 {
        self.saved.scale
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.scaler.enabled {
            loss.mul_scalar(self.saved.scale)
        } else {
            loss
        }
    }

    /// Divide the gradients of `module`'s parameters by the scale.
    /// Returns the gradients and whether any of them overflowed.
    pub fn unscale<B, M>(&self, mut grads: GradientsParams, module: &M) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.scaler.enabled {
            return (grads, false);
        }
        let mut visitor = Unscale::<B> {
            grads:     &mut grads,
            inv_scale: 1.0 / self.saved.scale,
            found_inf: false,
            _backend:  PhantomData,
        };
        module.visit(&mut visitor);
        let found_inf = visitor.found_inf;
        (grads, found_inf)
    }

    /// Close the scope, updating the scale from the step's outcome.
    pub fn settle(mut self, found_inf: bool) {
        self.settled = true;
        self.scaler.update(found_inf);
    }
}

impl Drop for ScaleScope<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.scaler.state = self.saved;
        }
    }
}

struct Unscale<'a, B: AutodiffBackend> {
    grads:     &'a mut GradientsParams,
    inv_scale: f64,
    found_inf: bool,
    _backend:  PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad  = grad.mul_scalar(self.inv_scale);
        let total = grad.clone().sum().into_scalar().elem::<f64>();
        if !total.is_finite() {
            self.found_inf = true;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
