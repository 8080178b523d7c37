// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every failure of the training-control layer is one of these.
// All of them terminate the run: hard-example statistics and
// optimizer moments are stateful across epochs, so there is no
// epoch-level retry anywhere in the crate.
//
// A head with no candidates in a batch is NOT an error — the
// sampler returns an empty selection and the loss term is zero.
//
// Each variant names the component that raised it and, where it
// applies, the head or optimizer group involved.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::head::HeadId;

/// The training-control component that raised a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Schedule,
    Sampler,
    Aggregator,
    Orchestrator,
    Checkpoint,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Schedule     => "schedule",
            Component::Sampler      => "sampler",
            Component::Aggregator   => "aggregator",
            Component::Orchestrator => "orchestrator",
            Component::Checkpoint   => "checkpoint",
        };
        f.write_str(name)
    }
}

/// The two disjoint parameter groups, each with its own optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerGroup {
    /// Visual backbone (CNN + FPN + grid fusion)
    Cnn,
    /// Language-model backbone and classification heads
    LanguageModel,
}

impl fmt::Display for OptimizerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerGroup::Cnn           => f.write_str("cnn"),
            OptimizerGroup::LanguageModel => f.write_str("bert"),
        }
    }
}

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// Missing or contradictory configuration. Fatal at Init.
    #[error("configuration error [{component}]: {msg}")]
    Configuration { component: Component, msg: String },

    /// The loss (or a head's contribution to it) became non-finite.
    #[error("numeric instability [{component}] in head {head:?}: loss = {value}")]
    NumericInstability {
        component: Component,
        head:      Option<HeadId>,
        value:     f64,
    },

    /// A checkpoint does not match the current run configuration.
    /// Raised before anything from the checkpoint is applied.
    #[error("resume mismatch [{component}] for {group:?} at {path}: {msg}")]
    ResumeMismatch {
        component: Component,
        group:     Option<OptimizerGroup>,
        path:      PathBuf,
        msg:       String,
    },

    /// Logits / labels / masks handed in by the forward pass do not
    /// agree with each other or with the configured heads.
    #[error("invalid batch [{component}] in head {head:?}: {msg}")]
    InvalidBatch {
        component: Component,
        head:      Option<HeadId>,
        msg:       String,
    },

    #[error("io error [{component}] at {path}: {source}")]
    Io {
        component: Component,
        path:      PathBuf,
        #[source]
        source:    std::io::Error,
    },

    #[error("record error [{component}] at {path}: {msg}")]
    Record {
        component: Component,
        path:      PathBuf,
        msg:       String,
    },
}

impl TrainError {
    pub fn config(component: Component, msg: impl Into<String>) -> Self {
        TrainError::Configuration { component, msg: msg.into() }
    }

    pub fn invalid_batch(component: Component, head: Option<HeadId>, msg: impl Into<String>) -> Self {
        TrainError::InvalidBatch { component, head, msg: msg.into() }
    }

    /// The component that raised this failure.
    pub fn component(&self) -> Component {
        match self {
            TrainError::Configuration { component, .. }
            | TrainError::NumericInstability { component, .. }
            | TrainError::ResumeMismatch { component, .. }
            | TrainError::InvalidBatch { component, .. }
            | TrainError::Io { component, .. }
            | TrainError::Record { component, .. } => *component,
        }
    }
}
