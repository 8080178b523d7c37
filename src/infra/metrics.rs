// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends one CSV row per epoch to `save_log/metrics.csv`.
//
// Columns:
//   epoch, train_loss,
//   one mean loss column per head (main_1, main_2, aux, ...),
//   val_loss, val_accuracy, val_precision, val_recall, val_f1,
//   cnn_lr, cnn_wd, bert_lr, bert_wd, loss_scale
//
// The head columns follow the classifier mode, so a "full" run
// and a "crf" run write different headers. An existing file is
// appended to without a new header, which keeps a resumed run in
// the same log.
//
// Example ("full" mode):
//   epoch,train_loss,main_1,main_2,aux,val_loss,...
//   0,2.310114,0.701342,1.108533,0.500239,2.254871,...
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::HeadId;
use crate::domain::traits::ValidationReport;
use crate::ml::schedule::GroupRates;

/// One row of the metrics log.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch:      usize,
    /// Mean total loss over the epoch's training batches
    pub train_loss: f64,
    /// Mean loss of each head over the epoch's training batches
    pub head_loss:  BTreeMap<HeadId, f64>,
    pub validation: ValidationReport,
    pub cnn:        GroupRates,
    pub lm:         GroupRates,
    pub loss_scale: f64,
}

impl EpochMetrics {
    /// Strictly better F1 than the best so far. Ties do not count.
    pub fn is_improvement(&self, best_f1: Option<f64>) -> bool {
        match best_f1 {
            Some(best) => self.validation.f1 > best,
            None       => true,
        }
    }
}

pub struct MetricsLogger {
    csv_path: PathBuf,
    heads:    Vec<HeadId>,
}

impl MetricsLogger {
    /// Writes the header only if the file does not exist yet.
    pub fn new(dir: impl Into<PathBuf>, heads: Vec<HeadId>) -> TrainResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        let csv_path = dir.join("metrics.csv");

        if !csv_path.exists() {
            let mut header = vec!["epoch".to_string(), "train_loss".to_string()];
            header.extend(heads.iter().map(|h| h.as_str().to_string()));
            header.extend(
                [
                    "val_loss", "val_accuracy", "val_precision", "val_recall", "val_f1",
                    "cnn_lr", "cnn_wd", "bert_lr", "bert_wd", "loss_scale",
                ]
                .map(String::from),
            );
            fs::write(&csv_path, format!("{}\n", header.join(",")))
                .map_err(|source| io_error(&csv_path, source))?;
            tracing::debug!(path = %csv_path.display(), "created metrics log");
        }

        Ok(Self { csv_path, heads })
    }

    pub fn log(&self, m: &EpochMetrics) -> TrainResult<()> {
        let mut row = vec![m.epoch.to_string(), format!("{:.6}", m.train_loss)];
        // A head absent from the epoch (no batches) is logged as NaN
        row.extend(
            self.heads
                .iter()
                .map(|h| format!("{:.6}", m.head_loss.get(h).copied().unwrap_or(f64::NAN))),
        );
        let v = &m.validation;
        row.extend([v.loss, v.accuracy, v.precision, v.recall, v.f1].map(|x| format!("{x:.6}")));
        row.extend(
            [m.cnn.learning_rate, m.cnn.weight_decay, m.lm.learning_rate, m.lm.weight_decay]
                .map(|x| format!("{x:.6e}")),
        );
        row.push(format!("{}", m.loss_scale));

        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .map_err(|source| io_error(&self.csv_path, source))?;
        writeln!(f, "{}", row.join(",")).map_err(|source| io_error(&self.csv_path, source))?;

        tracing::debug!(epoch = m.epoch, train_loss = m.train_loss, val_f1 = v.f1, "logged epoch metrics");
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

fn io_error(path: &Path, source: std::io::Error) -> TrainError {
    TrainError::Io { component: Component::Orchestrator, path: path.to_path_buf(), source }
}
