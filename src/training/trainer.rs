//! Cross-entropy training of the network weights

use std::time::Instant;

use candle_core::{DType, ModuleT, Tensor, D};
use candle_nn::{Optimizer, SGD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::data::Dataset;
use crate::error::{NasError, Result};
use crate::model::WideResNet;

/// Metrics over one pass of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Sample-weighted mean cross-entropy
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
    pub duration_secs: f64,
}

/// SGD over the trainable network variables
pub struct Trainer {
    config: TrainingConfig,
    optimizer: SGD,
    epoch: usize,
    history: Vec<EpochMetrics>,
}

impl Trainer {
    pub fn new(model: &WideResNet, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = SGD::new(model.trainable_vars()?, config.learning_rate)?;
        Ok(Self {
            config,
            optimizer,
            epoch: 0,
            history: Vec::new(),
        })
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    /// One pass over `dataset` in training mode
    pub fn train_epoch(&mut self, model: &WideResNet, dataset: &Dataset) -> Result<EpochMetrics> {
        if dataset.is_empty() {
            return Err(NasError::TrainingError("empty training set".to_string()));
        }
        let start = Instant::now();
        self.epoch += 1;
        let seed = self.config.seed.map(|s| s.wrapping_add(self.epoch as u64));

        let mut totals = Totals::default();
        for (step, batch) in dataset
            .batches(self.config.batch_size, seed, model.device())
            .enumerate()
        {
            let (images, labels) = batch?;
            let logits = model.forward_t(&images, true)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
            self.optimizer.backward_step(&loss)?;

            let batch_loss = loss.to_scalar::<f32>()? as f64;
            if !batch_loss.is_finite() {
                return Err(NasError::TrainingError(format!(
                    "non-finite loss at epoch {} step {}",
                    self.epoch, step
                )));
            }
            totals.add(&logits, &labels, batch_loss)?;
            debug!(epoch = self.epoch, step, loss = batch_loss, "Training step");
        }

        let metrics = totals.finish(self.epoch, start);
        info!(
            epoch = metrics.epoch,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            "Epoch finished"
        );
        self.history.push(metrics.clone());
        Ok(metrics)
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self, model: &WideResNet, dataset: &Dataset) -> Result<Vec<EpochMetrics>> {
        let mut all = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            all.push(self.train_epoch(model, dataset)?);
        }
        Ok(all)
    }
}

/// Loss and accuracy in inference mode
pub fn evaluate(model: &WideResNet, dataset: &Dataset, batch_size: usize) -> Result<EpochMetrics> {
    if dataset.is_empty() {
        return Err(NasError::TrainingError("empty evaluation set".to_string()));
    }
    let start = Instant::now();
    let mut totals = Totals::default();
    for batch in dataset.batches(batch_size, None, model.device()) {
        let (images, labels) = batch?;
        let logits = model.forward_t(&images, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()? as f64;
        totals.add(&logits, &labels, loss)?;
    }
    Ok(totals.finish(0, start))
}

#[derive(Default)]
struct Totals {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl Totals {
    fn add(&mut self, logits: &Tensor, labels: &Tensor, batch_loss: f64) -> Result<()> {
        let n = labels.dim(0)?;
        let correct = logits
            .argmax(D::Minus1)?
            .eq(labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        self.loss_sum += batch_loss * n as f64;
        self.correct += correct as usize;
        self.samples += n;
        Ok(())
    }

    fn finish(self, epoch: usize, start: Instant) -> EpochMetrics {
        let samples = self.samples.max(1) as f64;
        EpochMetrics {
            epoch,
            loss: self.loss_sum / samples,
            accuracy: self.correct as f64 / samples,
            samples: self.samples,
            duration_secs: start.elapsed().as_secs_f64(),
        }
    }
}
