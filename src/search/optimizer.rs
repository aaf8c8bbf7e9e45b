//! Gradient updates for the architecture parameters

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::TrainingConfig;
use crate::error::{NasError, Result};

/// AdamW over the architecture parameters only
pub struct ArchitectureOptimizer {
    inner: AdamW,
    steps: usize,
}

impl ArchitectureOptimizer {
    pub fn new(params: Vec<Var>, learning_rate: f64, weight_decay: f64) -> Result<Self> {
        let params_adamw = ParamsAdamW {
            lr: learning_rate,
            weight_decay,
            ..Default::default()
        };
        Ok(Self {
            inner: AdamW::new(params, params_adamw)?,
            steps: 0,
        })
    }

    pub fn from_config(params: Vec<Var>, config: &TrainingConfig) -> Result<Self> {
        Self::new(params, config.arch_learning_rate, config.arch_weight_decay)
    }

    /// Backpropagate `loss` and update the alphas
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        self.inner.backward_step(loss)?;
        self.steps += 1;
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Differentiable surrogate `sum(weights * candidate_losses)`.
///
/// `candidate_losses[i][j]` is the validation loss of candidate `j` in block `i`;
/// the result pulls the alphas towards the cheaper candidates.
pub fn expected_loss(weights: &Tensor, candidate_losses: &Tensor) -> Result<Tensor> {
    if weights.dims() != candidate_losses.dims() {
        return Err(NasError::ShapeError {
            name: "candidate_losses".to_string(),
            expected: format!("{:?}", weights.dims()),
            actual: format!("{:?}", candidate_losses.dims()),
        });
    }
    let losses = candidate_losses.to_dtype(weights.dtype())?.detach();
    Ok(weights.mul(&losses)?.sum_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ArchitectureParameters;
    use candle_core::Device;

    #[test]
    fn test_expected_loss_shape_check() {
        let device = Device::Cpu;
        let w = Tensor::ones((2, 3), candle_core::DType::F32, &device).unwrap();
        let l = Tensor::ones((3, 2), candle_core::DType::F32, &device).unwrap();
        assert!(expected_loss(&w, &l).is_err());

        let l = Tensor::new(&[[1f32, 2.0, 3.0], [0.0, 0.0, 1.0]], &device).unwrap();
        let loss = expected_loss(&w, &l).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_alphas_move_towards_cheap_candidate() {
        let device = Device::Cpu;
        let arch = ArchitectureParameters::new(4, 3, 1.0, false, Some(11), &device).unwrap();
        let mut optimizer = ArchitectureOptimizer::new(arch.arch_parameters(), 0.5, 0.0).unwrap();

        let row = [1f32, 1.0, 0.0];
        let losses = Tensor::new(&[row, row, row, row], &device).unwrap();
        for _ in 0..200 {
            let weights = arch.arch_weights(false).unwrap();
            let loss = expected_loss(&weights, &losses).unwrap();
            optimizer.step(&loss).unwrap();
        }

        assert_eq!(optimizer.steps(), 200);
        assert_eq!(arch.combination().unwrap(), vec![2, 2, 2, 2]);
    }
}
