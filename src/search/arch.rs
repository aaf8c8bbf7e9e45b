//! Architecture parameters (alphas) and their Gumbel-Softmax sampler

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::debug;

use super::gumbel::{gumbel_like, gumbel_softmax};
use crate::error::{NasError, Result};

const ALPHA_INIT_SCALE: f64 = 1e-3;

/// Trainable architecture logits, one row per searchable block.
///
/// The Gumbel noise is drawn once and reused by every call to
/// [`arch_weights`](Self::arch_weights) until [`resample_gumbel`](Self::resample_gumbel).
#[derive(Debug)]
pub struct ArchitectureParameters {
    alphas: Var,
    gumbel: Tensor,
    tau: f64,
    hard: bool,
    rng: Xoshiro256PlusPlus,
}

impl ArchitectureParameters {
    pub fn new(
        num_blocks: usize,
        num_ops: usize,
        tau: f64,
        hard: bool,
        seed: Option<u64>,
        device: &Device,
    ) -> Result<Self> {
        if num_blocks == 0 || num_ops == 0 {
            return Err(NasError::invalid(
                "arch shape",
                format!("{}x{}", num_blocks, num_ops),
                "must be non-empty",
            ));
        }
        if !(tau > 0.0) {
            return Err(NasError::invalid("tau", tau, "must be positive"));
        }

        let mut rng = match seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        let values: Vec<f32> = (0..num_blocks * num_ops)
            .map(|_| {
                let z: f64 = rng.sample(StandardNormal);
                (ALPHA_INIT_SCALE * z) as f32
            })
            .collect();
        let alphas = Var::from_tensor(&Tensor::from_vec(values, (num_blocks, num_ops), device)?)?;
        let gumbel = gumbel_like(alphas.as_tensor(), &mut rng)?;

        debug!(num_blocks, num_ops, tau, hard, "Initialized architecture parameters");

        Ok(Self {
            alphas,
            gumbel,
            tau,
            hard,
            rng,
        })
    }

    pub fn alphas(&self) -> &Var {
        &self.alphas
    }

    /// `(num_blocks, num_ops)`
    pub fn shape(&self) -> Result<(usize, usize)> {
        Ok(self.alphas.dims2()?)
    }

    /// Draw fresh Gumbel noise
    pub fn resample_gumbel(&mut self) -> Result<()> {
        self.gumbel = gumbel_like(self.alphas.as_tensor(), &mut self.rng)?;
        Ok(())
    }

    /// Sampled architecture weights.
    ///
    /// `cat = false` gives `[num_blocks, num_ops]`; `cat = true` concatenates
    /// the rows into a single `[num_blocks * num_ops]` vector.
    pub fn arch_weights(&self, cat: bool) -> Result<Tensor> {
        let weights = gumbel_softmax(self.alphas.as_tensor(), self.tau, &self.gumbel, self.hard)?;
        if cat {
            Ok(weights.flatten_all()?)
        } else {
            Ok(weights)
        }
    }

    /// Arg-max candidate of each block under the current sample
    pub fn combination(&self) -> Result<Vec<usize>> {
        let weights = self.arch_weights(false)?;
        let index = weights.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(index.into_iter().map(|i| i as usize).collect())
    }

    pub fn arch_parameters(&self) -> Vec<Var> {
        vec![self.alphas.clone()]
    }

    /// Write alphas and the current Gumbel noise as safetensors
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            ("alphas".to_string(), self.alphas.as_tensor().clone()),
            ("gumbel".to_string(), self.gumbel.clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    /// Restore alphas (and the Gumbel noise when present) from [`save`](Self::save) output
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let device = self.alphas.device().clone();
        let mut tensors = candle_core::safetensors::load(path.as_ref(), &device)?;
        let alphas = tensors.remove("alphas").ok_or_else(|| {
            NasError::CheckpointError(format!("no alphas in {}", path.as_ref().display()))
        })?;
        self.set_alphas(&alphas)?;
        if let Some(gumbel) = tensors.remove("gumbel") {
            self.check_shape("gumbel", &gumbel)?;
            self.gumbel = gumbel.to_dtype(DType::F32)?;
        }
        Ok(())
    }

    pub fn set_alphas(&self, alphas: &Tensor) -> Result<()> {
        self.check_shape("alphas", alphas)?;
        self.alphas.set(&alphas.to_dtype(self.alphas.dtype())?)?;
        Ok(())
    }

    fn check_shape(&self, name: &str, t: &Tensor) -> Result<()> {
        if t.dims() != self.alphas.dims() {
            return Err(NasError::ShapeError {
                name: name.to_string(),
                expected: format!("{:?}", self.alphas.dims()),
                actual: format!("{:?}", t.dims()),
            });
        }
        Ok(())
    }
}
