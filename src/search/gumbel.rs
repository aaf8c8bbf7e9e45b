//! Gumbel noise and the Gumbel-Softmax relaxation

use candle_core::{DType, Device, Tensor, D};
use rand::Rng;

use crate::error::{NasError, Result};

const GUMBEL_EPS: f64 = 1e-20;

/// Sample `-ln(-ln(U + eps) + eps)` with `U ~ Uniform(0, 1)`
pub fn sample_gumbel(
    shape: &[usize],
    dtype: DType,
    device: &Device,
    rng: &mut impl Rng,
) -> Result<Tensor> {
    let numel: usize = shape.iter().product();
    let values: Vec<f64> = (0..numel)
        .map(|_| {
            let u: f64 = rng.gen();
            -(-(u + GUMBEL_EPS).ln() + GUMBEL_EPS).ln()
        })
        .collect();
    let noise = Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?;
    Ok(noise)
}

/// Gumbel noise with the shape, dtype and device of `reference`
pub fn gumbel_like(reference: &Tensor, rng: &mut impl Rng) -> Result<Tensor> {
    sample_gumbel(reference.dims(), reference.dtype(), reference.device(), rng)
}

/// `softmax((logits + g) / tau)` over the last dimension.
///
/// With `hard` set the forward value is the one-hot arg-max while gradients
/// flow through the soft sample (straight-through estimator).
pub fn gumbel_softmax(logits: &Tensor, tau: f64, g: &Tensor, hard: bool) -> Result<Tensor> {
    if !(tau > 0.0) {
        return Err(NasError::invalid("tau", tau, "must be positive"));
    }
    if logits.dims() != g.dims() {
        return Err(NasError::ShapeError {
            name: "gumbel".to_string(),
            expected: format!("{:?}", logits.dims()),
            actual: format!("{:?}", g.dims()),
        });
    }

    let perturbed = logits.add(g)?.affine(1.0 / tau, 0.0)?;
    let soft = candle_nn::ops::softmax(&perturbed, D::Minus1)?;
    if !hard {
        return Ok(soft);
    }

    let one_hot = one_hot_argmax(&soft)?;
    let hard = one_hot.sub(&soft.detach())?.add(&soft)?;
    Ok(hard)
}

fn one_hot_argmax(probs: &Tensor) -> Result<Tensor> {
    let n = probs.dim(D::Minus1)?;
    let index = probs.argmax_keepdim(D::Minus1)?;
    let positions = Tensor::arange(0u32, n as u32, probs.device())?;
    let one_hot = positions
        .broadcast_as(probs.shape())?
        .eq(&index.broadcast_as(probs.shape())?)?
        .to_dtype(probs.dtype())?;
    Ok(one_hot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_gumbel_noise_is_seeded() {
        let device = Device::Cpu;
        let mut a = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut b = Xoshiro256PlusPlus::seed_from_u64(7);
        let ga = sample_gumbel(&[4, 5], DType::F32, &device, &mut a).unwrap();
        let gb = sample_gumbel(&[4, 5], DType::F32, &device, &mut b).unwrap();
        assert_eq!(ga.dims(), &[4, 5]);
        assert_eq!(ga.to_vec2::<f32>().unwrap(), gb.to_vec2::<f32>().unwrap());
        let finite = ga.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(finite.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gumbel_softmax_rows_sum_to_one() {
        let device = Device::Cpu;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let logits = Tensor::randn(0f32, 1f32, (4, 6), &device).unwrap();
        let g = gumbel_like(&logits, &mut rng).unwrap();
        let weights = gumbel_softmax(&logits, 0.5, &g, false).unwrap();
        let sums = weights.sum(D::Minus1).unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_noise_matches_softmax() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1f32, 2.0, 3.0]], &device).unwrap();
        let g = logits.zeros_like().unwrap();
        let weights = gumbel_softmax(&logits, 1.0, &g, false).unwrap();
        let expected = candle_nn::ops::softmax(&logits, D::Minus1).unwrap();
        let diff = weights
            .sub(&expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_hard_mode_is_one_hot() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9, 0.3], [2.0, -1.0, 0.0]], &device).unwrap();
        let g = logits.zeros_like().unwrap();
        let weights = gumbel_softmax(&logits, 1.0, &g, true).unwrap();
        let rows = weights.to_vec2::<f32>().unwrap();
        let expected = [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        for (row, want) in rows.iter().zip(expected.iter()) {
            for (v, w) in row.iter().zip(want.iter()) {
                assert!((v - w).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_rejects_bad_tau_and_shape() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let g = logits.zeros_like().unwrap();
        assert!(gumbel_softmax(&logits, 0.0, &g, false).is_err());
        let bad = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        assert!(gumbel_softmax(&logits, 1.0, &bad, false).is_err());
    }
}
