//! Host-side random draws turned into tensors.
//!
//! Every draw goes through a caller-supplied `Rng`, so a seeded generator
//! makes a forward pass reproducible.

use candle_core::{Device, Result, Tensor};
use rand::Rng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, StandardNormal};

/// Categorical distribution over non-negative (possibly unnormalized)
/// weights; NaN, negative or all-zero weights are an error
pub fn categorical(probs: &[f32]) -> Result<WeightedIndex<f32>> {
    WeightedIndex::new(probs)
        .map_err(|e| candle_core::Error::Msg(format!("categorical weights {:?}: {}", probs, e)))
}

/// `n` independent draws from one categorical distribution
pub fn sample_categorical<R: Rng>(probs: &[f32], n: usize, rng: &mut R) -> Result<Vec<usize>> {
    let dist = categorical(probs)?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

/// Draw one category per row of a probability matrix (n x k)
pub fn sample_categorical_rows<R: Rng>(probs_nk: &Tensor, rng: &mut R) -> Result<Vec<usize>> {
    let rows = probs_nk.detach().to_vec2::<f32>()?;
    rows.iter()
        .map(|p| Ok(categorical(p)?.sample(rng)))
        .collect()
}

/// `n` independent draws from N(0, 1) as a 1-D tensor
pub fn standard_normal<R: Rng>(n: usize, rng: &mut R, device: &Device) -> Result<Tensor> {
    let eps: Vec<f32> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_vec(eps, n, device)
}

/// One-hot rows (n x k) with the same hot column `col`
pub fn one_hot_rows(n: usize, k: usize, col: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * k];
    for row in data.chunks_mut(k) {
        row[col] = 1.0;
    }
    Tensor::from_vec(data, (n, k), device)
}
