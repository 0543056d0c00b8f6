//! Log-domain reductions.
//!
//! Tensor versions keep the autodiff graph intact and are used inside
//! losses; slice versions work on host `f64` values and are used where we
//! only need numbers (e.g., searching an annealing temperature).

use candle_core::{Result, Tensor};

/// log Σ_j exp(x[.., j, ..]) along `dim`, with the reduced dimension removed
///
/// The max is shifted out first so that neither `exp` overflows nor
/// underflows for values spanning a wide dynamic range. The shift is
/// detached: it cancels exactly in the value and carries no gradient. A
/// slice that is entirely `-inf` reduces to `-inf`, not NaN.
///
/// * `x` - log values
/// * `dim` - dimension to reduce
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let max = max.abs()?.lt(f64::INFINITY)?.where_cond(&max, &max.zeros_like()?)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    (sum.log()? + max)?.squeeze(dim)
}

/// x - log_sum_exp(x) along `dim`: a stable log-softmax of unnormalized
/// log weights
pub fn log_norm_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let lse = log_sum_exp(x, dim)?.unsqueeze(dim)?;
    x.broadcast_sub(&lse)
}

/// log Σ exp(v) over a non-empty slice
pub fn logsumexp(values: &[f64]) -> f64 {
    debug_assert!(!values.is_empty(), "logsumexp of an empty slice");
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// v - logsumexp(v), element-wise
pub fn lognormexp(values: &[f64]) -> Vec<f64> {
    let lse = logsumexp(values);
    values.iter().map(|v| v - lse).collect()
}

/// Effective sample size of importance weights tempered by `anneal`
///
/// ESS(a) = exp( 2 * logsumexp(a * w) - logsumexp(2a * w) )
///
/// Equals the number of particles when `anneal = 0` and approaches one as
/// the weights concentrate on a single particle.
pub fn ess(log_weight: &[f64], anneal: f64) -> f64 {
    let scaled: Vec<f64> = log_weight.iter().map(|w| anneal * w).collect();
    let doubled: Vec<f64> = scaled.iter().map(|w| 2.0 * w).collect();
    (2.0 * logsumexp(&scaled) - logsumexp(&doubled)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Tensor};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn constant_vector() {
        for &v in &[-1e3, -3.5, 0.0, 2.0, 700.0] {
            for n in [1usize, 2, 7, 100] {
                let values = vec![v; n];
                assert_abs_diff_eq!(logsumexp(&values), v + (n as f64).ln(), epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn singleton_is_identity() {
        assert_abs_diff_eq!(logsumexp(&[-42.25]), -42.25);
    }

    #[test]
    fn wide_dynamic_range() {
        let values = [1000.0, 0.0, -1000.0];
        let lse = logsumexp(&values);
        assert!(lse.is_finite());
        assert_abs_diff_eq!(lse, 1000.0, epsilon = 1e-9);

        let normalized: f64 = lognormexp(&[-800.0, -805.0, -790.0]).iter().map(|x| x.exp()).sum();
        assert_abs_diff_eq!(normalized, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(19);
        for n in [1usize, 2, 10, 500] {
            for _ in 0..50 {
                let scale = 10f64.powf(rng.random_range(-2.0..3.0));
                let shift = rng.random_range(-1e3..1e3);
                let values: Vec<f64> = (0..n)
                    .map(|_| shift + scale * rng.random_range(-1.0..1.0))
                    .collect();
                let total: f64 = lognormexp(&values).iter().map(|x| x.exp()).sum();
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn tensor_rows_of_neg_infinity() -> Result<()> {
        let ninf = f32::NEG_INFINITY;
        let x = Tensor::new(&[[ninf, ninf, ninf], [ninf, 0.0, ninf]], &Device::Cpu)?;
        let lse = log_sum_exp(&x, 1)?.to_vec1::<f32>()?;
        assert_eq!(lse[0], ninf);
        assert_abs_diff_eq!(lse[1], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn ess_bounds() {
        let flat = [0.1, -4.0, 3.0, 2.5];
        assert_abs_diff_eq!(ess(&flat, 0.0), 4.0, epsilon = 1e-12);

        let peaked = [0.0, -500.0, -600.0, -700.0, -800.0];
        assert_abs_diff_eq!(ess(&peaked, 1.0), 1.0, epsilon = 1e-9);

        let between = ess(&flat, 1.0);
        assert!(between > 1.0 && between < 4.0);
    }

    #[test]
    fn tensor_matches_slice() -> Result<()> {
        let rows = [[0.5f32, -1.0, 3.0], [-200.0, -201.0, -199.5]];
        let x = Tensor::new(&rows, &Device::Cpu)?;

        let lse = log_sum_exp(&x, 1)?.to_vec1::<f32>()?;
        let normed = log_norm_exp(&x, 1)?.exp()?.sum(1)?.to_vec1::<f32>()?;

        for (r, row) in rows.iter().enumerate() {
            let row64: Vec<f64> = row.iter().map(|&v| v as f64).collect();
            assert_abs_diff_eq!(lse[r] as f64, logsumexp(&row64), epsilon = 1e-4);
            assert_abs_diff_eq!(normed[r], 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn tensor_gradient_is_softmax() -> Result<()> {
        let x = candle_core::Var::new(&[1f32, 2.0, 3.0], &Device::Cpu)?;
        let lse = log_sum_exp(x.as_tensor(), 0)?;
        let grads = lse.backward()?;
        let g = grads.get(&x).expect("gradient").to_vec1::<f32>()?;
        let total: f32 = g.iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
        assert!(g[2] > g[1] && g[1] > g[0]);
        Ok(())
    }
}
