use candle_core::{Result, Tensor};
use candle_nn::ops;

/// ln(2π)
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Gaussian log-density with tensor-valued location and scale
///
/// log N(x; μ, σ) = -0.5 * [((x - μ)/σ)^2 + ln(2π)] - ln(σ)
///
/// * `x` - points to evaluate (n,)
/// * `mean` - location, broadcastable to `x`
/// * `std` - scale, broadcastable to `x`
///
pub fn gaussian_log_density(x: &Tensor, mean: &Tensor, std: &Tensor) -> Result<Tensor> {
    let z = x.broadcast_sub(mean)?.broadcast_div(std)?;
    let quad = ((z.sqr()? + LN_2PI)? * (-0.5))?;
    quad.broadcast_sub(&std.log()?)
}

/// Gaussian log-density with a tensor location and a fixed scale
///
/// * `x` - points to evaluate (n,)
/// * `mean` - location, broadcastable to `x`
/// * `std` - scale σ > 0
///
pub fn gaussian_log_density_fixed_std(x: &Tensor, mean: &Tensor, std: f64) -> Result<Tensor> {
    let z = (x.broadcast_sub(mean)? / std)?;
    ((z.sqr()? + LN_2PI)? * (-0.5))? - std.ln()
}

/// Gaussian log-density with fixed location and scale
pub fn gaussian_log_density_fixed(x: &Tensor, mean: f64, std: f64) -> Result<Tensor> {
    let z = ((x - mean)? / std)?;
    ((z.sqr()? + LN_2PI)? * (-0.5))? - std.ln()
}

/// log pr(category = `col`) under softmax(`logits_nk`), one entry per row
///
/// * `logits_nk` - unnormalized log-probabilities (n x k)
/// * `col` - the category shared by every row
///
pub fn categorical_log_prob(logits_nk: &Tensor, col: usize) -> Result<Tensor> {
    ops::log_softmax(logits_nk, 1)?.narrow(1, col, 1)?.squeeze(1)
}
