//! Generative model p_θ(k, z, x, obs) of the open-universe mixture
//!
//! ```text
//! k ~ Categorical(branch_probs) + 1
//! k = 1:  x1 ~ N(mean1, std1)
//! k = 2:  z ~ Categorical(mixture_probs),  x2 ~ N(means2[z], stds2[z])
//! obs ~ N(x, obs_std)
//! ```
//!
//! Only `mean1` is trainable.

use crate::common::*;
use crate::error::{check_probs, check_scale, ConfigError};
use crate::trace::*;

use candle_util::candle_core::Result;
use candle_util::candle_loss_functions::{gaussian_log_density_fixed, gaussian_log_density_fixed_std};
use candle_util::candle_sampling::{sample_categorical, standard_normal};

#[derive(Clone, Debug, PartialEq)]
pub struct GenerativeParams {
    /// pr(k = 1), pr(k = 2)
    pub branch_probs: [f64; 2],
    /// starting value of the trainable mean of `x1`
    pub init_mean1: f64,
    pub std1: f64,
    /// pr(z | k = 2)
    pub mixture_probs: [f64; NUM_MIXTURES],
    pub means2: [f64; NUM_MIXTURES],
    pub stds2: [f64; NUM_MIXTURES],
    pub obs_std: f64,
}

impl Default for GenerativeParams {
    fn default() -> Self {
        Self {
            branch_probs: [0.5, 0.5],
            init_mean1: 2.0,
            std1: 1.0,
            mixture_probs: [0.5, 0.5],
            means2: [-5.0, 5.0],
            stds2: [1.0, 1.0],
            obs_std: 1.0,
        }
    }
}

impl GenerativeParams {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_probs("branch probabilities", &self.branch_probs)?;
        check_probs("mixture probabilities", &self.mixture_probs)?;
        check_scale("std1", self.std1)?;
        check_scale("obs_std", self.obs_std)?;
        for &s in self.stds2.iter() {
            check_scale("stds2", s)?;
        }
        if !self.init_mean1.is_finite() {
            return Err(ConfigError::NonFinite("init_mean1"));
        }
        if self.means2.iter().any(|m| !m.is_finite()) {
            return Err(ConfigError::NonFinite("means2"));
        }
        Ok(())
    }
}

pub struct GenerativeModel {
    params: GenerativeParams,
    /// shape (1,)
    mean1: Tensor,
    device: Device,
}

impl GenerativeModel {
    /// A model with trainable `mean1`, registered under `vb` as `mean1`
    pub fn new(params: &GenerativeParams, vb: VarBuilder) -> Result<Self> {
        let mean1 = vb.get_with_hints(1, "mean1", candle_nn::Init::Const(params.init_mean1))?;
        Ok(Self {
            params: params.clone(),
            mean1,
            device: vb.device().clone(),
        })
    }

    /// A model whose `mean1` is a constant, e.g., the data-generating truth
    pub fn fixed(params: &GenerativeParams, mean1: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            params: params.clone(),
            mean1: Tensor::new(&[mean1 as f32], device)?,
            device: device.clone(),
        })
    }

    pub fn params(&self) -> &GenerativeParams {
        &self.params
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current value of `mean1`
    pub fn mean1(&self) -> Result<f32> {
        self.mean1.squeeze(0)?.to_scalar::<f32>()
    }

    /// Draw `n` traces: `k` for everyone, then `z` inside the `k = 2`
    /// partition, then each group's latent and observation
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<TraceBatch> {
        if n == 0 {
            return Ok(TraceBatch::empty());
        }

        let branch_probs = self.params.branch_probs.map(|p| p as f32);
        let k_index = sample_categorical(&branch_probs, n, rng)?;
        let everyone: Vec<usize> = (0..n).collect();
        let mut by_k = split_by_label(&everyone, &k_index, 2).into_iter();
        let single_index = by_k.next().unwrap_or_default();
        let mixture_index = by_k.next().unwrap_or_default();

        let mixture_probs = self.params.mixture_probs.map(|p| p as f32);
        let z = sample_categorical(&mixture_probs, mixture_index.len(), rng)?;
        let mut by_z = split_by_label(&mixture_index, &z, NUM_MIXTURES).into_iter();
        let index_0 = by_z.next().unwrap_or_default();
        let index_1 = by_z.next().unwrap_or_default();

        let single = self.sample_single(single_index, rng)?;
        let mix_0 = self.sample_mixture(0, index_0, rng)?;
        let mix_1 = self.sample_mixture(1, index_1, rng)?;

        TraceBatch::new(n, [single, mix_0, mix_1])
    }

    /// Observations only, detached, in batch order
    pub fn sample_obs<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Tensor> {
        Ok(self.sample(n, rng)?.obs()?.detach())
    }

    fn emit_obs<R: Rng>(&self, latent: &Tensor, rng: &mut R) -> Result<Tensor> {
        let eps = standard_normal(latent.dims1()?, rng, &self.device)?;
        latent + (eps * self.params.obs_std)?
    }

    fn sample_single<R: Rng>(&self, index: Vec<usize>, rng: &mut R) -> Result<TraceGroup> {
        if index.is_empty() {
            return Ok(TraceGroup::empty(Branch::Single));
        }
        let eps = standard_normal(index.len(), rng, &self.device)?;
        let x1 = (eps * self.params.std1)?.broadcast_add(&self.mean1)?;
        let obs = self.emit_obs(&x1, rng)?;
        TraceGroup::new(Branch::Single, index, x1, obs)
    }

    fn sample_mixture<R: Rng>(&self, z: usize, index: Vec<usize>, rng: &mut R) -> Result<TraceGroup> {
        let branch = Branch::Mixture(z);
        if index.is_empty() {
            return Ok(TraceGroup::empty(branch));
        }
        let eps = standard_normal(index.len(), rng, &self.device)?;
        let x2 = eps.affine(self.params.stds2[z], self.params.means2[z])?;
        let obs = self.emit_obs(&x2, rng)?;
        TraceGroup::new(branch, index, x2, obs)
    }

    /// log p_θ(trace) per element of every non-empty group
    pub fn log_density(&self, batch: &TraceBatch) -> Result<GroupTensors> {
        let mut out = GroupTensors::new();
        for g in batch.groups() {
            let Some(values) = g.values.as_ref() else {
                continue;
            };
            let lp = match g.branch {
                Branch::Single => self.single_log_density(values)?,
                Branch::Mixture(z) => self.mixture_log_density(z, values)?,
            };
            out.set(g.branch, lp);
        }
        Ok(out)
    }

    fn single_log_density(&self, values: &GroupValues) -> Result<Tensor> {
        let log_k = self.params.branch_probs[Branch::Single.k_index()].ln();
        let log_x = gaussian_log_density_fixed_std(&values.latent, &self.mean1, self.params.std1)?;
        let log_obs = gaussian_log_density_fixed_std(&values.obs, &values.latent, self.params.obs_std)?;
        (log_x + log_obs)? + log_k
    }

    fn mixture_log_density(&self, z: usize, values: &GroupValues) -> Result<Tensor> {
        let log_k = self.params.branch_probs[Branch::Mixture(z).k_index()].ln();
        let log_z = self.params.mixture_probs[z].ln();
        let log_x =
            gaussian_log_density_fixed(&values.latent, self.params.means2[z], self.params.stds2[z])?;
        let log_obs = gaussian_log_density_fixed_std(&values.obs, &values.latent, self.params.obs_std)?;
        (log_x + log_obs)? + (log_k + log_z)
    }
}
