//! Importance-weighted ELBO and its two score-function estimators
//!
//! For `m` observations and `P` particles the weights form an (m, P)
//! matrix and
//!
//! ```text
//! elbo[i] = logsumexp_p(log_weight[i, p]) - ln P
//! ```
//!
//! REINFORCE adds `elbo.detach() * Σ_p log q(k, z)`; VIMCO replaces the
//! single baseline-free reward with one leave-one-out reward per particle.

use crate::common::*;
use crate::error::{check_count, check_scale, ConfigError};
use crate::generative::{GenerativeModel, GenerativeParams};
use crate::inference::InferenceNetwork;
use crate::pair::ModelPair;
use crate::trace::TraceBatch;

use candle_util::candle_core::Result;
use candle_util::candle_nn::Optimizer;
use candle_util::candle_inference::{adam, TrainConfig};
use candle_util::candle_log_domain::log_sum_exp;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradientEstimator {
    Reinforce,
    Vimco,
}

impl GradientEstimator {
    pub fn min_particles(self) -> usize {
        match self {
            GradientEstimator::Reinforce => 1,
            GradientEstimator::Vimco => 2,
        }
    }
}

impl FromStr for GradientEstimator {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reinforce" => Ok(GradientEstimator::Reinforce),
            "vimco" => Ok(GradientEstimator::Vimco),
            _ => Err(ConfigError::UnknownEstimator(s.to_string())),
        }
    }
}

impl fmt::Display for GradientEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradientEstimator::Reinforce => write!(f, "reinforce"),
            GradientEstimator::Vimco => write!(f, "vimco"),
        }
    }
}

/// Per-particle quantities, each (m, P), particle `p` of observation `i`
/// at `[i, p]`
pub struct ParticleWeights {
    /// log p(trace) - log q(trace | obs)
    pub log_weight: Tensor,
    /// log q(trace | obs)
    pub log_q: Tensor,
    /// log q(k, z | obs), the non-reparameterizable part of `log_q`
    pub log_q_discrete: Tensor,
}

pub struct IwaeLoss {
    /// scalar to minimize
    pub loss: Tensor,
    /// batch mean of the ELBO estimate, for monitoring
    pub elbo: f32,
}

pub struct Iwae<'a> {
    generative: &'a GenerativeModel,
    inference: &'a InferenceNetwork,
}

impl<'a> Iwae<'a> {
    pub fn new(generative: &'a GenerativeModel, inference: &'a InferenceNetwork) -> Self {
        Self {
            generative,
            inference,
        }
    }

    /// Replicate each observation `num_particles` times, draw one proposal
    /// trace per copy and score it under both models
    ///
    /// * `obs` - observations (m,)
    pub fn particle_weights<R: Rng>(
        &self,
        obs: &Tensor,
        num_particles: usize,
        rng: &mut R,
    ) -> Result<ParticleWeights> {
        let traces = self.sample_particles(obs, num_particles, rng)?;
        self.weigh(&traces, obs.dims1()?, num_particles)
    }

    /// Proposal traces for `num_particles` copies of each observation; the
    /// copies of observation `i` sit at `i * P .. (i + 1) * P`
    pub fn sample_particles<R: Rng>(
        &self,
        obs: &Tensor,
        num_particles: usize,
        rng: &mut R,
    ) -> Result<TraceBatch> {
        let m = obs.dims1()?;
        if m == 0 || num_particles == 0 {
            candle_core::bail!("{} observations x {} particles: nothing to weigh", m, num_particles);
        }
        let obs_rep = obs
            .unsqueeze(1)?
            .broadcast_as((m, num_particles))?
            .contiguous()?
            .reshape(m * num_particles)?;
        self.inference.sample(&obs_rep, rng)
    }

    /// Score traces laid out by `sample_particles`
    pub fn weigh(&self, traces: &TraceBatch, m: usize, num_particles: usize) -> Result<ParticleWeights> {
        if traces.len() != m * num_particles {
            candle_core::bail!(
                "{} traces for {} observations x {} particles",
                traces.len(),
                m,
                num_particles
            );
        }
        let log_p = self.generative.log_density(traces)?;
        let log_q = self.inference.log_density(traces)?;
        let log_q_total = log_q.total()?;

        let log_weight = traces.merge(&log_p.sub(&log_q_total)?)?;
        let log_q_all = traces.merge(&log_q_total)?;
        let log_q_discrete = traces.merge(&log_q.discrete)?;

        let shape = (m, num_particles);
        Ok(ParticleWeights {
            log_weight: log_weight.reshape(shape)?,
            log_q: log_q_all.reshape(shape)?,
            log_q_discrete: log_q_discrete.reshape(shape)?,
        })
    }

    pub fn reinforce_loss(&self, weights: &ParticleWeights) -> Result<IwaeLoss> {
        let elbo = iwae_elbo(&weights.log_weight)?;
        let score = weights.log_q_discrete.sum(1)?;
        let surrogate = (&elbo + (elbo.detach() * score)?)?;
        Ok(IwaeLoss {
            loss: surrogate.mean_all()?.neg()?,
            elbo: elbo.mean_all()?.to_scalar::<f32>()?,
        })
    }

    pub fn vimco_loss(&self, weights: &ParticleWeights) -> Result<IwaeLoss> {
        let elbo = iwae_elbo(&weights.log_weight)?;
        let control = vimco_control_variates(&weights.log_weight)?;
        let reward = elbo.detach().unsqueeze(1)?.broadcast_sub(&control)?;
        let score = (reward * &weights.log_q_discrete)?.sum(1)?;
        let surrogate = (&elbo + score)?;
        Ok(IwaeLoss {
            loss: surrogate.mean_all()?.neg()?,
            elbo: elbo.mean_all()?.to_scalar::<f32>()?,
        })
    }

    pub fn loss(&self, estimator: GradientEstimator, weights: &ParticleWeights) -> Result<IwaeLoss> {
        match estimator {
            GradientEstimator::Reinforce => self.reinforce_loss(weights),
            GradientEstimator::Vimco => self.vimco_loss(weights),
        }
    }
}

/// logsumexp over particles minus ln P, one entry per observation
///
/// * `log_weight` - (m, P)
pub fn iwae_elbo(log_weight: &Tensor) -> Result<Tensor> {
    let (_, num_particles) = log_weight.dims2()?;
    log_sum_exp(log_weight, 1)? - (num_particles as f64).ln()
}

/// Leave-one-out baselines, detached, (m, P)
///
/// Entry `[i, p]` is the ELBO of observation `i` recomputed with particle
/// `p`'s weight replaced by the mean of the other `P - 1` weights.
pub fn vimco_control_variates(log_weight: &Tensor) -> Result<Tensor> {
    let (m, num_particles) = log_weight.dims2()?;
    if num_particles < 2 {
        candle_core::bail!("leave-one-out baseline needs at least two particles");
    }
    let lw = log_weight.detach();
    let others_mean = ((lw.sum_keepdim(1)?.broadcast_sub(&lw))? / (num_particles - 1) as f64)?;

    let shape = (m, num_particles, num_particles);
    // row p of observation i: all weights, with the diagonal swapped out
    let all_weights = lw.unsqueeze(1)?.broadcast_as(shape)?.contiguous()?;
    let baseline = others_mean.unsqueeze(2)?.broadcast_as(shape)?.contiguous()?;
    let diagonal: Vec<u8> = (0..num_particles * num_particles)
        .map(|ij| u8::from(ij / num_particles == ij % num_particles))
        .collect();
    let diagonal = Tensor::from_vec(diagonal, (num_particles, num_particles), lw.device())?
        .broadcast_as(shape)?
        .contiguous()?;

    let loo = diagonal.where_cond(&baseline, &all_weights)?;
    log_sum_exp(&loo, 2)? - (num_particles as f64).ln()
}

#[derive(Clone, Debug)]
pub struct IwaeConfig {
    pub train: TrainConfig,
    /// observations drawn from the true model per iteration
    pub num_obs: usize,
    pub num_particles: usize,
    pub estimator: GradientEstimator,
    pub learning_rate: f64,
    /// `mean1` of the data-generating model
    pub true_mean1: f64,
}

impl Default for IwaeConfig {
    fn default() -> Self {
        Self {
            train: TrainConfig {
                num_iterations: 10_000,
                ..TrainConfig::default()
            },
            num_obs: 100,
            num_particles: 10,
            estimator: GradientEstimator::Reinforce,
            learning_rate: 1e-3,
            true_mean1: 0.0,
        }
    }
}

impl IwaeConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_count("number of iterations", self.train.num_iterations)?;
        check_count("number of observations", self.num_obs)?;
        let min = self.estimator.min_particles();
        if self.num_particles < min {
            return Err(ConfigError::TooFewParticles {
                estimator: self.estimator.to_string(),
                min,
                num_particles: self.num_particles,
            });
        }
        check_scale("learning rate", self.learning_rate)?;
        if !self.true_mean1.is_finite() {
            return Err(ConfigError::NonFinite("true mean1"));
        }
        Ok(())
    }
}

/// One slot per iteration
#[derive(Clone, Debug, Default)]
pub struct IwaeHistory {
    pub elbo: Vec<f32>,
    pub mean1: Vec<f32>,
}

pub struct IwaeFit {
    pub models: ModelPair,
    pub history: IwaeHistory,
}

/// Fit θ and φ jointly by a single Adam on the IWAE surrogate, with a
/// fresh batch from the true model every iteration
pub fn train_iwae<R: Rng>(
    config: &IwaeConfig,
    params: &GenerativeParams,
    rng: &mut R,
) -> anyhow::Result<IwaeFit> {
    config.validate()?;
    params.validate()?;

    let dev = &config.train.device;
    let truth = GenerativeModel::fixed(params, config.true_mean1, dev)?;
    let models = ModelPair::new(params, dev)?;

    let mut vars = models.theta.all_vars();
    vars.extend(models.phi.all_vars());
    let mut adam = adam(vars, config.learning_rate)?;

    info!(
        "IWAE/{}: {} iterations, {} observations x {} particles",
        config.estimator, config.train.num_iterations, config.num_obs, config.num_particles
    );

    let num_iter = config.train.num_iterations;
    let mut history = IwaeHistory {
        elbo: Vec::with_capacity(num_iter),
        mean1: Vec::with_capacity(num_iter),
    };

    let iwae = Iwae::new(&models.generative, &models.inference);
    let pb = config.train.progress_bar();

    for iter in 0..num_iter {
        let obs = truth.sample_obs(config.num_obs, rng)?;
        let weights = iwae.particle_weights(&obs, config.num_particles, rng)?;
        let IwaeLoss { loss, elbo } = iwae.loss(config.estimator, &weights)?;
        adam.backward_step(&loss)?;

        let mean1 = models.generative.mean1()?;
        history.elbo.push(elbo);
        history.mean1.push(mean1);

        pb.inc(1);
        if config.train.should_log(iter) {
            info!("[{}] elbo: {:.4}, mean1: {:.4}", iter, elbo, mean1);
        }
    }
    pb.finish_and_clear();

    Ok(IwaeFit { models, history })
}
