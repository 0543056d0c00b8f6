//! Reweighted wake-sleep
//!
//! Each iteration runs, in order:
//!
//! 1. wake-theta: `-mean ELBO` on proposal traces cut out of φ's graph,
//!    stepped by the θ optimizer
//! 2. sleep-phi (optional): `-mean log q` on fantasies from the generative
//!    model, stepped by the φ optimizer
//! 3. wake-phi (optional): `-Σ_p w̄_p log q_p` with self-normalized,
//!    optionally tempered, detached weights `w̄`, stepped by the φ optimizer

use crate::anneal::{AnnealConfig, AnnealController};
use crate::common::*;
use crate::error::{check_count, check_scale, ConfigError};
use crate::generative::{GenerativeModel, GenerativeParams};
use crate::inference::InferenceNetwork;
use crate::iwae::{iwae_elbo, Iwae};
use crate::pair::ModelPair;

use candle_util::candle_core::Result;
use candle_util::candle_nn::Optimizer;
use candle_util::candle_inference::{adam, TrainConfig};
use candle_util::candle_log_domain::log_norm_exp;

#[derive(Clone, Debug)]
pub struct RwsConfig {
    pub train: TrainConfig,
    /// real observations per iteration
    pub num_obs: usize,
    pub num_particles: usize,
    /// fantasy traces per sleep-phi step
    pub sleep_num_samples: usize,
    pub theta_learning_rate: f64,
    pub phi_learning_rate: f64,
    pub sleep_phi: bool,
    pub wake_phi: bool,
    /// temper the wake-phi weights
    pub anneal: Option<AnnealConfig>,
    pub true_mean1: f64,
}

impl Default for RwsConfig {
    fn default() -> Self {
        Self {
            train: TrainConfig {
                num_iterations: 10_000,
                ..TrainConfig::default()
            },
            num_obs: 100,
            num_particles: 10,
            sleep_num_samples: 100,
            theta_learning_rate: 1e-3,
            phi_learning_rate: 1e-3,
            sleep_phi: true,
            wake_phi: false,
            anneal: None,
            true_mean1: 0.0,
        }
    }
}

impl RwsConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.sleep_phi && !self.wake_phi {
            return Err(ConfigError::NoPhiPhase);
        }
        if let Some(anneal) = self.anneal.as_ref() {
            if !self.wake_phi {
                return Err(ConfigError::AnnealWithoutWakePhi);
            }
            anneal.validate()?;
        }
        check_count("number of iterations", self.train.num_iterations)?;
        check_count("number of observations", self.num_obs)?;
        check_count("number of particles", self.num_particles)?;
        if self.sleep_phi {
            check_count("number of sleep samples", self.sleep_num_samples)?;
        }
        check_scale("theta learning rate", self.theta_learning_rate)?;
        check_scale("phi learning rate", self.phi_learning_rate)?;
        if !self.true_mean1.is_finite() {
            return Err(ConfigError::NonFinite("true mean1"));
        }
        Ok(())
    }
}

/// One slot per iteration; `None` for phases that never ran
#[derive(Clone, Debug, Default)]
pub struct RwsHistory {
    pub mean1: Vec<f32>,
    pub wake_theta_loss: Vec<f32>,
    pub sleep_phi_loss: Option<Vec<f32>>,
    pub wake_phi_loss: Option<Vec<f32>>,
    pub anneal_factor: Option<Vec<f64>>,
}

pub struct RwsFit {
    pub models: ModelPair,
    pub history: RwsHistory,
}

pub struct Rws<'a> {
    iwae: Iwae<'a>,
    generative: &'a GenerativeModel,
    inference: &'a InferenceNetwork,
}

impl<'a> Rws<'a> {
    pub fn new(generative: &'a GenerativeModel, inference: &'a InferenceNetwork) -> Self {
        Self {
            iwae: Iwae::new(generative, inference),
            generative,
            inference,
        }
    }

    pub fn wake_theta_loss<R: Rng>(
        &self,
        obs: &Tensor,
        num_particles: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        let traces = self.iwae.sample_particles(obs, num_particles, rng)?.detach();
        let weights = self.iwae.weigh(&traces, obs.dims1()?, num_particles)?;
        iwae_elbo(&weights.log_weight)?.mean_all()?.neg()
    }

    pub fn sleep_phi_loss<R: Rng>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor> {
        let traces = self.generative.sample(num_samples, rng)?.detach();
        let log_q = self.inference.log_density(&traces)?.total()?;
        traces.merge(&log_q)?.mean_all()?.neg()
    }

    /// Returns the loss and, when tempering, the factor it was computed at
    pub fn wake_phi_loss<R: Rng>(
        &self,
        obs: &Tensor,
        num_particles: usize,
        anneal: Option<&mut AnnealController>,
        rng: &mut R,
    ) -> Result<(Tensor, Option<f64>)> {
        let traces = self.iwae.sample_particles(obs, num_particles, rng)?.detach();
        let weights = self.iwae.weigh(&traces, obs.dims1()?, num_particles)?;
        let log_weight = weights.log_weight.detach();

        let (log_weight, factor) = match anneal {
            Some(ctrl) => {
                let rows: Vec<Vec<f64>> = log_weight
                    .to_vec2::<f32>()?
                    .into_iter()
                    .map(|row| row.into_iter().map(f64::from).collect())
                    .collect();
                let a = ctrl.update(&rows);
                ((log_weight * a)?, Some(a))
            }
            None => (log_weight, None),
        };

        let normalized = log_norm_exp(&log_weight, 1)?.exp()?;
        let loss = (normalized * &weights.log_q)?.sum(1)?.mean_all()?.neg()?;
        Ok((loss, factor))
    }
}

/// Fit θ and φ by reweighted wake-sleep, drawing a fresh batch from the
/// true model every iteration
pub fn train_rws<R: Rng>(
    config: &RwsConfig,
    params: &GenerativeParams,
    rng: &mut R,
) -> anyhow::Result<RwsFit> {
    config.validate()?;
    params.validate()?;

    let dev = &config.train.device;
    let truth = GenerativeModel::fixed(params, config.true_mean1, dev)?;
    let models = ModelPair::new(params, dev)?;

    let mut theta_adam = adam(models.theta.all_vars(), config.theta_learning_rate)?;
    let mut phi_adam = adam(models.phi.all_vars(), config.phi_learning_rate)?;
    let mut anneal = config.anneal.map(AnnealController::new).transpose()?;

    info!(
        "RWS: {} iterations, {} observations x {} particles, sleep-phi: {}, wake-phi: {}, anneal: {}",
        config.train.num_iterations,
        config.num_obs,
        config.num_particles,
        config.sleep_phi,
        config.wake_phi,
        anneal.is_some()
    );

    let num_iter = config.train.num_iterations;
    let mut history = RwsHistory {
        mean1: Vec::with_capacity(num_iter),
        wake_theta_loss: Vec::with_capacity(num_iter),
        sleep_phi_loss: config.sleep_phi.then(|| Vec::with_capacity(num_iter)),
        wake_phi_loss: config.wake_phi.then(|| Vec::with_capacity(num_iter)),
        anneal_factor: anneal.as_ref().map(|_| Vec::with_capacity(num_iter)),
    };

    let rws = Rws::new(&models.generative, &models.inference);
    let pb = config.train.progress_bar();

    for iter in 0..num_iter {
        let obs = truth.sample_obs(config.num_obs, rng)?;

        let loss = rws.wake_theta_loss(&obs, config.num_particles, rng)?;
        theta_adam.backward_step(&loss)?;
        history.wake_theta_loss.push(loss.to_scalar::<f32>()?);

        if let Some(trace) = history.sleep_phi_loss.as_mut() {
            let loss = rws.sleep_phi_loss(config.sleep_num_samples, rng)?;
            phi_adam.backward_step(&loss)?;
            trace.push(loss.to_scalar::<f32>()?);
        }

        if let Some(trace) = history.wake_phi_loss.as_mut() {
            let (loss, factor) =
                rws.wake_phi_loss(&obs, config.num_particles, anneal.as_mut(), rng)?;
            phi_adam.backward_step(&loss)?;
            trace.push(loss.to_scalar::<f32>()?);
            if let (Some(trace), Some(a)) = (history.anneal_factor.as_mut(), factor) {
                trace.push(a);
            }
        }

        let mean1 = models.generative.mean1()?;
        history.mean1.push(mean1);

        pb.inc(1);
        if config.train.should_log(iter) {
            info!(
                "[{}] wake-theta: {:.4}, mean1: {:.4}",
                iter,
                history.wake_theta_loss.last().copied().unwrap_or(f32::NAN),
                mean1
            );
            if let Some(a) = anneal.as_ref() {
                debug!("[{}] anneal factor: {:.4}", iter, a.factor());
            }
        }
    }
    pb.finish_and_clear();

    Ok(RwsFit { models, history })
}
