pub mod iwae;
pub mod rws;

use crate::common::*;
use crate::generative::GenerativeParams;

use candle_util::candle_inference::TrainConfig;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub use iwae::IwaeArgs;
pub use rws::RwsArgs;

#[derive(Parser, Debug)]
#[command(name = "lupin")]
#[command(
    version,
    about = "Amortized inference for an open-universe Gaussian mixture",
    long_about = "Train a proposal network and the branch-A mean of a two-level\n\
		  mixture on data simulated from the true model, either by an\n\
		  importance-weighted ELBO or by reweighted wake-sleep.\n"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Importance-weighted autoencoder with REINFORCE or VIMCO gradients
    Iwae(IwaeArgs),

    #[command(
        about = "Reweighted wake-sleep",
        long_about = "Alternate, every iteration:\n\
		      (1) wake-theta: fit the generative model to the data\n\
		      (2) sleep-phi: fit the proposal to fantasies (optional)\n\
		      (3) wake-phi: fit the proposal to reweighted real data (optional)\n"
    )]
    Rws(RwsArgs),
}

/// Fixed generative parameters; `--init-mean1` is the only trainable one
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long, value_delimiter = ',', default_values_t = [0.5, 0.5], help = "pr(k = 1), pr(k = 2)")]
    pub branch_probs: Vec<f64>,

    #[arg(long, default_value_t = 2.0, allow_negative_numbers = true)]
    pub init_mean1: f64,

    #[arg(long, default_value_t = 1.0)]
    pub std1: f64,

    #[arg(long, value_delimiter = ',', default_values_t = [0.5, 0.5], help = "pr(z | k = 2)")]
    pub mixture_probs: Vec<f64>,

    #[arg(long, value_delimiter = ',', default_values_t = [-5.0, 5.0], allow_negative_numbers = true)]
    pub means2: Vec<f64>,

    #[arg(long, value_delimiter = ',', default_values_t = [1.0, 1.0])]
    pub stds2: Vec<f64>,

    #[arg(long, default_value_t = 1.0)]
    pub obs_std: f64,
}

fn pair(name: &str, values: &[f64]) -> anyhow::Result<[f64; 2]> {
    <[f64; 2]>::try_from(values)
        .map_err(|_| anyhow::anyhow!("--{} takes two comma-separated values", name))
}

impl ModelArgs {
    pub fn to_params(&self) -> anyhow::Result<GenerativeParams> {
        let params = GenerativeParams {
            branch_probs: pair("branch-probs", &self.branch_probs)?,
            init_mean1: self.init_mean1,
            std1: self.std1,
            mixture_probs: pair("mixture-probs", &self.mixture_probs)?,
            means2: pair("means2", &self.means2)?,
            stds2: pair("stds2", &self.stds2)?,
            obs_std: self.obs_std,
        };
        params.validate()?;
        Ok(params)
    }
}

/// Settings shared by both trainers
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value_t = 10_000)]
    pub iters: usize,

    #[arg(long, default_value_t = 100, help = "Observations simulated per iteration")]
    pub num_obs: usize,

    #[arg(long, default_value_t = 10)]
    pub particles: usize,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, help = "Branch-A mean of the data-generating model")]
    pub true_mean1: f64,

    #[arg(long, default_value_t = 100)]
    pub log_every: usize,

    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [-5.0, 0.0, 5.0],
        allow_negative_numbers = true,
        help = "Observations at which to report the learned q(k, z | obs)"
    )]
    pub query_obs: Vec<f64>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(short, long, help = "Output prefix (creates {out}.theta.safetensors, {out}.phi.safetensors)")]
    pub out: Option<String>,

    #[arg(long)]
    pub gpu: bool,

    #[arg(long)]
    pub progress: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl RunArgs {
    pub fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let device = select_device(self.gpu)?;
        info!("Using device: {:?}", device);
        Ok(TrainConfig {
            num_iterations: self.iters,
            log_every: self.log_every,
            device,
            show_progress: self.progress,
            verbose: self.verbose,
        })
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

fn select_device(gpu: bool) -> anyhow::Result<Device> {
    if !gpu {
        return Ok(Device::Cpu);
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Device::metal_if_available(0)?)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Ok(Device::cuda_if_available(0)?)
    }
}

/// Proposal draws per query observation in the end-of-run summary
pub(crate) const QUERY_SAMPLES: usize = 1000;

/// mean of the last `window` entries
pub(crate) fn tail_mean(values: &[f32], window: usize) -> f32 {
    let tail = &values[values.len().saturating_sub(window)..];
    if tail.is_empty() {
        return f32::NAN;
    }
    tail.iter().sum::<f32>() / tail.len() as f32
}
