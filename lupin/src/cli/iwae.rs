use super::{tail_mean, ModelArgs, RunArgs, QUERY_SAMPLES};
use crate::common::*;
use crate::iwae::{train_iwae, GradientEstimator, IwaeConfig};

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct IwaeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value = "reinforce", help = "Gradient estimator: reinforce or vimco")]
    pub estimator: GradientEstimator,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,
}

pub fn run(args: &IwaeArgs) -> anyhow::Result<()> {
    let params = args.model.to_params()?;
    let config = IwaeConfig {
        train: args.run.train_config()?,
        num_obs: args.run.num_obs,
        num_particles: args.run.particles,
        estimator: args.estimator,
        learning_rate: args.lr,
        true_mean1: args.run.true_mean1,
    };
    config.validate()?;

    let mut rng = args.run.rng();
    let fit = train_iwae(&config, &params, &mut rng)?;

    let window = (config.train.num_iterations / 10).max(1);
    info!(
        "last {} iterations: elbo {:.4}, mean1 {:.4}",
        window,
        tail_mean(&fit.history.elbo, window),
        tail_mean(&fit.history.mean1, window)
    );

    fit.models.summarize_proposal(&args.run.query_obs, QUERY_SAMPLES, &mut rng)?;

    if let Some(prefix) = args.run.out.as_deref() {
        fit.models.save(prefix)?;
    }
    Ok(())
}
