use super::{tail_mean, ModelArgs, RunArgs, QUERY_SAMPLES};
use crate::anneal::AnnealConfig;
use crate::common::*;
use crate::rws::{train_rws, RwsConfig};

use clap::{ArgAction, Args};

#[derive(Args, Debug, Clone)]
pub struct RwsArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "Run the sleep-phi phase")]
    pub sleep_phi: bool,

    #[arg(long, help = "Run the wake-phi phase")]
    pub wake_phi: bool,

    #[arg(long, help = "Temper the wake-phi weights to a target ESS")]
    pub anneal: bool,

    #[arg(long, default_value_t = 0.0)]
    pub init_anneal_factor: f64,

    #[arg(long, default_value_t = 0.9, help = "Target ESS as a fraction of the particles")]
    pub ess_fraction: f64,

    #[arg(long, default_value_t = 100, help = "Fantasy traces per sleep-phi step")]
    pub sleep_num_samples: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub theta_lr: f64,

    #[arg(long, default_value_t = 1e-3)]
    pub phi_lr: f64,
}

pub fn run(args: &RwsArgs) -> anyhow::Result<()> {
    let params = args.model.to_params()?;
    let config = RwsConfig {
        train: args.run.train_config()?,
        num_obs: args.run.num_obs,
        num_particles: args.run.particles,
        sleep_num_samples: args.sleep_num_samples,
        theta_learning_rate: args.theta_lr,
        phi_learning_rate: args.phi_lr,
        sleep_phi: args.sleep_phi,
        wake_phi: args.wake_phi,
        anneal: args.anneal.then_some(AnnealConfig {
            init_factor: args.init_anneal_factor,
            ess_fraction: args.ess_fraction,
        }),
        true_mean1: args.run.true_mean1,
    };
    config.validate()?;

    let mut rng = args.run.rng();
    let fit = train_rws(&config, &params, &mut rng)?;

    let window = (config.train.num_iterations / 10).max(1);
    let history = &fit.history;
    info!(
        "last {} iterations: wake-theta {:.4}, mean1 {:.4}",
        window,
        tail_mean(&history.wake_theta_loss, window),
        tail_mean(&history.mean1, window)
    );
    if let Some(loss) = history.sleep_phi_loss.as_ref() {
        info!("sleep-phi {:.4}", tail_mean(loss, window));
    }
    if let Some(loss) = history.wake_phi_loss.as_ref() {
        info!("wake-phi {:.4}", tail_mean(loss, window));
    }
    if let Some(a) = history.anneal_factor.as_ref().and_then(|a| a.last()) {
        info!("final anneal factor {:.4}", a);
    }

    fit.models.summarize_proposal(&args.run.query_obs, QUERY_SAMPLES, &mut rng)?;

    if let Some(prefix) = args.run.out.as_deref() {
        fit.models.save(prefix)?;
    }
    Ok(())
}
