use lupin::anneal::AnnealConfig;
use lupin::error::ConfigError;
use lupin::generative::GenerativeParams;
use lupin::rws::{train_rws, RwsConfig};

use candle_util::candle_inference::TrainConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn config(num_iterations: usize) -> RwsConfig {
    RwsConfig {
        train: TrainConfig {
            num_iterations,
            log_every: 0,
            ..TrainConfig::default()
        },
        num_obs: 20,
        num_particles: 10,
        sleep_num_samples: 20,
        theta_learning_rate: 0.01,
        phi_learning_rate: 0.01,
        ..RwsConfig::default()
    }
}

#[test]
fn annealed_wake_phi_keeps_factor_in_unit_interval() -> anyhow::Result<()> {
    let params = GenerativeParams::default();
    let config = RwsConfig {
        sleep_phi: false,
        wake_phi: true,
        anneal: Some(AnnealConfig {
            init_factor: 0.0,
            ess_fraction: 0.9,
        }),
        ..config(40)
    };
    let mut rng = StdRng::seed_from_u64(99);

    let fit = train_rws(&config, &params, &mut rng)?;
    let history = &fit.history;
    assert!(history.sleep_phi_loss.is_none());

    let factors = history.anneal_factor.as_ref().expect("anneal history");
    assert_eq!(factors.len(), 40);
    assert!(factors.iter().all(|a| (0.0..=1.0).contains(a)));

    let wake_phi = history.wake_phi_loss.as_ref().expect("wake-phi history");
    assert_eq!(wake_phi.len(), 40);
    assert!(wake_phi.iter().all(|l| l.is_finite()));
    Ok(())
}

#[test]
fn histories_follow_enabled_phases() -> anyhow::Result<()> {
    let params = GenerativeParams::default();
    let mut rng = StdRng::seed_from_u64(5);

    let fit = train_rws(&config(10), &params, &mut rng)?;
    assert_eq!(fit.history.mean1.len(), 10);
    assert_eq!(fit.history.wake_theta_loss.len(), 10);
    assert_eq!(fit.history.sleep_phi_loss.as_ref().map(|h| h.len()), Some(10));
    assert!(fit.history.wake_phi_loss.is_none());
    assert!(fit.history.anneal_factor.is_none());

    let both = RwsConfig {
        wake_phi: true,
        ..config(10)
    };
    let fit = train_rws(&both, &params, &mut rng)?;
    assert_eq!(fit.history.sleep_phi_loss.as_ref().map(|h| h.len()), Some(10));
    assert_eq!(fit.history.wake_phi_loss.as_ref().map(|h| h.len()), Some(10));
    Ok(())
}

#[test]
fn wake_sleep_moves_branch_mean_towards_truth() -> anyhow::Result<()> {
    let params = GenerativeParams::default();
    let config = RwsConfig {
        num_obs: 50,
        theta_learning_rate: 0.02,
        phi_learning_rate: 0.02,
        ..config(200)
    };
    let mut rng = StdRng::seed_from_u64(11);

    let fit = train_rws(&config, &params, &mut rng)?;
    let tail = &fit.history.mean1[150..];
    let last = tail.iter().sum::<f32>() / tail.len() as f32;
    assert!(last < 2.0, "mean1 ended at {}", last);
    Ok(())
}

#[test]
fn configuration_errors() {
    let params = GenerativeParams::default();
    let mut rng = StdRng::seed_from_u64(0);

    let no_phi = RwsConfig {
        sleep_phi: false,
        wake_phi: false,
        ..config(5)
    };
    let err = train_rws(&no_phi, &params, &mut rng).err().expect("must fail");
    assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::NoPhiPhase));

    let anneal_sleep_only = RwsConfig {
        anneal: Some(AnnealConfig::default()),
        ..config(5)
    };
    let err = train_rws(&anneal_sleep_only, &params, &mut rng)
        .err()
        .expect("must fail");
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::AnnealWithoutWakePhi)
    );

    let bad_fraction = RwsConfig {
        wake_phi: true,
        anneal: Some(AnnealConfig {
            init_factor: 0.5,
            ess_fraction: 1.5,
        }),
        ..config(5)
    };
    let err = train_rws(&bad_fraction, &params, &mut rng)
        .err()
        .expect("must fail");
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::InvalidEssFraction(1.5))
    );
}
