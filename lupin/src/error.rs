use thiserror::Error;

/// Problems with a run's settings, reported before any work starts
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown gradient estimator `{0}` (expected `reinforce` or `vimco`)")]
    UnknownEstimator(String),

    #[error("wake-sleep needs at least one of the sleep-phi or wake-phi phases")]
    NoPhiPhase,

    #[error("annealing is only defined for the wake-phi phase, which is disabled")]
    AnnealWithoutWakePhi,

    #[error("initial anneal factor {0} is outside [0, 1]")]
    InvalidAnnealFactor(f64),

    #[error("target ESS fraction {0} is outside (0, 1]")]
    InvalidEssFraction(f64),

    #[error("{estimator} needs at least {min} particle(s), got {num_particles}")]
    TooFewParticles {
        estimator: String,
        min: usize,
        num_particles: usize,
    },

    #[error("{0} must be two positive probabilities summing to one")]
    InvalidProbabilities(&'static str),

    #[error("{0} must be a positive, finite scale")]
    NonPositiveScale(&'static str),

    #[error("{0} must be finite")]
    NonFinite(&'static str),

    #[error("{0} must be at least one")]
    EmptyCount(&'static str),
}

pub(crate) fn check_probs(name: &'static str, probs: &[f64]) -> Result<(), ConfigError> {
    let total: f64 = probs.iter().sum();
    let valid = probs.len() == 2
        && probs.iter().all(|p| p.is_finite() && *p > 0.0)
        && (total - 1.0).abs() < 1e-4;
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbabilities(name))
    }
}

pub(crate) fn check_scale(name: &'static str, scale: f64) -> Result<(), ConfigError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositiveScale(name))
    }
}

pub(crate) fn check_count(name: &'static str, count: usize) -> Result<(), ConfigError> {
    if count > 0 {
        Ok(())
    } else {
        Err(ConfigError::EmptyCount(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_checks() {
        assert!(check_probs("p", &[0.5, 0.5]).is_ok());
        assert!(check_probs("p", &[0.3, 0.7]).is_ok());
        assert_eq!(
            check_probs("p", &[0.5, 0.6]),
            Err(ConfigError::InvalidProbabilities("p"))
        );
        assert!(check_probs("p", &[1.2, -0.2]).is_err());
        assert!(check_probs("p", &[1.0]).is_err());
        // a zero-probability branch gives particles a -inf log weight
        assert!(check_probs("p", &[1.0, 0.0]).is_err());
        assert!(check_probs("p", &[0.0, 1.0]).is_err());
    }

    #[test]
    fn scale_checks() {
        assert!(check_scale("s", 0.1).is_ok());
        assert!(check_scale("s", 0.0).is_err());
        assert!(check_scale("s", f64::NAN).is_err());
    }
}
