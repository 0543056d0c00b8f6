//! Temperature for the wake-phi importance weights.
//!
//! The weights `a * log_weight` are self-normalized at a factor `a ∈ [0, 1]`.
//! When the batch-mean ESS at the current `a` drops below
//! `ess_fraction * P`, `a` is lowered to the largest value that still
//! reaches the target; otherwise it moves halfway towards one.

use crate::common::*;
use crate::error::ConfigError;

use candle_util::candle_log_domain::ess;
use rayon::prelude::*;

/// Coarse probe of `mean ESS(a)` before choosing a search
const NUM_GRID: usize = 20;
const MAX_BISECT: usize = 60;
const BISECT_TOL: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnnealConfig {
    pub init_factor: f64,
    /// target ESS as a fraction of the number of particles
    pub ess_fraction: f64,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            init_factor: 0.0,
            ess_fraction: 0.9,
        }
    }
}

impl AnnealConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.init_factor) {
            return Err(ConfigError::InvalidAnnealFactor(self.init_factor));
        }
        if !(self.ess_fraction > 0.0 && self.ess_fraction <= 1.0) {
            return Err(ConfigError::InvalidEssFraction(self.ess_fraction));
        }
        Ok(())
    }
}

/// How `solve_largest_crossing` found its answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMethod {
    /// the target is met at `a = 1`
    Boundary,
    /// the probe was monotone; plain bisection on [0, 1]
    Bisection,
    /// the probe was not monotone; bisection inside the last bracket
    GridScan,
}

/// Largest `a ∈ [0, 1]` with `f(a) >= target`, assuming `f(0) >= target`
///
/// - `f`: e.g. `a ↦ mean ESS(a)`, expected non-increasing but not trusted to be
/// - `target`: level to hit
pub fn solve_largest_crossing<F>(f: F, target: f64) -> (f64, SearchMethod)
where
    F: Fn(f64) -> f64,
{
    if f(1.0) >= target {
        return (1.0, SearchMethod::Boundary);
    }

    let grid: Vec<f64> = (0..=NUM_GRID).map(|j| j as f64 / NUM_GRID as f64).collect();
    let values: Vec<f64> = grid.iter().map(|&a| f(a)).collect();

    let monotone = values
        .windows(2)
        .all(|v| v[1] <= v[0] + 1e-9 * v[0].abs().max(1.0));

    if monotone {
        return (bisect(&f, target, 0.0, 1.0), SearchMethod::Bisection);
    }

    // the last grid point still at or above target; the next one is below
    match values.iter().rposition(|&v| v >= target) {
        Some(j) if j < NUM_GRID => (bisect(&f, target, grid[j], grid[j + 1]), SearchMethod::GridScan),
        Some(_) => (1.0, SearchMethod::GridScan),
        None => (0.0, SearchMethod::GridScan),
    }
}

/// Shrink `[lo, hi]` keeping `f(lo) >= target > f(hi)`; returns `lo`
fn bisect<F>(f: &F, target: f64, mut lo: f64, mut hi: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    for _ in 0..MAX_BISECT {
        if hi - lo < BISECT_TOL {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if f(mid) >= target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Mean over observations of ESS at temperature `anneal`
///
/// - `log_weight`: one row of particle log-weights per observation
pub fn mean_ess(log_weight: &[Vec<f64>], anneal: f64) -> f64 {
    if log_weight.is_empty() {
        return 0.0;
    }
    let total: f64 = log_weight
        .par_iter()
        .map(|w| ess(w, anneal))
        .sum();
    total / log_weight.len() as f64
}

pub struct AnnealController {
    config: AnnealConfig,
    factor: f64,
}

impl AnnealController {
    pub fn new(config: AnnealConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            factor: config.init_factor,
        })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Retune the factor from this batch's weights and return it
    ///
    /// - `log_weight`: (m rows) x (P particles)
    pub fn update(&mut self, log_weight: &[Vec<f64>]) -> f64 {
        let Some(num_particles) = log_weight.first().map(|w| w.len()) else {
            return self.factor;
        };
        let target = self.config.ess_fraction * num_particles as f64;
        let current = mean_ess(log_weight, self.factor);

        if current < target {
            let (a, method) = solve_largest_crossing(|a| mean_ess(log_weight, a), target);
            if method == SearchMethod::GridScan {
                warn!("mean ESS is not monotone in the anneal factor; used a grid scan");
            }
            debug!(
                "ESS {:.3} < {:.3}: anneal {:.4} -> {:.4} ({:?})",
                current, target, self.factor, a, method
            );
            self.factor = a;
        } else {
            let a = 0.5 * (1.0 + self.factor);
            debug!(
                "ESS {:.3} >= {:.3}: anneal {:.4} -> {:.4}",
                current, target, self.factor, a
            );
            self.factor = a;
        }

        self.factor = self.factor.clamp(0.0, 1.0);
        self.factor
    }
}
