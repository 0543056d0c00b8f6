use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};

/// Settings shared by every training loop
#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub num_iterations: usize,
    /// report progress through `log::info!` every this many iterations
    pub log_every: usize,
    pub device: candle_core::Device,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_iterations: 1000,
            log_every: 100,
            device: candle_core::Device::Cpu,
            show_progress: false,
            verbose: false,
        }
    }
}

impl TrainConfig {
    pub fn should_log(&self, iter: usize) -> bool {
        self.verbose || (self.log_every > 0 && iter % self.log_every == 0)
    }

    /// A progress bar over iterations, hidden unless requested
    pub fn progress_bar(&self) -> ProgressBar {
        let pb = ProgressBar::new(self.num_iterations as u64);
        if !self.show_progress || self.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb
    }
}

/// Plain Adam (AdamW without weight decay) over `vars`
pub fn adam(vars: Vec<Var>, learning_rate: f64) -> Result<AdamW> {
    AdamW::new(
        vars,
        ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
}
