pub mod candle_aux_layers;
pub mod candle_inference;
pub mod candle_log_domain;
pub mod candle_loss_functions;
pub mod candle_sampling;

pub use candle_core;
pub use candle_nn;
