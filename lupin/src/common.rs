pub use log::{debug, info, warn};

pub use candle_util::{candle_core, candle_nn};

pub use candle_util::candle_core::{DType, Device, Tensor};
pub use candle_util::candle_nn::{VarBuilder, VarMap};

pub use rand::Rng;
