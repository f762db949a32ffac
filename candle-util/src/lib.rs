pub mod candle_kernels;
pub mod candle_linalg;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_svgp;
pub mod gp_error;

pub use gp_error::GpError;

pub use candle_core;
pub use candle_nn;
