pub mod config;
pub mod convert;
pub mod elbo;
pub mod error;
pub mod fit;
pub mod inducing;
pub mod minibatch;
pub mod model;
pub mod params;
pub mod predict;
pub mod sample;
pub mod sampling;
pub mod simulate;
pub mod warp;

pub use config::{AlignConfig, InducingInit, KernelConfig, TrainConfig, WarpMean};
pub use error::AlignError;
pub use fit::{fit, FitCallback, FitReport, FitState, LossPlateau, StepControl, Trainer};
pub use model::WarpAlignModel;
pub use predict::{AlignedCoords, FeaturePrediction, HyperparameterSummary};
pub use sample::Sample;

pub use candle_util::candle_kernels::KernelKind;
