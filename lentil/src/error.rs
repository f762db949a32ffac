use candle_util::GpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("non-finite {what}")]
    NonFinite { what: String },

    /// A training step was abandoned before any parameter was updated.
    #[error("step {step} failed (last finite loss: {last_finite_loss:?}): {source}")]
    StepFailed {
        step: usize,
        last_finite_loss: Option<f64>,
        #[source]
        source: Box<AlignError>,
    },

    #[error("parameter store lock is poisoned")]
    Poisoned,

    #[error(transparent)]
    Gp(#[from] GpError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AlignError {
    /// Ill-conditioned kernel matrices and NaN/Inf, possibly wrapped
    /// in a failed step
    pub fn is_numerical(&self) -> bool {
        match self {
            AlignError::NonFinite { .. } => true,
            AlignError::Gp(e) => e.is_numerical(),
            AlignError::StepFailed { source, .. } => source.is_numerical(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AlignError>;
