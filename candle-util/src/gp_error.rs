use thiserror::Error;

/// Errors raised by the Gaussian process building blocks.
#[derive(Debug, Error)]
pub enum GpError {
    /// A Cholesky pivot fell below tolerance, e.g. duplicated inducing
    /// locations without jitter.
    #[error("matrix is not positive definite: pivot {pivot:e} at row {row} (tolerance {tolerance:e})")]
    NotPositiveDefinite {
        row: usize,
        pivot: f64,
        tolerance: f64,
    },

    #[error("non-finite values in {0}")]
    NonFinite(&'static str),

    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        got: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl GpError {
    /// Ill-conditioning or NaN/Inf, as opposed to misuse of the API
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            GpError::NotPositiveDefinite { .. } | GpError::NonFinite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GpError>;
