use crate::gp_error;
use candle_core::{Result, Tensor};

pub trait KernelT {
    /// Cross-covariance between two point sets
    ///
    /// # Arguments
    /// * `x_nd` - points (n x d)
    /// * `y_md` - points (m x d)
    ///
    /// # Returns `k_nm` (n x m)
    fn covariance(&self, x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor>;

    /// Self-covariance `k(x_i, x_i)` of each point, shape (n,)
    fn diagonal(&self, x_nd: &Tensor) -> Result<Tensor>;
}

pub trait InducingLayerT {
    /// Marginal predictive distribution of the layer's outputs
    ///
    /// # Arguments
    /// * `x_nd` - query points (n x d)
    ///
    /// # Returns `(mean_nk, var_nk)`
    fn predict(&self, x_nd: &Tensor) -> gp_error::Result<(Tensor, Tensor)>;

    /// KL divergence of the inducing distribution from its prior (scalar)
    fn kl_term(&self) -> gp_error::Result<Tensor>;

    fn dim_input(&self) -> usize;

    fn dim_output(&self) -> usize;

    fn num_inducing(&self) -> usize;
}
