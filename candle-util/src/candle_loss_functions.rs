use core::f64;

use candle_core::{Result, Tensor};

/// Expected Gaussian log-likelihood under a Gaussian latent
///
/// E_q[log N(y | f, τ²)] with q(f) = N(μ, σ²), summed over output columns
///
/// llik(i) = -0.5 * sum_k [ log(2π τ²) + ((y(i,k) - μ(i,k))² + σ²(i,k)) / τ² ]
///
/// * `y_nk` - observed data
/// * `mean_nk` - latent mean μ
/// * `var_nk` - latent variance σ²
/// * `noise_var` - observation noise τ², broadcastable to `y_nk`
///
pub fn gaussian_expected_log_likelihood(
    y_nk: &Tensor,
    mean_nk: &Tensor,
    var_nk: &Tensor,
    noise_var: &Tensor,
) -> Result<Tensor> {
    let resid_nk = y_nk.sub(mean_nk)?.sqr()?.add(var_nk)?;
    let ln_norm = (noise_var.log()? + (2. * f64::consts::PI).ln())?;

    resid_nk
        .broadcast_div(noise_var)?
        .broadcast_add(&ln_norm)?
        .sum(y_nk.rank() - 1)?
        * (-0.5)
}
