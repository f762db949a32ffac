//! Sparse variational GP layer with inducing points (SVGP).
//!
//! For every output channel k the layer keeps
//! `q(u_k) = N(μ_k, S_k S_kᵀ)` at m inducing locations Z, where `S_k`
//! is lower triangular with a positive diagonal. In the whitened
//! parameterization `u = L v` with `L = chol(K_zz)` and the prior is
//! `p(v) = N(0, I)`; otherwise `p(u) = N(0, K_zz)`.

use crate::candle_kernels::Kernel;
use crate::candle_linalg::*;
use crate::candle_model_traits::{InducingLayerT, KernelT};
use crate::gp_error::{GpError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// Predictive variances are floored here to absorb round-off.
pub const MIN_VARIANCE: f64 = 1e-10;

#[derive(Clone, Debug)]
pub struct SvgpLayer {
    kernel: Kernel,
    inducing_md: Tensor,
    q_mu_mk: Tensor,
    q_offdiag_kmm: Tensor,
    q_ln_diag_km: Tensor,
    whiten: bool,
    jitter: f64,
}

impl SvgpLayer {
    /// Initialize `q` with zero mean and a diagonal factor
    /// `q_sqrt_init * I`. With `q_sqrt_init = 1` and whitening this is
    /// exactly the prior.
    ///
    /// # Arguments
    /// * `kernel` - covariance function
    /// * `inducing_md` - inducing locations (m x d), learnable or not
    /// * `dim_output` - number of output channels k
    /// * `whiten` - whitened parameterization
    /// * `jitter` - added to the diagonal of `K_zz`
    /// * `q_sqrt_init` - initial diagonal of the factor `S`
    /// * `vb` - variable builder for the variational parameters
    pub fn new(
        kernel: Kernel,
        inducing_md: Tensor,
        dim_output: usize,
        whiten: bool,
        jitter: f64,
        q_sqrt_init: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !(q_sqrt_init > 0.0 && q_sqrt_init.is_finite()) {
            return Err(GpError::InvalidParameter(format!(
                "initial factor scale must be positive, got {}",
                q_sqrt_init
            )));
        }

        let (m, _) = inducing_md.dims2()?;
        let zero = || candle_nn::Init::Const(0.0);

        let q_mu_mk = vb.get_with_hints((m, dim_output), "q_mu", zero())?;
        let q_offdiag_kmm = vb.get_with_hints((dim_output, m, m), "q_offdiag", zero())?;
        let q_ln_diag_km = vb.get_with_hints(
            (dim_output, m),
            "q_ln_diag",
            candle_nn::Init::Const(q_sqrt_init.ln()),
        )?;

        Self::from_parts(
            kernel,
            inducing_md,
            q_mu_mk,
            q_offdiag_kmm,
            q_ln_diag_km,
            whiten,
            jitter,
        )
    }

    /// Assemble a layer from existing tensors
    ///
    /// * `q_mu_mk` - variational mean (m x k)
    /// * `q_offdiag_kmm` - factor entries; only the strictly lower part is used
    /// * `q_ln_diag_km` - log of the factor diagonal (k x m)
    pub fn from_parts(
        kernel: Kernel,
        inducing_md: Tensor,
        q_mu_mk: Tensor,
        q_offdiag_kmm: Tensor,
        q_ln_diag_km: Tensor,
        whiten: bool,
        jitter: f64,
    ) -> Result<Self> {
        let (m, _) = inducing_md.dims2()?;
        let (m_mu, k) = q_mu_mk.dims2()?;
        let (k_off, m_off1, m_off2) = q_offdiag_kmm.dims3()?;
        let (k_diag, m_diag) = q_ln_diag_km.dims2()?;

        if m == 0 || k == 0 {
            return Err(GpError::ShapeMismatch {
                context: "svgp layer",
                expected: "at least one inducing point and one output".into(),
                got: format!("m = {}, k = {}", m, k),
            });
        }

        if m_mu != m || k_off != k || m_off1 != m || m_off2 != m || k_diag != k || m_diag != m {
            return Err(GpError::ShapeMismatch {
                context: "svgp layer",
                expected: format!("q_mu {m} x {k}, q_offdiag {k} x {m} x {m}, q_ln_diag {k} x {m}"),
                got: format!(
                    "q_mu {m_mu} x {k}, q_offdiag {k_off} x {m_off1} x {m_off2}, q_ln_diag {k_diag} x {m_diag}"
                ),
            });
        }

        if !(jitter >= 0.0 && jitter.is_finite()) {
            return Err(GpError::InvalidParameter(format!(
                "jitter must be finite and non-negative, got {}",
                jitter
            )));
        }

        Ok(Self {
            kernel,
            inducing_md,
            q_mu_mk,
            q_offdiag_kmm,
            q_ln_diag_km,
            whiten,
            jitter,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn inducing(&self) -> &Tensor {
        &self.inducing_md
    }

    pub fn q_mu(&self) -> &Tensor {
        &self.q_mu_mk
    }

    pub fn is_whitened(&self) -> bool {
        self.whiten
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Lower triangular factors `S_k` (k x m x m)
    pub fn q_sqrt(&self) -> Result<Tensor> {
        let m = self.num_inducing();
        let dev = self.q_mu_mk.device();
        let dtype = self.q_mu_mk.dtype();

        let eye_mm = Tensor::eye(m, dtype, dev)?;
        let strict_mm = (Tensor::tril2(m, dtype, dev)? - &eye_mm)?;

        let diag_kmm = self
            .q_ln_diag_km
            .exp()?
            .unsqueeze(2)?
            .broadcast_mul(&eye_mm)?;

        Ok(self
            .q_offdiag_kmm
            .broadcast_mul(&strict_mm)?
            .add(&diag_kmm)?)
    }

    /// `K_zz + jitter * I`
    pub fn prior_covariance(&self) -> Result<Tensor> {
        let k_mm = self.kernel.covariance(&self.inducing_md, &self.inducing_md)?;
        add_jitter(&k_mm, self.jitter)
    }

    /// Factorize the prior covariance once for repeated use
    pub fn posterior(&self) -> Result<SvgpPosterior<'_>> {
        let chol_mm = cholesky(&self.prior_covariance()?)?;
        let q_sqrt_kmm = self.q_sqrt()?;
        Ok(SvgpPosterior {
            layer: self,
            chol_mm,
            q_sqrt_kmm,
        })
    }
}

/// An [`SvgpLayer`] with its Cholesky factor computed.
pub struct SvgpPosterior<'a> {
    layer: &'a SvgpLayer,
    chol_mm: Tensor,
    q_sqrt_kmm: Tensor,
}

impl SvgpPosterior<'_> {
    pub fn cholesky_factor(&self) -> &Tensor {
        &self.chol_mm
    }

    /// Marginal mean and variance at `x_nd`
    ///
    /// ```text
    /// A    = L⁻¹ K_zx
    /// mean = Aᵀ μ                       (whitened)
    ///      = Aᵀ L⁻¹ μ                   (unwhitened)
    /// var  = k_xx - Σ_m A² + Σ_m (Sᵀ B)²,  B = A or L⁻ᵀ A
    /// ```
    pub fn predict(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let layer = self.layer;
        let (_, d) = x_nd.dims2()?;
        let d_inducing = layer.dim_input();
        if d != d_inducing {
            return Err(GpError::ShapeMismatch {
                context: "svgp predict",
                expected: format!("{} input dims", d_inducing),
                got: format!("{} input dims", d),
            });
        }

        let k_mn = layer.kernel.covariance(&layer.inducing_md, x_nd)?;
        let a_mn = solve_lower(&self.chol_mm, &k_mn)?;
        let a_nm = a_mn.t()?.contiguous()?;

        let (mean_nk, b_mn) = if layer.whiten {
            (a_nm.matmul(&layer.q_mu_mk)?, a_mn.clone())
        } else {
            let alpha_mk = solve_lower(&self.chol_mm, &layer.q_mu_mk)?;
            (
                a_nm.matmul(&alpha_mk)?,
                solve_lower_transpose(&self.chol_mm, &a_mn)?,
            )
        };

        let kxx_n = layer.kernel.diagonal(x_nd)?;
        let qxx_n = a_mn.sqr()?.sum(0)?;

        let s_t_kmm = self.q_sqrt_kmm.transpose(1, 2)?.contiguous()?;
        let sbs_kn = s_t_kmm.broadcast_matmul(&b_mn)?.sqr()?.sum(1)?;

        let var_nk = sbs_kn
            .broadcast_add(&(kxx_n - qxx_n)?.unsqueeze(0)?)?
            .t()?
            .contiguous()?
            .clamp(MIN_VARIANCE, f64::INFINITY)?;

        Ok((mean_nk, var_nk))
    }

    /// `KL(q(u) || p(u))` summed over output channels
    ///
    /// ```text
    /// whitened:   ½ Σ_k [ ‖S_k‖² + ‖μ_k‖² - m - log|S_k S_kᵀ| ]
    /// unwhitened: ½ Σ_k [ ‖L⁻¹S_k‖² + ‖L⁻¹μ_k‖² - m + log|K| - log|S_k S_kᵀ| ]
    /// ```
    pub fn kl_term(&self) -> Result<Tensor> {
        let layer = self.layer;
        let m = layer.num_inducing();
        let k = layer.dim_output();

        let ln_det_s = (layer.q_ln_diag_km.sum_all()? * 2.0)?;

        let (trace, maha) = if layer.whiten {
            (
                self.q_sqrt_kmm.sqr()?.sum_all()?,
                layer.q_mu_mk.sqr()?.sum_all()?,
            )
        } else {
            // [S_1 | S_2 | ...] as one (m x k*m) right-hand side
            let s_m_km = self
                .q_sqrt_kmm
                .transpose(0, 1)?
                .contiguous()?
                .reshape((m, k * m))?;
            let trace = solve_lower(&self.chol_mm, &s_m_km)?.sqr()?.sum_all()?;
            let maha = solve_lower(&self.chol_mm, &layer.q_mu_mk)?
                .sqr()?
                .sum_all()?;
            let ln_det_k = (log_det_from_cholesky(&self.chol_mm)? * k as f64)?;
            ((trace + ln_det_k)?, maha)
        };

        let kl = ((((trace + maha)? - (m * k) as f64)? - ln_det_s)? * 0.5)?;
        Ok(kl)
    }
}

impl InducingLayerT for SvgpLayer {
    fn predict(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        self.posterior()?.predict(x_nd)
    }

    fn kl_term(&self) -> Result<Tensor> {
        self.posterior()?.kl_term()
    }

    fn dim_input(&self) -> usize {
        self.inducing_md.dims().get(1).copied().unwrap_or(0)
    }

    fn dim_output(&self) -> usize {
        self.q_mu_mk.dims().get(1).copied().unwrap_or(0)
    }

    fn num_inducing(&self) -> usize {
        self.inducing_md.dims().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_kernels::KernelKind;
    use candle_core::{DType, Device};

    const M: usize = 4;
    const K: usize = 2;

    fn inducing(dev: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(vec![0.0f64, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (M, 2), dev)
    }

    fn kernel(dev: &Device) -> candle_core::Result<Kernel> {
        Ok(Kernel::from_log_params(
            KernelKind::SquaredExponential,
            Tensor::new(0.8f64.ln(), dev)?,
            Tensor::new(1.5f64.ln(), dev)?,
        ))
    }

    fn queries(dev: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(vec![0.2f64, 0.1, 0.7, 0.9, -0.5, 1.4], (3, 2), dev)
    }

    fn at_prior(whiten: bool, dev: &Device) -> Result<SvgpLayer> {
        SvgpLayer::from_parts(
            kernel(dev)?,
            inducing(dev)?,
            Tensor::zeros((M, K), DType::F64, dev)?,
            Tensor::zeros((K, M, M), DType::F64, dev)?,
            Tensor::zeros((K, M), DType::F64, dev)?,
            whiten,
            1e-6,
        )
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
        to_host_scalar(&(a - b)?.abs()?.flatten_all()?.max(0)?)
    }

    #[test]
    fn whitened_kl_is_zero_at_prior() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let layer = at_prior(true, &dev)?;
        let kl = to_host_scalar(&layer.kl_term()?)?;
        approx::assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn fresh_layer_kl() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);

        let prior = SvgpLayer::new(kernel(&dev)?, inducing(&dev)?, K, true, 1e-6, 1.0, vb.pp("a"))?;
        approx::assert_abs_diff_eq!(to_host_scalar(&prior.kl_term()?)?, 0.0, epsilon = 1e-10);

        // S = s I: ½ Σ (s² - 1 - 2 ln s) per diagonal entry
        let s = 0.1f64;
        let narrow = SvgpLayer::new(kernel(&dev)?, inducing(&dev)?, K, true, 1e-6, s, vb.pp("b"))?;
        let expected = 0.5 * (M * K) as f64 * (s * s - 1.0 - 2.0 * s.ln());
        approx::assert_abs_diff_eq!(to_host_scalar(&narrow.kl_term()?)?, expected, epsilon = 1e-8);

        assert!(SvgpLayer::new(kernel(&dev)?, inducing(&dev)?, K, true, 1e-6, 0.0, vb.pp("c")).is_err());
        Ok(())
    }

    #[test]
    fn kl_grows_when_mean_moves() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let layer = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            Tensor::full(0.5f64, (M, K), &dev)?,
            Tensor::zeros((K, M, M), DType::F64, &dev)?,
            Tensor::zeros((K, M), DType::F64, &dev)?,
            true,
            1e-6,
        )?;
        // ½ ‖μ‖² with S = I
        let kl = to_host_scalar(&layer.kl_term()?)?;
        approx::assert_abs_diff_eq!(kl, 0.5 * 0.25 * (M * K) as f64, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn unwhitened_kl_vanishes_when_q_equals_prior() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let prior = at_prior(false, &dev)?;
        let l_mm = prior.posterior()?.cholesky_factor().clone();

        let layer = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            Tensor::zeros((M, K), DType::F64, &dev)?,
            Tensor::stack(&[&l_mm, &l_mm], 0)?,
            Tensor::stack(&[diag(&l_mm)?.log()?, diag(&l_mm)?.log()?], 0)?,
            false,
            1e-6,
        )?;
        let kl = to_host_scalar(&layer.kl_term()?)?;
        approx::assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn whitened_and_unwhitened_agree() -> anyhow::Result<()> {
        let dev = Device::Cpu;

        let mu_w = Tensor::from_vec(
            vec![0.3f64, -0.2, 1.1, 0.4, -0.7, 0.0, 0.25, 0.9],
            (M, K),
            &dev,
        )?;
        let offdiag = (Tensor::ones((K, M, M), DType::F64, &dev)? * 0.15)?;
        let ln_diag = Tensor::from_vec(
            vec![-0.5f64, -0.2, 0.1, -1.0, 0.0, -0.3, -0.6, 0.2],
            (K, M),
            &dev,
        )?;

        let whitened = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            mu_w.clone(),
            offdiag.clone(),
            ln_diag.clone(),
            true,
            1e-6,
        )?;
        let post_w = whitened.posterior()?;
        let l_mm = post_w.cholesky_factor().clone();

        // u = L v
        let mu_u = l_mm.matmul(&mu_w)?;
        let s_u = l_mm.broadcast_matmul(&whitened.q_sqrt()?)?;
        let unwhitened = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            mu_u,
            s_u.clone(),
            diag(&s_u)?.log()?,
            false,
            1e-6,
        )?;
        let post_u = unwhitened.posterior()?;

        let x = queries(&dev)?;
        let (mean_w, var_w) = post_w.predict(&x)?;
        let (mean_u, var_u) = post_u.predict(&x)?;

        assert!(max_abs_diff(&mean_w, &mean_u)? < 1e-8);
        assert!(max_abs_diff(&var_w, &var_u)? < 1e-8);

        let kl_w = to_host_scalar(&post_w.kl_term()?)?;
        let kl_u = to_host_scalar(&post_u.kl_term()?)?;
        approx::assert_abs_diff_eq!(kl_w, kl_u, epsilon = 1e-6);
        assert!(kl_w > 0.0);
        Ok(())
    }

    #[test]
    fn variance_shrinks_near_inducing_points() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let layer = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            Tensor::zeros((M, K), DType::F64, &dev)?,
            Tensor::zeros((K, M, M), DType::F64, &dev)?,
            Tensor::full(0.1f64.ln(), (K, M), &dev)?,
            true,
            1e-6,
        )?;

        let x = Tensor::from_vec(vec![1.0f64, 1.0, 6.0, -6.0], (2, 2), &dev)?;
        let (mean, var) = layer.predict(&x)?;
        assert_eq!(mean.dims(), &[2, K]);
        assert_eq!(var.dims(), &[2, K]);

        let var = var.to_vec2::<f64>()?;
        for k in 0..K {
            assert!(var[0][k] < 0.1, "near {}", var[0][k]);
            // far from Z the prior variance σ² comes back
            approx::assert_abs_diff_eq!(var[1][k], 1.5, epsilon = 1e-6);
            assert!(var[0][k] >= MIN_VARIANCE);
        }
        Ok(())
    }

    #[test]
    fn duplicated_inducing_points_need_jitter() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::from_vec(vec![0.0f64, 0.0, 0.5, 0.5, 0.5, 0.5], (3, 2), &dev)?;
        let make = |jitter: f64| -> Result<SvgpLayer> {
            SvgpLayer::from_parts(
                kernel(&dev)?,
                z.clone(),
                Tensor::zeros((3, 1), DType::F64, &dev)?,
                Tensor::zeros((1, 3, 3), DType::F64, &dev)?,
                Tensor::zeros((1, 3), DType::F64, &dev)?,
                true,
                jitter,
            )
        };

        let err = make(0.0)?.predict(&queries(&dev)?).unwrap_err();
        assert!(err.is_numerical(), "{}", err);
        assert!(matches!(err, GpError::NotPositiveDefinite { .. }));

        assert!(make(1e-4)?.predict(&queries(&dev)?).is_ok());
        Ok(())
    }

    #[test]
    fn rejects_bad_shapes() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let bad = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            Tensor::zeros((M + 1, K), DType::F64, &dev)?,
            Tensor::zeros((K, M, M), DType::F64, &dev)?,
            Tensor::zeros((K, M), DType::F64, &dev)?,
            true,
            1e-6,
        );
        assert!(matches!(bad, Err(GpError::ShapeMismatch { .. })));

        let layer = at_prior(true, &dev)?;
        let x3 = Tensor::zeros((5, 3), DType::F64, &dev)?;
        assert!(matches!(layer.predict(&x3), Err(GpError::ShapeMismatch { .. })));

        let negative = SvgpLayer::from_parts(
            kernel(&dev)?,
            inducing(&dev)?,
            Tensor::zeros((M, K), DType::F64, &dev)?,
            Tensor::zeros((K, M, M), DType::F64, &dev)?,
            Tensor::zeros((K, M), DType::F64, &dev)?,
            true,
            -1.0,
        );
        assert!(matches!(negative, Err(GpError::InvalidParameter(_))));
        Ok(())
    }
}
