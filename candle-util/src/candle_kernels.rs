use crate::candle_model_traits::KernelT;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

/// Raw log-scale parameters are clamped to this range so that
/// `exp` stays finite in single precision.
const MAX_LN_PARAM: f64 = 10.0;

/// Added under the square root of Matérn distances so the
/// gradient at r = 0 stays finite.
const R_EPS: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelKind {
    /// σ² exp(-r²/2)
    SquaredExponential,
    /// σ² (1 + √3 r) exp(-√3 r)
    Matern32,
    /// σ² (1 + √5 r + 5r²/3) exp(-√5 r)
    Matern52,
}

/// Stationary isotropic kernel with learnable lengthscale ℓ and
/// output scale σ², stored as log values.
#[derive(Clone, Debug)]
pub struct Kernel {
    kind: KernelKind,
    ln_lengthscale: Tensor,
    ln_outputscale: Tensor,
}

impl Kernel {
    /// # Arguments
    /// * `kind` - covariance family
    /// * `lengthscale` - initial ℓ > 0
    /// * `outputscale` - initial σ² > 0
    /// * `vb` - variable builder
    pub fn new(kind: KernelKind, lengthscale: f64, outputscale: f64, vb: VarBuilder) -> Result<Self> {
        if !(lengthscale > 0.0 && lengthscale.is_finite()) {
            candle_core::bail!("kernel lengthscale must be positive, got {}", lengthscale);
        }
        if !(outputscale > 0.0 && outputscale.is_finite()) {
            candle_core::bail!("kernel outputscale must be positive, got {}", outputscale);
        }

        let ln_lengthscale = vb.get_with_hints(
            (),
            "ln_lengthscale",
            candle_nn::Init::Const(lengthscale.ln()),
        )?;
        let ln_outputscale = vb.get_with_hints(
            (),
            "ln_outputscale",
            candle_nn::Init::Const(outputscale.ln()),
        )?;

        Ok(Self {
            kind,
            ln_lengthscale,
            ln_outputscale,
        })
    }

    /// Wrap existing scalar tensors, e.g. constants in tests
    pub fn from_log_params(kind: KernelKind, ln_lengthscale: Tensor, ln_outputscale: Tensor) -> Self {
        Self {
            kind,
            ln_lengthscale,
            ln_outputscale,
        }
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    /// ℓ = exp(clamp(ln ℓ))
    pub fn lengthscale_tensor(&self) -> Result<Tensor> {
        self.ln_lengthscale.clamp(-MAX_LN_PARAM, MAX_LN_PARAM)?.exp()
    }

    /// σ² = exp(clamp(ln σ²))
    pub fn outputscale_tensor(&self) -> Result<Tensor> {
        self.ln_outputscale.clamp(-MAX_LN_PARAM, MAX_LN_PARAM)?.exp()
    }

    pub fn lengthscale(&self) -> Result<f64> {
        scalar_to_f64(&self.lengthscale_tensor()?)
    }

    pub fn outputscale(&self) -> Result<f64> {
        scalar_to_f64(&self.outputscale_tensor()?)
    }
}

fn scalar_to_f64(x: &Tensor) -> Result<f64> {
    // Metal has no f64; convert on the host
    x.to_device(&Device::Cpu)?.to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// Pairwise squared Euclidean distances, clamped at zero
///
/// * `x_nd` - (n x d)
/// * `y_md` - (m x d)
pub fn squared_distance(x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor> {
    let x_sq_n1 = x_nd.sqr()?.sum_keepdim(1)?;
    let y_sq_1m = y_md.sqr()?.sum_keepdim(1)?.t()?;
    let cross_nm = x_nd.matmul(&y_md.t()?)?;
    x_sq_n1
        .broadcast_add(&y_sq_1m)?
        .sub(&(cross_nm * 2.0)?)?
        .clamp(0.0, f64::INFINITY)
}

impl KernelT for Kernel {
    fn covariance(&self, x_nd: &Tensor, y_md: &Tensor) -> Result<Tensor> {
        let ell = self.lengthscale_tensor()?;
        let r2_nm = squared_distance(&x_nd.broadcast_div(&ell)?, &y_md.broadcast_div(&ell)?)?;

        let k_nm = match self.kind {
            KernelKind::SquaredExponential => (r2_nm * -0.5)?.exp()?,
            KernelKind::Matern32 => {
                let s_nm = ((&r2_nm + R_EPS)?.sqrt()? * 3_f64.sqrt())?;
                ((&s_nm + 1.0)? * s_nm.neg()?.exp()?)?
            }
            KernelKind::Matern52 => {
                let s_nm = ((&r2_nm + R_EPS)?.sqrt()? * 5_f64.sqrt())?;
                let poly_nm = ((&s_nm + 1.0)? + (&r2_nm * (5.0 / 3.0))?)?;
                (poly_nm * s_nm.neg()?.exp()?)?
            }
        };

        k_nm.broadcast_mul(&self.outputscale_tensor()?)
    }

    fn diagonal(&self, x_nd: &Tensor) -> Result<Tensor> {
        let n = x_nd.dim(0)?;
        Tensor::ones(n, x_nd.dtype(), x_nd.device())?.broadcast_mul(&self.outputscale_tensor()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn points(dev: &Device) -> Result<Tensor> {
        Tensor::from_vec(
            vec![0.0f64, 0.0, 0.5, 0.1, -0.3, 0.8, 1.2, -0.4, 0.9, 0.9],
            (5, 2),
            dev,
        )
    }

    #[test]
    fn symmetric_with_nonnegative_diagonal() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = points(&dev)?;

        for kind in [
            KernelKind::SquaredExponential,
            KernelKind::Matern32,
            KernelKind::Matern52,
        ] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
            let kernel = Kernel::new(kind, 0.7, 1.3, vb)?;

            let k = kernel.covariance(&x, &x)?.to_vec2::<f64>()?;
            for i in 0..5 {
                assert!(k[i][i] >= 0.0);
                for j in 0..5 {
                    approx::assert_abs_diff_eq!(k[i][j], k[j][i], epsilon = 1e-12);
                    assert!(k[i][j] <= k[i][i] + 1e-12);
                }
            }

            let d = kernel.diagonal(&x)?.to_vec1::<f64>()?;
            for (i, &di) in d.iter().enumerate() {
                approx::assert_abs_diff_eq!(di, k[i][i], epsilon = 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn squared_exponential_value() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        let kernel = Kernel::new(KernelKind::SquaredExponential, 2.0, 3.0, vb)?;

        let x = Tensor::from_vec(vec![0.0f64, 0.0], (1, 2), &dev)?;
        let y = Tensor::from_vec(vec![1.0f64, 1.0], (1, 2), &dev)?;
        let k = kernel.covariance(&x, &y)?.to_vec2::<f64>()?;

        // r² = 2 / ℓ² = 0.5
        approx::assert_abs_diff_eq!(k[0][0], 3.0 * (-0.25_f64).exp(), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(kernel.lengthscale()?, 2.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(kernel.outputscale()?, 3.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn rejects_non_positive_hyperparameters() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        assert!(Kernel::new(KernelKind::Matern52, 0.0, 1.0, vb.clone()).is_err());
        assert!(Kernel::new(KernelKind::Matern52, 1.0, -1.0, vb).is_err());
    }
}
